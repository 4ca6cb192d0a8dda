//! Alarm Relay CLI
//!
//! Polls alarm snapshot exports and relays new alarms to operations groups.

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use alarm_relay::{
    AlarmIngestor, DispatchOrderer, LogAndContinueGate, ManualAckGate, OperatorCommand,
    OperatorGate, Pipeline, Settings, SnapshotDirSource, StaticDirectory,
};

/// How long `run` waits for the loops after Ctrl-C
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Alarm Relay - relay network alarms to operations groups")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start polling, batching and sending until Ctrl-C
    Run {
        /// Settings file (default: ~/.config/alarm-relay/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory holding one `<source>.tsv` snapshot per alarm source
        #[arg(long)]
        snapshots: PathBuf,
        /// Site directory JSON (site code -> record)
        #[arg(long)]
        sites: PathBuf,
        /// Log messages instead of sending them
        #[arg(long)]
        dry_run: bool,
        /// Never pause for operator acknowledgment
        #[arg(long)]
        unattended: bool,
    },
    /// Parse a rows file and print the resulting alarms
    Parse {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        sites: PathBuf,
        /// Tab-separated alarm rows
        rows: PathBuf,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the messages a rows file would produce, in dispatch order
    Preview {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        sites: PathBuf,
        rows: PathBuf,
    },
    /// Print the effective configuration
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug relay run ...
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("alarm_relay=info,relay=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            snapshots,
            sites,
            dry_run,
            unattended,
        } => run(config, snapshots, sites, dry_run, unattended)?,
        Commands::Parse {
            config,
            sites,
            rows,
            json,
        } => {
            let settings = Arc::new(load_settings(config.as_deref())?);
            let directory = Arc::new(StaticDirectory::load(&sites)?);
            let lines = read_rows(&rows)?;
            let ingestor = AlarmIngestor::new(settings, directory);
            let alarms = ingestor.parse_lines(&lines, Local::now().naive_local());

            if json {
                println!("{}", serde_json::to_string_pretty(&alarms)?);
            } else {
                println!("Parsed {} alarms from {} rows:\n", alarms.len(), lines.len());
                for alarm in &alarms {
                    let destination = alarm
                        .destination()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {:<16} {:<34} {:<20} {}{}",
                        alarm.site_code,
                        alarm.alarm_type,
                        alarm.timestamp_raw,
                        destination,
                        if alarm.is_toggle { "  [toggle]" } else { "" }
                    );
                }
            }
        }
        Commands::Preview {
            config,
            sites,
            rows,
        } => {
            let settings = Arc::new(load_settings(config.as_deref())?);
            let directory = Arc::new(StaticDirectory::load(&sites)?);
            let lines = read_rows(&rows)?;
            let alarms = AlarmIngestor::new(settings.clone(), directory)
                .parse_lines(&lines, Local::now().naive_local());

            let orderer = DispatchOrderer::new(settings);
            let batches = orderer.order_batches(&alarms);
            if batches.is_empty() {
                println!("No messages would be sent");
            }
            for (i, batch) in batches.iter().enumerate() {
                let rendered = orderer.render(batch);
                println!(
                    "#{} [{}] {} ({}, {} alarms)",
                    i + 1,
                    rendered.priority,
                    rendered.group,
                    rendered.alarm_type,
                    rendered.alarm_count
                );
                println!("{}\n", rendered.body);
            }
        }
        Commands::ShowConfig { config } => {
            let settings = load_settings(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

fn run(
    config: Option<PathBuf>,
    snapshots: PathBuf,
    sites: PathBuf,
    dry_run: bool,
    unattended: bool,
) -> Result<()> {
    let settings = load_settings(config.as_deref())?;
    let directory = Arc::new(StaticDirectory::load(&sites)?);
    if directory.is_empty() {
        warn!(path = %sites.display(), "Site directory is empty, every alarm will be dropped");
    }

    let manual_gate =
        (settings.sender.operator_ack && !unattended).then(|| Arc::new(ManualAckGate::new()));
    let gate: Arc<dyn OperatorGate> = match &manual_gate {
        Some(gate) => gate.clone(),
        None => Arc::new(LogAndContinueGate),
    };

    let pipeline = Arc::new(
        Pipeline::builder(settings)
            .with_source(Arc::new(SnapshotDirSource::new(&snapshots)))
            .with_directory(directory)
            .with_gate(gate)
            .dry_run(dry_run)
            .build()?,
    );
    let handle = pipeline.start()?;

    {
        // Operator console: Enter acknowledges a failed delivery, `flush [type]` forces a flush
        let pipeline = pipeline.clone();
        thread::Builder::new()
            .name("operator-console".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    match OperatorCommand::parse(&line) {
                        Ok(command) => {
                            let reply = command.execute(
                                &pipeline,
                                manual_gate.as_deref(),
                                Local::now().naive_local(),
                            );
                            info!(?command, "{}", reply);
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
            })
            .context("Failed to spawn operator console thread")?;
    }

    info!(
        snapshots = %snapshots.display(),
        "Relay running, type `flush` or `status`, Ctrl-C to stop"
    );
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create signal runtime")?;
        runtime
            .block_on(tokio::signal::ctrl_c())
            .context("Failed to listen for Ctrl-C")?;
    }

    info!("Stopping relay");
    let pending = pipeline.queue_snapshot().len();
    if !handle.stop(STOP_TIMEOUT) {
        warn!(pending, "Relay stopped before all loops finished");
    } else if pending > 0 {
        warn!(pending, "Relay stopped with undelivered messages");
    }
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_path);
    Settings::load(&path)
}

fn read_rows(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows from {}", path.display()))?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect())
}
