//! Operator console commands read from stdin while the relay runs
//!
//! ```text
//! <Enter> | ack        release a sender paused on a failed delivery
//! flush                flush every buffered alarm type now
//! flush <alarm type>   flush one alarm type now
//! status               queue, buffer and delivery counters
//! ```

use anyhow::{bail, Result};
use chrono::NaiveDateTime;

use crate::notification::ManualAckGate;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Acknowledge,
    Flush,
    FlushType(String),
    Status,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "" | "ack" => Ok(OperatorCommand::Acknowledge),
            "flush" if rest.is_empty() => Ok(OperatorCommand::Flush),
            "flush" => Ok(OperatorCommand::FlushType(rest.to_string())),
            "status" => Ok(OperatorCommand::Status),
            _ => bail!("unknown command '{}' (try: ack, flush [type], status)", line),
        }
    }

    /// Run the command against a live pipeline and describe the result.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        gate: Option<&ManualAckGate>,
        now: NaiveDateTime,
    ) -> String {
        match self {
            OperatorCommand::Acknowledge => match gate {
                Some(gate) if gate.acknowledge() => "Failed delivery acknowledged".to_string(),
                Some(_) => "Nothing waiting for acknowledgment".to_string(),
                None => "Running unattended, nothing to acknowledge".to_string(),
            },
            OperatorCommand::Flush => {
                format!("Flushed, {} messages queued", pipeline.force_flush(now))
            }
            OperatorCommand::FlushType(alarm_type) => {
                match pipeline.force_flush_type(alarm_type, now) {
                    0 => format!("Nothing buffered for {}", alarm_type),
                    n => format!("Flushed {}, {} messages queued", alarm_type, n),
                }
            }
            OperatorCommand::Status => {
                let pending: Vec<String> = pipeline
                    .pending_counts()
                    .iter()
                    .map(|(t, n)| format!("{} {}", t, n))
                    .collect();
                let sender = pipeline.sender();
                format!(
                    "queued {}, buffered [{}], sent {}, failed {}",
                    pipeline.queue_snapshot().len(),
                    pending.join(", "),
                    sender.sent_count(),
                    sender.failed_count()
                )
            }
        }
    }
}
