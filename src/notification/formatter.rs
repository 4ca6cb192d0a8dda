//! Message body rendering
//!
//! Templates use `{placeholder}` fields, one line per alarm:
//!
//! | placeholder      | value                                             |
//! |------------------|---------------------------------------------------|
//! | `{alarm_type}`   | alarm type as reported                            |
//! | `{timestamp}`    | raw source timestamp                              |
//! | `{site_name}`    | full site name, e.g. `LHR9147__S_RajputPark`      |
//! | `{site_code}`    | `LHR9147`                                         |
//! | `{severity}`     | source severity                                   |
//! | `{mbu}`          | owning MBU, or the destination id when unknown    |
//! | `{ring_id}`      | ring id, `#N/A` when missing                      |
//! | `{b2s_id}`       | secondary (B2S / OMO) site id                     |
//!
//! `{destination}` and `{secondary_id}` are accepted as aliases of `{mbu}`
//! and `{b2s_id}`.

use std::fmt;
use tracing::warn;

use crate::alarm::{Alarm, Destination};

const MISSING_RING_ID: &str = "#N/A";

/// Template referenced a field that does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlaceholder(pub String);

impl fmt::Display for UnknownPlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown placeholder {{{}}}", self.0)
    }
}

impl std::error::Error for UnknownPlaceholder {}

/// Render one alarm line.
pub fn render_line(
    template: &str,
    alarm: &Alarm,
    destination: &Destination,
) -> Result<String, UnknownPlaceholder> {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // No closing brace: keep the remainder literally
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &after[..close];
        match field(name, alarm, destination) {
            Some(value) => out.push_str(&value),
            None => return Err(UnknownPlaceholder(name.to_string())),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render a whole batch, one line per alarm.
///
/// A template with an unknown placeholder is logged once and the batch is
/// rendered with the fallback `type<TAB>timestamp<TAB>site name` layout.
pub fn render_batch(template: &str, alarms: &[Alarm], destination: &Destination) -> String {
    let mut lines = Vec::with_capacity(alarms.len());
    for alarm in alarms {
        match render_line(template, alarm, destination) {
            Ok(line) => lines.push(line),
            Err(e) => {
                warn!(
                    destination = %destination,
                    template = %template,
                    error = %e,
                    "Template error, using fallback format"
                );
                return alarms.iter().map(fallback_line).collect::<Vec<_>>().join("\n");
            }
        }
    }
    lines.join("\n")
}

/// Line used when a template cannot be rendered
pub fn fallback_line(alarm: &Alarm) -> String {
    format!(
        "{}\t{}\t{}",
        alarm.alarm_type, alarm.timestamp_raw, alarm.site_name
    )
}

/// First `max_chars` characters of the first line, with an ellipsis when cut
pub fn preview(body: &str, max_chars: usize) -> String {
    let first = body.lines().next().unwrap_or("");
    let cut = body.lines().nth(1).is_some() || first.chars().count() > max_chars;
    if !cut {
        return first.to_string();
    }
    let mut out: String = first.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn field(name: &str, alarm: &Alarm, destination: &Destination) -> Option<String> {
    let value = match name {
        "alarm_type" => alarm.alarm_type.clone(),
        "timestamp" => alarm.timestamp_raw.clone(),
        "site_name" => alarm.site_name.clone(),
        "site_code" => alarm.site_code.clone(),
        "severity" => alarm.severity.clone(),
        "mbu" | "destination" => {
            if alarm.mbu.is_empty() {
                destination.id.clone()
            } else {
                alarm.mbu.clone()
            }
        }
        "ring_id" => alarm
            .ring_id
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| MISSING_RING_ID.to_string()),
        "b2s_id" | "secondary_id" => alarm.destination_id.clone().unwrap_or_default(),
        _ => return None,
    };
    Some(value)
}
