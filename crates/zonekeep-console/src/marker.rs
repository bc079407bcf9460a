//! On-disk session marker format.
//!
//! One file per machine, five newline-separated fields:
//! pid, command tag, RFC 3339 timestamp, machine name, `bind-address:port`.

use chrono::{DateTime, Utc};

use crate::{ConsoleSession, MachineName};

pub const MARKER_EXTENSION: &str = "pid";

const MARKER_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerError {
    #[error("marker has {0} fields, expected 5")]
    TooFewFields(usize),
    #[error("marker field `{field}` is invalid: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

pub fn encode(session: &ConsoleSession) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}:{}\n",
        session.pid,
        session.command,
        session.created_at_rfc3339(),
        session.machine,
        session.bind_address,
        session.port
    )
}

fn invalid(field: &'static str, value: &str) -> MarkerError {
    MarkerError::InvalidField {
        field,
        value: value.to_string(),
    }
}

pub fn parse(raw: &str) -> Result<ConsoleSession, MarkerError> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < MARKER_FIELDS {
        return Err(MarkerError::TooFewFields(lines.len()));
    }

    let pid = lines[0]
        .parse::<u32>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid("pid", lines[0]))?;
    let command = lines[1].to_string();
    let created_at = DateTime::parse_from_rfc3339(lines[2])
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid("timestamp", lines[2]))?;
    let machine = MachineName::parse(lines[3]).map_err(|_| invalid("machine", lines[3]))?;

    // rsplit keeps bracketed or bare IPv6 bind addresses intact.
    let (bind_address, port) = lines[4]
        .rsplit_once(':')
        .ok_or_else(|| invalid("address", lines[4]))?;
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid("port", lines[4]))?;

    Ok(ConsoleSession {
        machine,
        pid,
        port,
        command,
        bind_address: bind_address.to_string(),
        created_at,
    })
}
