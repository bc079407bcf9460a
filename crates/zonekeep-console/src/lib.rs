use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

pub mod marker;

const MACHINE_NAME_MAX_LEN: usize = 64;

/// Zone name accepted by the console endpoints.
///
/// Names start with an ASCII letter or digit and continue with letters,
/// digits, `-`, `_` or `.`; at most 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineName(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid machine name: {0:?}")]
pub struct InvalidMachineName(pub String);

impl MachineName {
    pub fn parse(raw: &str) -> Result<Self, InvalidMachineName> {
        let name = raw.trim();
        let mut chars = name.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !first_ok || !rest_ok || name.len() > MACHINE_NAME_MAX_LEN {
            return Err(InvalidMachineName(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MachineName {
    type Error = InvalidMachineName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MachineName> for String {
    fn from(value: MachineName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Active,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A console server process the registry knows about.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsoleSession {
    pub machine: MachineName,
    pub pid: u32,
    pub port: u16,
    pub command: String,
    pub bind_address: String,
    pub created_at: DateTime<Utc>,
}

impl ConsoleSession {
    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Whether `now` is still within `grace` of the spawn time.
    pub fn within_grace(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now.signed_duration_since(self.created_at) < grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_name_accepts_zone_style_names() {
        for ok in ["web01", "db-primary", "a", "zone_1.internal"] {
            assert_eq!(MachineName::parse(ok).unwrap().as_str(), ok);
        }
    }

    #[test]
    fn machine_name_rejects_paths_and_garbage() {
        let long = "a".repeat(65);
        for bad in ["", "-web", "../etc", "web 01", "web/01", long.as_str()] {
            assert!(MachineName::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn status_displays_as_stored_column_value() {
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
        assert_eq!(SessionStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn grace_window_is_relative_to_created_at() {
        let now = Utc::now();
        let session = ConsoleSession {
            machine: MachineName::parse("web01").unwrap(),
            pid: 10,
            port: 8000,
            command: "zadm vnc".to_string(),
            bind_address: "0.0.0.0".to_string(),
            created_at: now - chrono::Duration::seconds(30),
        };
        assert!(session.within_grace(now, chrono::Duration::seconds(120)));
        assert!(!session.within_grace(now, chrono::Duration::seconds(10)));
    }
}
