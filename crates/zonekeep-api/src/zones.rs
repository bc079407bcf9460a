use std::time::Duration;

use async_trait::async_trait;
use zonekeep_console::MachineName;

use crate::command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Running,
    /// Exists but is not running (installed, configured, shutting_down, ...).
    NotRunning(String),
    Missing,
}

/// The slice of the zone model the console manager consults.
#[async_trait]
pub trait MachineInventory: Send + Sync {
    async fn state(&self, machine: &MachineName) -> anyhow::Result<MachineState>;

    /// Running zones configured to boot with the host.
    async fn autoboot_running(&self) -> anyhow::Result<Vec<MachineName>>;
}

/// Parses one `zoneadm list -p` line: `id:name:state:path:uuid:brand:ip-type`.
pub(crate) fn parse_zoneadm_line(line: &str) -> Option<(String, String)> {
    let mut fields = line.trim().split(':');
    let _id = fields.next()?;
    let name = fields.next()?.trim();
    let state = fields.next()?.trim();
    if name.is_empty() || state.is_empty() {
        return None;
    }
    Some((name.to_string(), state.to_string()))
}

pub(crate) fn parse_autoboot(zonecfg_info: &str) -> bool {
    zonecfg_info.lines().any(|l| {
        l.trim()
            .strip_prefix("autoboot:")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    })
}

#[derive(Debug, Clone)]
pub struct ZoneadmInventory {
    timeout: Duration,
}

impl ZoneadmInventory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MachineInventory for ZoneadmInventory {
    async fn state(&self, machine: &MachineName) -> anyhow::Result<MachineState> {
        let out = command::run("zoneadm", &["-z", machine.as_str(), "list", "-p"], self.timeout).await?;
        if !out.success {
            if out.stderr.to_ascii_lowercase().contains("no such zone") {
                return Ok(MachineState::Missing);
            }
            anyhow::bail!("zoneadm list failed for {machine}: {}", out.stderr.trim());
        }

        let state = out
            .stdout
            .lines()
            .filter_map(parse_zoneadm_line)
            .find(|(name, _)| name == machine.as_str())
            .map(|(_, state)| state);
        Ok(match state {
            Some(s) if s == "running" => MachineState::Running,
            Some(s) => MachineState::NotRunning(s),
            None => MachineState::Missing,
        })
    }

    async fn autoboot_running(&self) -> anyhow::Result<Vec<MachineName>> {
        let out = command::run("zoneadm", &["list", "-p"], self.timeout).await?;
        if !out.success {
            anyhow::bail!("zoneadm list failed: {}", out.stderr.trim());
        }

        let mut zones = Vec::new();
        for (name, state) in out.stdout.lines().filter_map(parse_zoneadm_line) {
            if name == "global" || state != "running" {
                continue;
            }
            let Ok(machine) = MachineName::parse(&name) else {
                continue;
            };
            let info = command::run("zonecfg", &["-z", &name, "info", "autoboot"], self.timeout).await?;
            if info.success && parse_autoboot(&info.stdout) {
                zones.push(machine);
            }
        }
        Ok(zones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoneadm_line_yields_name_and_state() {
        let line = "3:web01:running:/zones/web01:7f3c1e2a-0000-0000-0000-000000000000:bhyve:excl";
        assert_eq!(
            parse_zoneadm_line(line),
            Some(("web01".to_string(), "running".to_string()))
        );
        assert_eq!(parse_zoneadm_line("garbage"), None);
    }

    #[test]
    fn autoboot_flag_is_read_from_zonecfg_info() {
        assert!(parse_autoboot("autoboot: true\n"));
        assert!(!parse_autoboot("autoboot: false\n"));
        assert!(!parse_autoboot(""));
    }
}
