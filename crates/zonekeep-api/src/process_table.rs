use std::time::Duration;

use async_trait::async_trait;

use crate::command;
use crate::signature::{ConsoleProcessMatch, ConsoleSignature};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command_line: String,
}

/// Structured view of the host process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<ProcessInfo>>;

    /// `Ok(false)` means the pid is definitely gone; errors are ambiguous.
    async fn is_alive(&self, pid: u32) -> anyhow::Result<bool>;

    /// Forceful, privileged termination. Killing an already-gone pid succeeds.
    async fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

pub async fn find_console_processes(
    table: &dyn ProcessTable,
    signature: &ConsoleSignature,
) -> anyhow::Result<Vec<ConsoleProcessMatch>> {
    let procs = table.list().await?;
    Ok(procs
        .iter()
        .filter_map(|p| signature.parse(p.pid, &p.command_line))
        .collect())
}

pub(crate) fn parse_ps_output(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, rest) = line.split_once(char::is_whitespace)?;
            // Header line ("PID ARGS" / "PID COMMAND") fails this parse.
            let pid = pid.parse::<u32>().ok()?;
            Some(ProcessInfo {
                pid,
                command_line: rest.trim().to_string(),
            })
        })
        .collect()
}

/// Process table backed by `ps` and `kill(2)`.
#[derive(Debug, Clone)]
pub struct SystemProcessTable {
    elevate_command: Option<String>,
    command_timeout: Duration,
}

impl SystemProcessTable {
    pub fn new(elevate_command: Option<String>, command_timeout: Duration) -> Self {
        Self {
            elevate_command,
            command_timeout,
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
    };
    if pid <= 0 {
        return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
    }
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn list(&self) -> anyhow::Result<Vec<ProcessInfo>> {
        let out = command::run("ps", &["-eo", "pid,args"], self.command_timeout).await?;
        if !out.success {
            anyhow::bail!("ps failed ({:?}): {}", out.code, out.stderr.trim());
        }
        Ok(parse_ps_output(&out.stdout))
    }

    #[cfg(unix)]
    async fn is_alive(&self, pid: u32) -> anyhow::Result<bool> {
        match signal_pid(pid, 0) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
            // Exists, owned by someone else.
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(true),
            Err(e) => Err(anyhow::anyhow!("probe pid {pid}: {e}")),
        }
    }

    #[cfg(not(unix))]
    async fn is_alive(&self, pid: u32) -> anyhow::Result<bool> {
        let procs = self.list().await?;
        Ok(procs.iter().any(|p| p.pid == pid))
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        if let Some(elevate) = &self.elevate_command {
            let pid_s = pid.to_string();
            let out = command::run(elevate, &["kill", "-9", &pid_s], self.command_timeout).await?;
            if out.success || !self.is_alive(pid).await.unwrap_or(true) {
                return Ok(());
            }
            anyhow::bail!("{elevate} kill -9 {pid} failed: {}", out.stderr.trim());
        }

        direct_kill(pid)
    }
}

#[cfg(unix)]
fn direct_kill(pid: u32) -> anyhow::Result<()> {
    match signal_pid(pid, libc::SIGKILL) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("kill -9 {pid}: {e}")),
    }
}

#[cfg(not(unix))]
fn direct_kill(pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("no elevation command configured to kill pid {pid}")
}
