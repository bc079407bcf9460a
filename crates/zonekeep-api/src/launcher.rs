use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
};
use tracing::Instrument;
use zonekeep_console::MachineName;

use crate::signature::ConsoleSignature;

const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleExit {
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl ConsoleExit {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Publishes the exit status of a spawned console once the child is reaped.
pub type ExitWatch = watch::Receiver<Option<ConsoleExit>>;

pub fn exit_status(watch: &ExitWatch) -> Option<ConsoleExit> {
    watch.borrow().clone()
}

pub async fn wait_for_exit(mut watch: ExitWatch) -> Option<ConsoleExit> {
    if let Ok(v) = watch.wait_for(|v| v.is_some()).await {
        return v.clone();
    }
    exit_status(&watch)
}

pub struct LaunchedConsole {
    pub pid: u32,
    pub command: String,
    pub exit: ExitWatch,
}

#[async_trait]
pub trait ConsoleLauncher: Send + Sync {
    async fn launch(
        &self,
        machine: &MachineName,
        bind_address: &str,
        port: u16,
    ) -> anyhow::Result<LaunchedConsole>;
}

/// Spawns the real console server, detached into its own session.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    signature: ConsoleSignature,
    elevate_command: Option<String>,
}

impl SystemLauncher {
    pub fn new(signature: ConsoleSignature, elevate_command: Option<String>) -> Self {
        Self {
            signature,
            elevate_command,
        }
    }
}

#[async_trait]
impl ConsoleLauncher for SystemLauncher {
    async fn launch(
        &self,
        machine: &MachineName,
        bind_address: &str,
        port: u16,
    ) -> anyhow::Result<LaunchedConsole> {
        let args = self.signature.args(bind_address, port, machine.as_str());
        let mut cmd = match &self.elevate_command {
            Some(elevate) => {
                let mut c = Command::new(elevate);
                c.arg(self.signature.program()).args(&args);
                c
            }
            None => {
                let mut c = Command::new(self.signature.program());
                c.args(&args);
                c
            }
        };
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // Own session: no signals from our process group, and no
                    // parent-death signal, so the console outlives restarts.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawn console server: {} {}",
                self.signature.program(),
                args.join(" ")
            )
        })?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("console server exited before reporting a pid"))?;

        let span = tracing::info_span!("console", machine = %machine, pid, port);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::<String>::new()));

        if let Some(out) = child.stdout.take() {
            tokio::spawn(
                async move {
                    let mut lines = BufReader::new(out).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(%line, "console stdout");
                    }
                }
                .instrument(span.clone()),
            );
        }

        let stderr_task = child.stderr.take().map(|err| {
            let tail = stderr_tail.clone();
            tokio::spawn(
                async move {
                    let mut lines = BufReader::new(err).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::debug!(%line, "console stderr");
                        let mut buf = tail.lock().unwrap_or_else(|e| e.into_inner());
                        buf.push_back(line);
                        while buf.len() > STDERR_TAIL_LINES {
                            buf.pop_front();
                        }
                    }
                }
                .instrument(span.clone()),
            )
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(
            async move {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(err) => {
                        tracing::warn!(%err, "wait on console server failed");
                        None
                    }
                };
                if let Some(task) = stderr_task {
                    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
                }
                let stderr_tail = {
                    let tail = stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
                    tail.iter().cloned().collect::<Vec<_>>().join("\n")
                };
                tracing::info!(?code, "console server exited");
                let _ = exit_tx.send(Some(ConsoleExit { code, stderr_tail }));
            }
            .instrument(span),
        );

        Ok(LaunchedConsole {
            pid,
            command: self.signature.command_tag(),
            exit: exit_rx,
        })
    }
}
