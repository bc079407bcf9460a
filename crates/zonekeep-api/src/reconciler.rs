use std::{sync::Arc, time::Duration};

use serde::Serialize;
use zonekeep_console::{MachineName, SessionStatus};

use crate::process_table::{ProcessTable, find_console_processes};
use crate::registry::SessionRegistry;
use crate::session_store::SessionStore;
use crate::signature::ConsoleSignature;

const RECORD_PROBE_ATTEMPTS: u32 = 3;
const RECORD_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const RECORD_PROBE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StartupReport {
    pub orphans_killed: usize,
    pub demoted: usize,
    /// `connecting` records left behind by a start that never finished.
    pub abandoned: usize,
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_stopped: usize,
    pub deleted: u64,
}

/// Brings the process table, the registry and the session records back in line.
#[derive(Clone)]
pub struct Reconciler {
    processes: Arc<dyn ProcessTable>,
    signature: ConsoleSignature,
    registry: SessionRegistry,
    store: SessionStore,
    http: reqwest::Client,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Reconciler {
    pub fn new(
        processes: Arc<dyn ProcessTable>,
        signature: ConsoleSignature,
        registry: SessionRegistry,
        store: SessionStore,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            processes,
            signature,
            registry,
            store,
            http: reqwest::Client::new(),
            idle_timeout,
            sweep_interval,
        }
    }

    async fn responds(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{host}:{port}/");
        for attempt in 1..=RECORD_PROBE_ATTEMPTS {
            if self
                .http
                .get(&url)
                .timeout(RECORD_PROBE_TIMEOUT)
                .send()
                .await
                .is_ok()
            {
                return true;
            }
            if attempt < RECORD_PROBE_ATTEMPTS {
                tokio::time::sleep(RECORD_PROBE_BACKOFF).await;
            }
        }
        false
    }

    /// A start interrupted by a restart leaves its record `connecting`; its
    /// console was never verified, so it is killed and the record stopped.
    async fn abandon_unfinished_starts(&self) -> anyhow::Result<usize> {
        let mut abandoned = 0;
        for record in self.store.list_by_status(SessionStatus::Connecting).await? {
            let pid = u32::try_from(record.pid).unwrap_or_default();
            if let Ok(machine) = MachineName::parse(&record.machine)
                && self.registry.peek(&machine).await.is_some_and(|s| s.pid == pid)
            {
                match self.registry.kill_session(&machine).await {
                    Ok(killed) => tracing::info!(%machine, pid, killed, "killed unverified console"),
                    Err(err) => tracing::warn!(%err, %machine, pid, "failed to kill unverified console"),
                }
            }
            abandoned += self
                .store
                .set_status_if_pid(&record.machine, pid, SessionStatus::Stopped)
                .await? as usize;
        }
        Ok(abandoned)
    }

    /// Stops unfinished starts, kills console processes nobody tracks and
    /// demotes active records whose console no longer answers.
    pub async fn startup_sweep(&self) -> anyhow::Result<StartupReport> {
        let mut report = StartupReport {
            abandoned: self.abandon_unfinished_starts().await?,
            ..StartupReport::default()
        };
        let active = self.store.list_by_status(SessionStatus::Active).await?;

        let mut tracked = self.registry.tracked_machines().await?;
        tracked.extend(active.iter().map(|r| r.machine.clone()));

        match find_console_processes(self.processes.as_ref(), &self.signature).await {
            Ok(matches) => {
                for m in matches.iter().filter(|m| !tracked.contains(&m.machine)) {
                    match self.processes.kill(m.pid).await {
                        Ok(()) => {
                            report.orphans_killed += 1;
                            tracing::info!(machine = %m.machine, pid = m.pid, port = m.port, "killed orphaned console");
                        }
                        Err(err) => {
                            tracing::warn!(%err, machine = %m.machine, pid = m.pid, "failed to kill orphaned console")
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "process listing failed; skipping orphan sweep"),
        }

        for record in active {
            let Ok(port) = u16::try_from(record.port) else {
                continue;
            };
            if self.responds(&record.host, port).await {
                continue;
            }
            let pid = u32::try_from(record.pid).unwrap_or_default();
            self.store
                .set_status_if_pid(&record.machine, pid, SessionStatus::Stopped)
                .await?;
            report.demoted += 1;
            tracing::info!(machine = %record.machine, port, "demoted unresponsive console session");
        }

        Ok(report)
    }

    /// Stops consoles idle past the timeout and deletes stopped records.
    pub async fn periodic_sweep(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.idle_timeout).unwrap_or_else(|_| chrono::Duration::days(7));

        for record in self.store.list_by_status(SessionStatus::Active).await? {
            if record.last_accessed_at >= cutoff {
                continue;
            }
            if let Ok(machine) = MachineName::parse(&record.machine) {
                match self.registry.kill_session(&machine).await {
                    Ok(killed) => tracing::info!(%machine, killed, "stopping idle console session"),
                    Err(err) => tracing::warn!(%err, %machine, "failed to kill idle console"),
                }
            }
            let pid = u32::try_from(record.pid).unwrap_or_default();
            report.idle_stopped += self
                .store
                .set_status_if_pid(&record.machine, pid, SessionStatus::Stopped)
                .await? as usize;
        }

        report.deleted = self.store.delete_by_status(SessionStatus::Stopped).await?;
        Ok(report)
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.sweep_interval).await;
                match self.periodic_sweep().await {
                    Ok(report) if report.idle_stopped > 0 || report.deleted > 0 => {
                        tracing::info!(idle_stopped = report.idle_stopped, deleted = report.deleted, "console sweep");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(%err, "console sweep failed"),
                }
            }
        });
    }
}
