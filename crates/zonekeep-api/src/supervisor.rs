//! Console process lifecycle: start, stop, inspect.
//!
//! Per machine: `none -> spawning -> verifying -> active -> stopped | failed`.
//! Concurrent starts for the same machine are serialized by a per-machine gate;
//! different machines never wait on each other.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use zonekeep_console::{ConsoleSession, MachineName, SessionStatus};

use crate::asset_cache::AssetCache;
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, format_error_chain};
use crate::launcher::{ConsoleExit, ConsoleLauncher, ExitWatch, exit_status, wait_for_exit};
use crate::port_alloc::PortAllocator;
use crate::process_table::{ProcessTable, find_console_processes};
use crate::registry::SessionRegistry;
use crate::session_store::{SessionRecord, SessionStore};
use crate::signature::ConsoleSignature;
use crate::state::console_client;
use crate::zones::{MachineInventory, MachineState};

/// Host recorded on session records; the proxy always dials consoles here.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// OS-facing seams the supervisor drives.
pub struct Collaborators {
    pub inventory: Arc<dyn MachineInventory>,
    pub processes: Arc<dyn ProcessTable>,
    pub launcher: Arc<dyn ConsoleLauncher>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub machine: String,
    pub pid: u32,
    pub port: u16,
    pub status: SessionStatus,
    pub reused: bool,
    pub console_url: String,
    pub proxy_url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub machine: String,
    pub pid: u32,
    pub port: u16,
    pub command: String,
    pub status: String,
    pub console_url: String,
    pub proxy_url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub machine: String,
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy)]
struct HealthPolicy {
    initial_delay: Duration,
    retries: u32,
    interval: Duration,
    request_timeout: Duration,
}

#[derive(Clone)]
pub struct ConsoleSupervisor {
    inventory: Arc<dyn MachineInventory>,
    processes: Arc<dyn ProcessTable>,
    launcher: Arc<dyn ConsoleLauncher>,
    signature: ConsoleSignature,
    registry: SessionRegistry,
    store: SessionStore,
    ports: PortAllocator,
    cache: Arc<AssetCache>,
    http: reqwest::Client,
    bind_address: String,
    public_host: String,
    settle_delay: Duration,
    health: HealthPolicy,
    gates: Arc<Mutex<GateMap>>,
}

type GateMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive hold on one machine's start gate. The map entry is dropped with
/// the last holder.
struct GateLease {
    gates: Arc<Mutex<GateMap>>,
    key: String,
    gate: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for GateLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) == 2 {
            map.remove(&self.key);
        }
    }
}

pub fn proxy_url(machine: &MachineName) -> String {
    format!("/zones/{machine}/vnc/console/")
}

fn spawn_failed(exit: &ConsoleExit) -> ConsoleError {
    ConsoleError::SpawnFailed {
        exit: exit.describe(),
        stderr: exit.stderr_tail.clone(),
    }
}

fn parse_machine(raw: &str) -> Result<MachineName, ConsoleError> {
    MachineName::parse(raw).map_err(|e| ConsoleError::InvalidMachine(e.0))
}

impl ConsoleSupervisor {
    pub fn new(
        config: &ConsoleConfig,
        parts: Collaborators,
        registry: SessionRegistry,
        store: SessionStore,
        cache: Arc<AssetCache>,
    ) -> anyhow::Result<Self> {
        let signature = ConsoleSignature::new(config.console_command.clone());
        let ports = PortAllocator::new(
            config.port_range(),
            config.bind_address.clone(),
            parts.processes.clone(),
            signature.clone(),
            store.clone(),
        );
        let http = console_client(config.upstream_timeout)?;

        Ok(Self {
            inventory: parts.inventory,
            processes: parts.processes,
            launcher: parts.launcher,
            signature,
            registry,
            store,
            ports,
            cache,
            http,
            bind_address: config.bind_address.clone(),
            public_host: config.public_host.clone(),
            settle_delay: config.settle_delay,
            health: HealthPolicy {
                initial_delay: config.health_initial_delay,
                retries: config.health_retries.max(1),
                interval: config.health_interval,
                request_timeout: config.health_request_timeout,
            },
            gates: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn lock_machine(&self, machine: &MachineName) -> GateLease {
        let gate = {
            let mut map = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(machine.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let mut lease = GateLease {
            gates: self.gates.clone(),
            key: machine.to_string(),
            gate: gate.clone(),
            guard: None,
        };
        lease.guard = Some(gate.lock_owned().await);
        lease
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn console_url(&self, port: u16) -> String {
        format!("http://{}:{port}/", self.public_host)
    }

    async fn ensure_running(&self, machine: &MachineName) -> Result<(), ConsoleError> {
        match self.inventory.state(machine).await? {
            MachineState::Running => Ok(()),
            MachineState::NotRunning(state) => Err(ConsoleError::MachineNotRunning {
                machine: machine.to_string(),
                state,
            }),
            MachineState::Missing => Err(ConsoleError::MachineNotFound(machine.to_string())),
        }
    }

    fn outcome(&self, session: &ConsoleSession, reused: bool) -> StartOutcome {
        StartOutcome {
            machine: session.machine.to_string(),
            pid: session.pid,
            port: session.port,
            status: SessionStatus::Active,
            reused,
            console_url: self.console_url(session.port),
            proxy_url: proxy_url(&session.machine),
            created_at: session.created_at_rfc3339(),
        }
    }

    pub async fn start(&self, raw: &str) -> Result<StartOutcome, ConsoleError> {
        let machine = parse_machine(raw)?;
        self.ensure_running(&machine).await?;

        let _lease = self.lock_machine(&machine).await;

        if let Some(session) = self.registry.get_session_info(&machine).await {
            tracing::debug!(%machine, pid = session.pid, port = session.port, "reusing console session");
            return Ok(self.outcome(&session, true));
        }

        self.kill_strays(&machine).await;
        let port = self.ports.find_available_port().await?;

        let launched = self
            .launcher
            .launch(&machine, &self.bind_address, port)
            .await
            .map_err(|err| ConsoleError::SpawnFailed {
                exit: "not started".to_string(),
                stderr: format_error_chain(&err),
            })?;
        let pid = launched.pid;
        tracing::info!(%machine, pid, port, "console server spawned");

        let session = self
            .registry
            .write_session_info(&machine, pid, &launched.command, port, Some(launched.exit.clone()))
            .await;
        if let Err(err) = self
            .store
            .replace(&machine, port, LOOPBACK_HOST, pid, SessionStatus::Connecting)
            .await
        {
            tracing::warn!(%err, %machine, "failed to record connecting session");
        }
        self.watch_exit(machine.clone(), pid, launched.exit.clone());

        if let Err(err) = self.verify(&machine, pid, port, &launched.exit).await {
            tracing::warn!(%machine, pid, port, code = err.code(), "console server failed to come up");
            self.cleanup(&machine, pid).await;
            return Err(err);
        }

        if let Err(err) = self
            .store
            .replace(&machine, port, LOOPBACK_HOST, pid, SessionStatus::Active)
            .await
        {
            tracing::warn!(%err, %machine, "failed to record active session");
        }

        let cache = self.cache.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            cache.warm(port, &http).await;
        });

        tracing::info!(%machine, pid, port, "console session active");
        Ok(self.outcome(&session, false))
    }

    /// Kills every console process bound to `machine`, tracked or not.
    async fn kill_strays(&self, machine: &MachineName) {
        let matches = match find_console_processes(self.processes.as_ref(), &self.signature).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, %machine, "process listing failed; cannot clear stray consoles");
                Vec::new()
            }
        };

        let mut killed = 0;
        for m in matches.iter().filter(|m| m.machine == machine.as_str()) {
            match self.processes.kill(m.pid).await {
                Ok(()) => killed += 1,
                Err(err) => tracing::warn!(%err, %machine, pid = m.pid, "failed to kill stray console"),
            }
        }
        if killed > 0 {
            tracing::info!(%machine, killed, "killed stray console processes");
            tokio::time::sleep(self.settle_delay).await;
        }
        self.registry.forget(machine.as_str()).await;
    }

    fn watch_exit(&self, machine: MachineName, pid: u32, exit: ExitWatch) {
        let registry = self.registry.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let Some(exit) = wait_for_exit(exit).await else {
                return;
            };
            tracing::info!(%machine, pid, exit = %exit.describe(), "console server exited");
            registry.forget_if_pid(machine.as_str(), pid).await;
            if let Err(err) = store.mark_exited(machine.as_str(), pid).await {
                tracing::warn!(%err, %machine, "failed to mark exited session");
            }
        });
    }

    async fn verify(
        &self,
        machine: &MachineName,
        pid: u32,
        port: u16,
        exit: &ExitWatch,
    ) -> Result<(), ConsoleError> {
        tokio::time::sleep(self.health.initial_delay).await;
        if let Some(e) = exit_status(exit) {
            return Err(spawn_failed(&e));
        }

        let url = format!("http://{LOOPBACK_HOST}:{port}/");
        let mut answered = false;
        for attempt in 1..=self.health.retries {
            if let Some(e) = exit_status(exit) {
                return Err(spawn_failed(&e));
            }
            match self
                .http
                .get(&url)
                .timeout(self.health.request_timeout)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    answered = true;
                    break;
                }
                Ok(resp) => {
                    tracing::debug!(status = %resp.status(), %machine, attempt, "console not ready yet");
                }
                Err(err) => tracing::debug!(%err, %machine, attempt, "console health probe failed"),
            }
            if attempt < self.health.retries {
                tokio::time::sleep(self.health.interval).await;
            }
        }

        if !answered {
            return Err(ConsoleError::HealthCheckTimeout {
                port,
                attempts: self.health.retries,
            });
        }
        if !self.registry.verify_alive_strict(machine).await {
            return Err(ConsoleError::ImmediateDeath { pid });
        }
        Ok(())
    }

    async fn cleanup(&self, machine: &MachineName, pid: u32) {
        if let Err(err) = self.processes.kill(pid).await {
            tracing::warn!(%err, %machine, pid, "failed to kill console after startup failure");
        }
        self.registry.forget_if_pid(machine.as_str(), pid).await;
        if let Err(err) = self
            .store
            .set_status_if_pid(machine.as_str(), pid, SessionStatus::Failed)
            .await
        {
            tracing::warn!(%err, %machine, "failed to mark session failed");
        }
    }

    pub async fn stop(&self, raw: &str) -> Result<StopOutcome, ConsoleError> {
        let machine = parse_machine(raw)?;
        let _lease = self.lock_machine(&machine).await;

        if !self.registry.kill_session(&machine).await? {
            return Err(ConsoleError::SessionNotFound(machine.to_string()));
        }
        if let Err(err) = self.store.set_status(&machine, SessionStatus::Stopped).await {
            tracing::warn!(%err, %machine, "failed to mark session stopped");
        }
        Ok(StopOutcome {
            machine: machine.to_string(),
            stopped: true,
        })
    }

    pub async fn info(&self, raw: &str) -> Result<SessionView, ConsoleError> {
        let machine = parse_machine(raw)?;
        let Some(session) = self.registry.get_session_info(&machine).await else {
            return Err(ConsoleError::SessionNotFound(machine.to_string()));
        };

        if let Err(err) = self.store.touch(&machine).await {
            tracing::debug!(%err, %machine, "failed to touch session record");
        }
        let status = match self.store.find(&machine).await {
            Ok(Some(record)) if record.pid == i64::from(session.pid) => record.status,
            Ok(_) => SessionStatus::Active.to_string(),
            Err(err) => {
                tracing::debug!(%err, %machine, "failed to load session record");
                SessionStatus::Active.to_string()
            }
        };

        Ok(SessionView {
            machine: machine.to_string(),
            pid: session.pid,
            port: session.port,
            command: session.command.clone(),
            status,
            console_url: self.console_url(session.port),
            proxy_url: proxy_url(&machine),
            created_at: session.created_at_rfc3339(),
        })
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>, ConsoleError> {
        Ok(self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(SessionRecord::from)
            .collect())
    }

    /// Starts consoles for every running zone that boots with the host.
    pub async fn autostart(&self) -> anyhow::Result<usize> {
        let machines = self.inventory.autoboot_running().await?;
        let mut started = 0;
        for machine in machines {
            match self.start(machine.as_str()).await {
                Ok(out) => {
                    started += 1;
                    tracing::info!(%machine, port = out.port, reused = out.reused, "autostarted console");
                }
                Err(err) => tracing::warn!(%machine, %err, "console autostart failed"),
            }
        }
        Ok(started)
    }
}
