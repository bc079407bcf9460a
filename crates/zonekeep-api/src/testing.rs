//! Fakes for the OS-facing seams, shared by the unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    Router,
    extract::ws::{Message, WebSocketUpgrade},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use zonekeep_console::MachineName;

use crate::asset_cache::{AssetCache, Clock, SystemClock};
use crate::config::ConsoleConfig;
use crate::launcher::{ConsoleExit, ConsoleLauncher, LaunchedConsole};
use crate::process_table::{ProcessInfo, ProcessTable};
use crate::registry::{LivenessPolicy, SessionRegistry};
use crate::session_store::SessionStore;
use crate::signature::ConsoleSignature;
use crate::state::{AppState, console_client};
use crate::supervisor::{Collaborators, ConsoleSupervisor};
use crate::zones::{MachineInventory, MachineState};

type KillHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct FakeProcessTable {
    procs: Mutex<BTreeMap<u32, String>>,
    killed: Mutex<Vec<u32>>,
    hooks: Mutex<HashMap<u32, KillHook>>,
    fail_probes: AtomicBool,
    fail_list: AtomicBool,
}

impl FakeProcessTable {
    pub(crate) fn insert(&self, pid: u32, command_line: &str) {
        self.procs
            .lock()
            .unwrap()
            .insert(pid, command_line.to_string());
    }

    pub(crate) fn on_kill(&self, pid: u32, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().insert(pid, Box::new(hook));
    }

    /// The process dies on its own.
    pub(crate) fn crash(&self, pid: u32) {
        self.procs.lock().unwrap().remove(&pid);
        let hook = self.hooks.lock().unwrap().remove(&pid);
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        self.procs.lock().unwrap().keys().copied().collect()
    }

    pub(crate) fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessTable for FakeProcessTable {
    async fn list(&self) -> anyhow::Result<Vec<ProcessInfo>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("ps unavailable");
        }
        Ok(self
            .procs
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, cmd)| ProcessInfo {
                pid: *pid,
                command_line: cmd.clone(),
            })
            .collect())
    }

    async fn is_alive(&self, pid: u32) -> anyhow::Result<bool> {
        if self.fail_probes.load(Ordering::SeqCst) {
            anyhow::bail!("probe failed");
        }
        Ok(self.procs.lock().unwrap().contains_key(&pid))
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.killed.lock().unwrap().push(pid);
        self.crash(pid);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchBehavior {
    /// Serves a console backend on the requested port.
    Serve,
    /// Exits with status 1 before the first health probe.
    ExitAtOnce,
    /// Stays alive but never accepts connections.
    NeverAnswer,
    /// Serves, but is gone from the process table.
    Vanish,
    /// Accepts requests but answers every one with 500.
    ServeErrors,
}

pub(crate) struct FakeLauncher {
    table: Arc<FakeProcessTable>,
    signature: ConsoleSignature,
    next_pid: AtomicU32,
    behavior: Mutex<LaunchBehavior>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub(crate) fn new(table: Arc<FakeProcessTable>) -> Self {
        Self {
            table,
            signature: ConsoleSignature::new("zadm"),
            next_pid: AtomicU32::new(4321),
            behavior: Mutex::new(LaunchBehavior::Serve),
            launches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_behavior(&self, behavior: LaunchBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

fn killed_exit() -> Option<ConsoleExit> {
    Some(ConsoleExit {
        code: None,
        stderr_tail: String::new(),
    })
}

#[async_trait]
impl ConsoleLauncher for FakeLauncher {
    async fn launch(
        &self,
        machine: &MachineName,
        bind_address: &str,
        port: u16,
    ) -> anyhow::Result<LaunchedConsole> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let command_line = format!(
            "{} {}",
            self.signature.program(),
            self.signature.args(bind_address, port, machine.as_str()).join(" ")
        );
        let (tx, rx) = watch::channel(None);
        let behavior = *self.behavior.lock().unwrap();

        match behavior {
            LaunchBehavior::ExitAtOnce => {
                let _ = tx.send(Some(ConsoleExit {
                    code: Some(1),
                    stderr_tail: format!("zadm: {machine}: no vnc device configured"),
                }));
            }
            LaunchBehavior::NeverAnswer => {
                self.table.insert(pid, &command_line);
                self.table.on_kill(pid, move || {
                    let _ = tx.send(killed_exit());
                });
            }
            LaunchBehavior::Serve | LaunchBehavior::Vanish | LaunchBehavior::ServeErrors => {
                let listener = TcpListener::bind(("127.0.0.1", port)).await?;
                let server = if behavior == LaunchBehavior::ServeErrors {
                    spawn_failing_backend(listener)
                } else {
                    spawn_console_backend(listener)
                };
                if behavior != LaunchBehavior::Vanish {
                    self.table.insert(pid, &command_line);
                }
                self.table.on_kill(pid, move || {
                    server.abort();
                    let _ = tx.send(killed_exit());
                });
            }
        }

        Ok(LaunchedConsole {
            pid,
            command: self.signature.command_tag(),
            exit: rx,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeInventory {
    machines: Mutex<HashMap<String, MachineState>>,
    autoboot: Mutex<Vec<String>>,
}

impl FakeInventory {
    pub(crate) fn set(&self, machine: &str, state: MachineState) {
        self.machines
            .lock()
            .unwrap()
            .insert(machine.to_string(), state);
    }

    pub(crate) fn set_autoboot(&self, machine: &str) {
        self.set(machine, MachineState::Running);
        self.autoboot.lock().unwrap().push(machine.to_string());
    }
}

#[async_trait]
impl MachineInventory for FakeInventory {
    async fn state(&self, machine: &MachineName) -> anyhow::Result<MachineState> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .get(machine.as_str())
            .cloned()
            .unwrap_or(MachineState::Missing))
    }

    async fn autoboot_running(&self) -> anyhow::Result<Vec<MachineName>> {
        Ok(self
            .autoboot
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| MachineName::parse(m).ok())
            .collect())
    }
}

pub(crate) struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }
}

impl ManualClock {
    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

pub(crate) async fn memory_db() -> Arc<DatabaseConnection> {
    let db = zonekeep_db::connect("sqlite::memory:").await.unwrap();
    zonekeep_migration::Migrator::up(&db, None).await.unwrap();
    Arc::new(db)
}

pub(crate) async fn memory_store() -> SessionStore {
    SessionStore::new(memory_db().await)
}

/// A port that was free a moment ago.
pub(crate) async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().port()
}

async fn echo_ws(ws: WebSocketUpgrade) -> Response {
    ws.protocols(["binary"])
        .on_upgrade(|mut socket| async move {
            while let Some(Ok(msg)) = socket.recv().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
        })
        .into_response()
}

/// Minimal stand-in for a console server: an index page, two assets and a
/// WebSocket echo endpoint at `/websockify`.
pub(crate) fn spawn_console_backend(listener: TcpListener) -> JoinHandle<()> {
    let app = Router::new()
        .route("/", get(|| async { Html("<html><title>noVNC</title></html>") }))
        .route(
            "/core/rfb.js",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/javascript")],
                    "export default class RFB {}",
                )
            }),
        )
        .route(
            "/app/ui.js",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/javascript")],
                    "x".repeat(4096),
                )
            }),
        )
        .route("/websockify", get(echo_ws));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    })
}

/// A console server that is up but broken.
pub(crate) fn spawn_failing_backend(listener: TcpListener) -> JoinHandle<()> {
    let app = Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    })
}

/// Accepts connections and never answers on them.
pub(crate) fn spawn_stalled_backend(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    })
}

/// Console settings for tests: one loopback port and fast health checks.
pub(crate) fn console_config(marker_dir: &Path, port: u16) -> ConsoleConfig {
    ConsoleConfig {
        port_start: port,
        port_end: port,
        bind_address: "127.0.0.1".to_string(),
        marker_dir: marker_dir.to_path_buf(),
        elevate_command: None,
        settle_delay: Duration::from_millis(10),
        health_initial_delay: Duration::from_millis(10),
        health_retries: 5,
        health_interval: Duration::from_millis(20),
        health_request_timeout: Duration::from_millis(300),
        upstream_timeout: Duration::from_millis(300),
        ..ConsoleConfig::default()
    }
}

/// The full HTTP surface on a loopback port, wired to fakes.
pub(crate) struct TestApp {
    pub(crate) addr: SocketAddr,
    pub(crate) port: u16,
    pub(crate) state: AppState,
    pub(crate) launcher: Arc<FakeLauncher>,
    pub(crate) inventory: Arc<FakeInventory>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub(crate) async fn spawn() -> Self {
        Self::spawn_with_key(None).await
    }

    pub(crate) async fn spawn_with_key(api_key: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port().await;
        let config = console_config(dir.path(), port);

        let table = Arc::new(FakeProcessTable::default());
        let launcher = Arc::new(FakeLauncher::new(table.clone()));
        let inventory = Arc::new(FakeInventory::default());
        inventory.set("web01", MachineState::Running);

        let store = memory_store().await;
        let registry = SessionRegistry::new(
            &config.marker_dir,
            config.bind_address.clone(),
            table.clone(),
            LivenessPolicy {
                grace: config.grace_window,
                probe_timeout: config.probe_timeout,
            },
        );
        let cache = Arc::new(AssetCache::new(
            10,
            Duration::from_secs(60),
            4096,
            Arc::new(SystemClock),
        ));
        let supervisor = ConsoleSupervisor::new(
            &config,
            Collaborators {
                inventory: inventory.clone(),
                processes: table,
                launcher: launcher.clone(),
            },
            registry.clone(),
            store.clone(),
            cache.clone(),
        )
        .unwrap();

        let http = console_client(config.upstream_timeout).unwrap();
        let state = AppState {
            config: Arc::new(config),
            supervisor,
            registry,
            store,
            cache,
            http,
            api_key: api_key.map(Arc::from),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::console_http::router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            port,
            state,
            launcher,
            inventory,
            _dir: dir,
        }
    }
}
