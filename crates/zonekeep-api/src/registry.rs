//! Authoritative record of which console process serves which machine.
//!
//! The in-memory table is the primary read path. Marker files under the
//! marker directory are written behind every change so a restarted server can
//! rediscover consoles it spawned earlier; a marker that fails to parse is
//! deleted and treated as absent.

use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use tokio::{io::AsyncWriteExt, sync::RwLock};
use zonekeep_console::{
    ConsoleSession, MachineName,
    marker::{self, MARKER_EXTENSION},
};

use crate::launcher::{ExitWatch, exit_status};
use crate::process_table::ProcessTable;

/// How ambiguous liveness probes are judged.
///
/// Inside the grace window after spawn, a probe that times out, errors, or
/// does not find the pid still counts as alive: a fresh console may not be
/// visible yet. This can hide a console that died right after spawn for up to
/// `grace` seconds.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub grace: Duration,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Alive,
    NotFound,
    Ambiguous,
}

#[derive(Clone)]
struct RegistryEntry {
    session: ConsoleSession,
    exit: Option<ExitWatch>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
    bind_address: String,
    table: Arc<dyn ProcessTable>,
    policy: LivenessPolicy,
    sessions: Arc<RwLock<HashMap<String, RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new(
        dir: impl Into<PathBuf>,
        bind_address: impl Into<String>,
        table: Arc<dyn ProcessTable>,
        policy: LivenessPolicy,
    ) -> Self {
        Self {
            dir: dir.into(),
            bind_address: bind_address.into(),
            table,
            policy,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn marker_path(&self, machine: &str) -> PathBuf {
        self.dir.join(format!("{machine}.{MARKER_EXTENSION}"))
    }

    async fn read_marker(&self, machine: &str) -> Option<ConsoleSession> {
        let path = self.marker_path(machine);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "failed to read session marker");
                return None;
            }
        };

        match marker::parse(&raw) {
            Ok(session) if session.machine.as_str() == machine => Some(session),
            Ok(_) | Err(_) => {
                tracing::debug!(machine, path = %path.display(), "discarding corrupt session marker");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn write_marker(&self, session: &ConsoleSession) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create marker dir")?;
        let path = self.marker_path(session.machine.as_str());
        let tmp = path.with_extension(format!("{MARKER_EXTENSION}.tmp"));
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create marker tmp")?;
        f.write_all(marker::encode(session).as_bytes())
            .await
            .context("write marker tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist marker")?;
        Ok(())
    }

    async fn remove_marker(&self, machine: &str) {
        let path = self.marker_path(machine);
        if let Err(err) = tokio::fs::remove_file(&path).await
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!(%err, path = %path.display(), "failed to remove session marker");
        }
    }

    async fn load(&self, machine: &str) -> Option<RegistryEntry> {
        if let Some(e) = self.sessions.read().await.get(machine) {
            return Some(e.clone());
        }
        let session = self.read_marker(machine).await?;
        let entry = RegistryEntry {
            session,
            exit: None,
        };
        self.sessions
            .write()
            .await
            .entry(machine.to_string())
            .or_insert_with(|| entry.clone());
        Some(entry)
    }

    async fn probe(&self, pid: u32) -> Probe {
        match tokio::time::timeout(self.policy.probe_timeout, self.table.is_alive(pid)).await {
            Ok(Ok(true)) => Probe::Alive,
            Ok(Ok(false)) => Probe::NotFound,
            Ok(Err(err)) => {
                tracing::debug!(%err, pid, "liveness probe failed");
                Probe::Ambiguous
            }
            Err(_) => {
                tracing::debug!(pid, "liveness probe timed out");
                Probe::Ambiguous
            }
        }
    }

    fn grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.policy.grace).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    async fn entry_alive(&self, entry: &RegistryEntry, strict: bool) -> bool {
        if entry.exit.as_ref().is_some_and(|w| exit_status(w).is_some()) {
            return false;
        }
        match self.probe(entry.session.pid).await {
            Probe::Alive => true,
            Probe::NotFound | Probe::Ambiguous if strict => false,
            Probe::NotFound | Probe::Ambiguous => {
                entry.session.within_grace(Utc::now(), self.grace())
            }
        }
    }

    /// Returns the live session for `machine`, dropping it if its process is gone.
    pub async fn get_session_info(&self, machine: &MachineName) -> Option<ConsoleSession> {
        let entry = self.load(machine.as_str()).await?;
        if self.entry_alive(&entry, false).await {
            return Some(entry.session);
        }
        tracing::info!(%machine, pid = entry.session.pid, "console session is gone; dropping it");
        self.forget_if_pid(machine.as_str(), entry.session.pid).await;
        None
    }

    /// Records a freshly spawned console. Last writer wins.
    pub async fn write_session_info(
        &self,
        machine: &MachineName,
        pid: u32,
        command: &str,
        port: u16,
        exit: Option<ExitWatch>,
    ) -> ConsoleSession {
        let session = ConsoleSession {
            machine: machine.clone(),
            pid,
            port,
            command: command.to_string(),
            bind_address: self.bind_address.clone(),
            created_at: Utc::now(),
        };
        self.sessions.write().await.insert(
            machine.to_string(),
            RegistryEntry {
                session: session.clone(),
                exit,
            },
        );
        if let Err(err) = self.write_marker(&session).await {
            tracing::warn!(%err, %machine, "failed to write session marker");
        }
        session
    }

    /// Forcefully terminates the console for `machine`. `Ok(false)` if there was none.
    pub async fn kill_session(&self, machine: &MachineName) -> anyhow::Result<bool> {
        let Some(session) = self.get_session_info(machine).await else {
            return Ok(false);
        };
        self.table
            .kill(session.pid)
            .await
            .with_context(|| format!("kill console pid {} for {machine}", session.pid))?;
        self.forget_if_pid(machine.as_str(), session.pid).await;
        tracing::info!(%machine, pid = session.pid, "console session killed");
        Ok(true)
    }

    /// Strict liveness: no grace window.
    pub async fn verify_alive_strict(&self, machine: &MachineName) -> bool {
        match self.load(machine.as_str()).await {
            Some(entry) => self.entry_alive(&entry, true).await,
            None => false,
        }
    }

    /// Hot-path lookup for the WebSocket proxy: skips the liveness probe when
    /// the session is known in memory or its marker is well-formed.
    pub async fn peek(&self, machine: &MachineName) -> Option<ConsoleSession> {
        if let Some(e) = self.sessions.read().await.get(machine.as_str())
            && !e.exit.as_ref().is_some_and(|w| exit_status(w).is_some())
        {
            return Some(e.session.clone());
        }
        if let Some(session) = self.read_marker(machine.as_str()).await {
            return Some(session);
        }
        self.get_session_info(machine).await
    }

    pub async fn forget(&self, machine: &str) {
        self.sessions.write().await.remove(machine);
        self.remove_marker(machine).await;
    }

    /// Drops the entry only if it still belongs to `pid`.
    pub async fn forget_if_pid(&self, machine: &str, pid: u32) -> bool {
        let removed = {
            let mut map = self.sessions.write().await;
            match map.get(machine) {
                Some(e) if e.session.pid == pid => {
                    map.remove(machine);
                    true
                }
                Some(_) => return false,
                None => false,
            }
        };
        match self.read_marker(machine).await {
            Some(s) if s.pid == pid => {
                self.remove_marker(machine).await;
                true
            }
            _ => removed,
        }
    }

    async fn marker_machines(&self) -> anyhow::Result<Vec<String>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("read marker dir"),
        };
        let mut out = Vec::new();
        while let Some(ent) = rd.next_entry().await.context("read marker dir entry")? {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            out.push(stem.to_string());
        }
        Ok(out)
    }

    /// Startup pass: hydrates live markers and deletes the rest.
    pub async fn cleanup_stale_sessions(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for name in self.marker_machines().await? {
            let Ok(machine) = MachineName::parse(&name) else {
                self.remove_marker(&name).await;
                removed += 1;
                continue;
            };
            if self.get_session_info(&machine).await.is_none() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed stale console session markers");
        }
        Ok(removed)
    }

    /// Machines with a live registry entry.
    pub async fn tracked_machines(&self) -> anyhow::Result<HashSet<String>> {
        let mut names: HashSet<String> = self.sessions.read().await.keys().cloned().collect();
        names.extend(self.marker_machines().await?);

        let mut live = HashSet::new();
        for name in names {
            let Ok(machine) = MachineName::parse(&name) else {
                continue;
            };
            if self.get_session_info(&machine).await.is_some() {
                live.insert(name);
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::testing::FakeProcessTable;

    fn web01() -> MachineName {
        MachineName::parse("web01").unwrap()
    }

    fn registry(dir: &Path, table: Arc<FakeProcessTable>, grace: Duration) -> SessionRegistry {
        SessionRegistry::new(
            dir,
            "0.0.0.0",
            table,
            LivenessPolicy {
                grace,
                probe_timeout: Duration::from_millis(200),
            },
        )
    }

    fn old_marker(pid: u32, port: u16) -> String {
        let created = Utc::now() - chrono::Duration::minutes(10);
        format!(
            "{pid}\nzadm vnc\n{}\nweb01\n0.0.0.0:{port}\n",
            created.to_rfc3339()
        )
    }

    #[tokio::test]
    async fn write_then_read_returns_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(FakeProcessTable::default());
        table.insert(4321, "zadm vnc -w 0.0.0.0:8000 web01");
        let reg = registry(dir.path(), table, Duration::from_secs(120));

        reg.write_session_info(&web01(), 4321, "zadm vnc", 8000, None).await;
        assert!(dir.path().join("web01.pid").exists());

        let s = reg.get_session_info(&web01()).await.unwrap();
        assert_eq!((s.pid, s.port), (4321, 8000));
    }

    #[tokio::test]
    async fn malformed_marker_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web01.pid");
        std::fs::write(&path, "4321\nzadm vnc\n").unwrap();
        let reg = registry(dir.path(), Arc::new(FakeProcessTable::default()), Duration::ZERO);

        assert!(reg.get_session_info(&web01()).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dead_process_outside_grace_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web01.pid");
        std::fs::write(&path, old_marker(4321, 8000)).unwrap();
        let reg = registry(
            dir.path(),
            Arc::new(FakeProcessTable::default()),
            Duration::from_secs(120),
        );

        assert!(reg.get_session_info(&web01()).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_process_inside_grace_counts_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(
            dir.path(),
            Arc::new(FakeProcessTable::default()),
            Duration::from_secs(120),
        );
        reg.write_session_info(&web01(), 4321, "zadm vnc", 8000, None).await;

        assert!(reg.get_session_info(&web01()).await.is_some());
        assert!(!reg.verify_alive_strict(&web01()).await);
    }

    #[tokio::test]
    async fn failing_probe_inside_grace_counts_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(FakeProcessTable::default());
        table.fail_probes(true);
        let reg = registry(dir.path(), table.clone(), Duration::from_secs(120));
        reg.write_session_info(&web01(), 4321, "zadm vnc", 8000, None).await;
        assert!(reg.get_session_info(&web01()).await.is_some());

        let reg = registry(dir.path(), table, Duration::ZERO);
        assert!(reg.get_session_info(&web01()).await.is_none());
    }

    #[tokio::test]
    async fn kill_session_reports_whether_anything_was_killed() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(FakeProcessTable::default());
        table.insert(4321, "zadm vnc -w 0.0.0.0:8000 web01");
        let reg = registry(dir.path(), table.clone(), Duration::ZERO);

        assert!(!reg.kill_session(&web01()).await.unwrap());

        reg.write_session_info(&web01(), 4321, "zadm vnc", 8000, None).await;
        assert!(reg.kill_session(&web01()).await.unwrap());
        assert_eq!(table.killed(), vec![4321]);
        assert!(!dir.path().join("web01.pid").exists());
    }

    #[tokio::test]
    async fn cleanup_keeps_live_markers_and_drops_dead_ones() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(FakeProcessTable::default());
        table.insert(100, "zadm vnc -w 0.0.0.0:8000 web01");
        std::fs::write(dir.path().join("web01.pid"), old_marker(100, 8000)).unwrap();
        std::fs::write(
            dir.path().join("db01.pid"),
            old_marker(200, 8001).replace("web01", "db01"),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let reg = registry(dir.path(), table, Duration::ZERO);
        assert_eq!(reg.cleanup_stale_sessions().await.unwrap(), 1);
        assert!(dir.path().join("web01.pid").exists());
        assert!(!dir.path().join("db01.pid").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(
            reg.tracked_machines().await.unwrap(),
            HashSet::from(["web01".to_string()])
        );
    }

    #[tokio::test]
    async fn forget_if_pid_leaves_newer_sessions_alone() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(
            dir.path(),
            Arc::new(FakeProcessTable::default()),
            Duration::from_secs(120),
        );
        reg.write_session_info(&web01(), 2, "zadm vnc", 8000, None).await;

        assert!(!reg.forget_if_pid("web01", 1).await);
        assert!(reg.peek(&web01()).await.is_some());
        assert!(reg.forget_if_pid("web01", 2).await);
        assert!(reg.peek(&web01()).await.is_none());
    }

    #[tokio::test]
    async fn peek_trusts_a_well_formed_marker_without_probing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("web01.pid"), old_marker(4321, 8005)).unwrap();
        let reg = registry(dir.path(), Arc::new(FakeProcessTable::default()), Duration::ZERO);

        let s = reg.peek(&web01()).await.unwrap();
        assert_eq!(s.port, 8005);
    }
}
