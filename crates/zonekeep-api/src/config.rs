use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

pub(crate) fn env_bool(name: &str) -> bool {
    env_string(name).is_some_and(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn data_root() -> PathBuf {
    let raw = env_string("ZONEKEEP_DATA_ROOT").unwrap_or_else(|| "./data".to_string());
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// Tunables for console sessions; read once at startup.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub port_start: u16,
    pub port_end: u16,
    /// Address the console server binds to.
    pub bind_address: String,
    /// Host put into the direct `console_url` handed back to clients.
    pub public_host: String,
    pub marker_dir: PathBuf,
    pub console_command: String,
    /// Prefix for privileged commands (e.g. `pfexec`). `None` signals directly.
    pub elevate_command: Option<String>,
    pub backend_ws_path: String,
    pub grace_window: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub settle_delay: Duration,
    pub health_initial_delay: Duration,
    pub health_retries: u32,
    pub health_interval: Duration,
    pub health_request_timeout: Duration,
    /// Bound on proxied page and asset fetches and on cache warming.
    pub upstream_timeout: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub cache_max_asset_bytes: usize,
    pub autostart: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            port_start: 8000,
            port_end: 8100,
            bind_address: "0.0.0.0".to_string(),
            public_host: "127.0.0.1".to_string(),
            marker_dir: PathBuf::from("./data/vnc_sessions"),
            console_command: "zadm".to_string(),
            elevate_command: Some("pfexec".to_string()),
            backend_ws_path: "/websockify".to_string(),
            grace_window: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            settle_delay: Duration::from_millis(3000),
            health_initial_delay: Duration::from_millis(1000),
            health_retries: 20,
            health_interval: Duration::from_millis(500),
            health_request_timeout: Duration::from_millis(800),
            upstream_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_millis(2000),
            command_timeout: Duration::from_secs(30),
            cache_capacity: 100,
            cache_ttl: Duration::from_secs(60 * 60),
            cache_max_asset_bytes: 1024 * 1024,
            autostart: false,
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let port_start = env_u16("ZONEKEEP_CONSOLE_PORT_START").unwrap_or(d.port_start);
        let port_end = env_u16("ZONEKEEP_CONSOLE_PORT_END").unwrap_or(d.port_end);
        if port_start == 0 || port_end < port_start {
            anyhow::bail!("invalid console port range: {port_start}..={port_end}");
        }

        let elevate_command = match std::env::var("ZONEKEEP_ELEVATE_COMMAND") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v.trim().to_string()),
            Err(_) => d.elevate_command,
        };

        let backend_ws_path = env_string("ZONEKEEP_CONSOLE_WS_PATH")
            .map(|p| {
                if p.starts_with('/') {
                    p
                } else {
                    format!("/{p}")
                }
            })
            .unwrap_or(d.backend_ws_path);

        Ok(Self {
            port_start,
            port_end,
            bind_address: env_string("ZONEKEEP_CONSOLE_BIND_ADDR").unwrap_or(d.bind_address),
            public_host: env_string("ZONEKEEP_CONSOLE_PUBLIC_HOST").unwrap_or(d.public_host),
            marker_dir: data_root().join("vnc_sessions"),
            console_command: env_string("ZONEKEEP_CONSOLE_COMMAND").unwrap_or(d.console_command),
            elevate_command,
            backend_ws_path,
            grace_window: Duration::from_secs(
                env_u64("ZONEKEEP_CONSOLE_GRACE_SEC")
                    .map(|v| v.clamp(0, 3600))
                    .unwrap_or(d.grace_window.as_secs()),
            ),
            idle_timeout: Duration::from_secs(
                env_u64("ZONEKEEP_CONSOLE_IDLE_TIMEOUT_SEC")
                    .map(|v| v.clamp(60, 7 * 24 * 3600))
                    .unwrap_or(d.idle_timeout.as_secs()),
            ),
            sweep_interval: Duration::from_secs(
                env_u64("ZONEKEEP_CONSOLE_SWEEP_INTERVAL_SEC")
                    .map(|v| v.clamp(10, 24 * 3600))
                    .unwrap_or(d.sweep_interval.as_secs()),
            ),
            settle_delay: Duration::from_millis(
                env_u64("ZONEKEEP_CONSOLE_SETTLE_MS")
                    .map(|v| v.clamp(0, 60_000))
                    .unwrap_or(d.settle_delay.as_millis() as u64),
            ),
            health_initial_delay: Duration::from_millis(
                env_u64("ZONEKEEP_CONSOLE_HEALTH_DELAY_MS")
                    .map(|v| v.clamp(0, 60_000))
                    .unwrap_or(d.health_initial_delay.as_millis() as u64),
            ),
            health_retries: env_u64("ZONEKEEP_CONSOLE_HEALTH_RETRIES")
                .map(|v| v.clamp(1, 600) as u32)
                .unwrap_or(d.health_retries),
            health_interval: Duration::from_millis(
                env_u64("ZONEKEEP_CONSOLE_HEALTH_INTERVAL_MS")
                    .map(|v| v.clamp(50, 10_000))
                    .unwrap_or(d.health_interval.as_millis() as u64),
            ),
            health_request_timeout: d.health_request_timeout,
            upstream_timeout: Duration::from_millis(
                env_u64("ZONEKEEP_CONSOLE_UPSTREAM_TIMEOUT_MS")
                    .map(|v| v.clamp(500, 120_000))
                    .unwrap_or(d.upstream_timeout.as_millis() as u64),
            ),
            probe_timeout: Duration::from_millis(
                env_u64("ZONEKEEP_PROCESS_PROBE_TIMEOUT_MS")
                    .map(|v| v.clamp(100, 30_000))
                    .unwrap_or(d.probe_timeout.as_millis() as u64),
            ),
            command_timeout: Duration::from_secs(
                env_u64("ZONEKEEP_COMMAND_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(d.command_timeout.as_secs()),
            ),
            cache_capacity: env_usize("ZONEKEEP_ASSET_CACHE_CAPACITY")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(d.cache_capacity),
            cache_ttl: Duration::from_secs(
                env_u64("ZONEKEEP_ASSET_CACHE_TTL_SEC")
                    .map(|v| v.clamp(1, 7 * 24 * 3600))
                    .unwrap_or(d.cache_ttl.as_secs()),
            ),
            cache_max_asset_bytes: env_usize("ZONEKEEP_ASSET_CACHE_MAX_BYTES")
                .map(|v| v.clamp(1024, 64 * 1024 * 1024))
                .unwrap_or(d.cache_max_asset_bytes),
            autostart: env_bool("ZONEKEEP_CONSOLE_AUTOSTART"),
        })
    }

    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.port_start..=self.port_end
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub api_key: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env_string("ZONEKEEP_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5001".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid ZONEKEEP_LISTEN_ADDR: {e}"))?;
        Ok(Self {
            listen_addr,
            database_url: env_string("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://zonekeep.db?mode=rwc".to_string()),
            api_key: env_string("ZONEKEEP_API_KEY"),
            log_dir: env_string("ZONEKEEP_LOG_DIR").map(PathBuf::from),
        })
    }
}
