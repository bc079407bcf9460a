use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::asset_cache::AssetCache;
use crate::config::ConsoleConfig;
use crate::registry::SessionRegistry;
use crate::session_store::SessionStore;
use crate::supervisor::ConsoleSupervisor;

/// HTTP client for talking to console servers; every request is bounded by `timeout`.
pub fn console_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("zonekeep/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("build console http client")
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConsoleConfig>,
    pub supervisor: ConsoleSupervisor,
    pub registry: SessionRegistry,
    pub store: SessionStore,
    pub cache: Arc<AssetCache>,
    /// Client for proxied page and asset fetches.
    pub http: reqwest::Client,
    pub api_key: Option<Arc<str>>,
}
