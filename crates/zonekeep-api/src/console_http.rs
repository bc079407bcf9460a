use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use zonekeep_console::MachineName;

use crate::asset_cache::CacheStats;
use crate::error::ConsoleError;
use crate::security;
use crate::session_store::SessionRecord;
use crate::state::AppState;
use crate::supervisor::{LOOPBACK_HOST, SessionView, StartOutcome, StopOutcome, proxy_url};
use crate::ws_proxy;

const CACHE_HEADER: &str = "x-cache";

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct SessionList {
    sessions: Vec<SessionRecord>,
    cache: CacheStats,
}

async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StartOutcome>, ConsoleError> {
    Ok(Json(state.supervisor.start(&name).await?))
}

async fn info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SessionView>, ConsoleError> {
    Ok(Json(state.supervisor.info(&name).await?))
}

async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StopOutcome>, ConsoleError> {
    Ok(Json(state.supervisor.stop(&name).await?))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionList>, ConsoleError> {
    Ok(Json(SessionList {
        sessions: state.supervisor.list().await?,
        cache: state.cache.stats(),
    }))
}

async fn session_port(state: &AppState, name: &str) -> Result<(MachineName, u16), ConsoleError> {
    let machine = MachineName::parse(name).map_err(|e| ConsoleError::InvalidMachine(e.0))?;
    let session = state
        .registry
        .peek(&machine)
        .await
        .ok_or_else(|| ConsoleError::SessionNotFound(machine.to_string()))?;
    Ok((machine, session.port))
}

struct Upstream {
    status: StatusCode,
    content_type: String,
    body: Vec<u8>,
}

impl IntoResponse for Upstream {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_str(&self.content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream"));
        (self.status, [(header::CONTENT_TYPE, content_type)], self.body).into_response()
    }
}

async fn fetch_upstream(state: &AppState, port: u16, path: &str) -> Result<Upstream, ConsoleError> {
    let url = format!("http://{LOOPBACK_HOST}:{port}/{path}");
    let unreachable = |err: reqwest::Error| ConsoleError::BackendUnreachable {
        port,
        reason: err.to_string(),
    };
    let resp = state.http.get(&url).send().await.map_err(unreachable)?;
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = resp.bytes().await.map_err(unreachable)?.to_vec();
    Ok(Upstream {
        status,
        content_type,
        body,
    })
}

async fn console_redirect(Path(name): Path<String>) -> Result<Redirect, ConsoleError> {
    let machine = MachineName::parse(&name).map_err(|e| ConsoleError::InvalidMachine(e.0))?;
    Ok(Redirect::permanent(&proxy_url(&machine)))
}

/// `GET /zones/:name/vnc/console/`; the page is always fetched live.
async fn console_root(State(state): State<AppState>, Path(name): Path<String>) -> Result<Upstream, ConsoleError> {
    let (machine, port) = session_port(&state, &name).await?;
    if let Err(err) = state.store.touch(&machine).await {
        tracing::debug!(%err, %machine, "failed to touch session record");
    }
    fetch_upstream(&state, port, "").await
}

/// `GET /zones/:name/vnc/console/*path`
async fn console_asset(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
) -> Result<Response, ConsoleError> {
    let (_, port) = session_port(&state, &name).await?;
    let path = path.trim_start_matches('/');

    if let Some(asset) = state.cache.get(path) {
        let mut resp = Upstream {
            status: StatusCode::OK,
            content_type: asset.content_type,
            body: asset.data.to_vec(),
        }
        .into_response();
        resp.headers_mut()
            .insert(CACHE_HEADER, HeaderValue::from_static("hit"));
        return Ok(resp);
    }

    let upstream = fetch_upstream(&state, port, path).await?;
    if upstream.status.is_success() && upstream.body.len() <= state.cache.max_asset_bytes() {
        state
            .cache
            .set(path, upstream.body.clone(), &upstream.content_type);
    }
    let mut resp = upstream.into_response();
    resp.headers_mut()
        .insert(CACHE_HEADER, HeaderValue::from_static("miss"));
    Ok(resp)
}

pub fn router(state: AppState) -> Router {
    let console = Router::new()
        .route("/zones/:name/vnc/start", post(start))
        .route("/zones/:name/vnc/info", get(info))
        .route("/zones/:name/vnc/stop", delete(stop))
        .route("/zones/:name/vnc/console", get(console_redirect))
        .route("/zones/:name/vnc/console/", get(console_root))
        .route("/zones/:name/vnc/console/*path", get(console_asset))
        .route("/zones/:name/vnc/websockify", get(ws_proxy::websockify))
        .route("/vnc/sessions", get(list_sessions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::require_api_key,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(console)
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
