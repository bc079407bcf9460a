use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

const MAX_DIAGNOSTIC_BYTES: usize = 2 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("invalid machine name: {0}")]
    InvalidMachine(String),
    #[error("machine not found: {0}")]
    MachineNotFound(String),
    #[error("machine {machine} is not running (state: {state})")]
    MachineNotRunning { machine: String, state: String },
    #[error("no console session for {0}")]
    SessionNotFound(String),
    #[error("no console ports available in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("console server exited during startup ({exit}): {stderr}")]
    SpawnFailed { exit: String, stderr: String },
    #[error("console server on port {port} did not answer after {attempts} attempts")]
    HealthCheckTimeout { port: u16, attempts: u32 },
    #[error("console server pid {pid} answered once and then exited")]
    ImmediateDeath { pid: u32 },
    #[error("console backend on port {port} is unreachable: {reason}")]
    BackendUnreachable { port: u16, reason: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ConsoleError {
    pub fn code(&self) -> &'static str {
        match self {
            ConsoleError::InvalidMachine(_) => "invalid_machine",
            ConsoleError::MachineNotFound(_) => "machine_not_found",
            ConsoleError::MachineNotRunning { .. } => "machine_not_running",
            ConsoleError::SessionNotFound(_) => "session_not_found",
            ConsoleError::PortExhausted { .. } => "port_exhausted",
            ConsoleError::SpawnFailed { .. } => "spawn_failed",
            ConsoleError::HealthCheckTimeout { .. } => "health_check_timeout",
            ConsoleError::ImmediateDeath { .. } => "immediate_death",
            ConsoleError::BackendUnreachable { .. } => "backend_unreachable",
            ConsoleError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ConsoleError::InvalidMachine(_) | ConsoleError::MachineNotRunning { .. } => {
                StatusCode::BAD_REQUEST
            }
            ConsoleError::MachineNotFound(_) | ConsoleError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ConsoleError::PortExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ConsoleError::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ConsoleError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ConsoleError::SpawnFailed { .. }
            | ConsoleError::ImmediateDeath { .. }
            | ConsoleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

pub(crate) fn json_error(code: StatusCode, err_code: &'static str, message: impl Into<String>) -> Response {
    (
        code,
        axum::Json(ErrorBody {
            code: err_code,
            message: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ConsoleError::Internal(err) => format_error_chain(err),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::warn!(code = self.code(), %message, "console request failed");
        }
        json_error(status, self.code(), truncate_utf8(&message, MAX_DIAGNOSTIC_BYTES))
    }
}
