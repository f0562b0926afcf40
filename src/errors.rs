//! Typed error taxonomy shared by the core components (spec §7).
//!
//! `anyhow` is still used at the CLI/bootstrap boundary (config loading,
//! `main`); inside the core, components return `AgentError` so callers can
//! match on kind instead of parsing strings.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no device available")]
    NoDevice,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device unauthorized: {0}")]
    Unauthorized(String),

    #[error("adb I/O error: {0}")]
    AdbIOError(String),

    #[error("input method unavailable: {0}")]
    InputMethodUnavailable(String),

    #[error("{op} timed out after {elapsed:?}")]
    Timeout { op: String, elapsed: Duration },

    #[error("model backend transient error: {0}")]
    ModelTransient(String),

    #[error("model backend permanent error: {0}")]
    ModelPermanent(String),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error("session already has a running task")]
    SessionBusy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    StoreError(String),
}

impl AgentError {
    /// Whether a retry is sanctioned by spec §4.4/§7 for this error kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. } | AgentError::ModelTransient(_)
        )
    }
}
