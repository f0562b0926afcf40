//! Confirmation and takeover collaborator interfaces (spec §6, §9).
//!
//! Modeled as small single-method `#[async_trait]` capability traits.
//! Null-object implementations are provided for headless runs, as spec §9
//! calls for.

use crate::errors::AgentError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ConfirmationCallback: Send + Sync {
    /// Invoked exactly once per sensitive tap, before any `input tap` is
    /// issued (spec P6). `true` allows the tap to proceed.
    async fn confirm(&self, message: &str) -> bool;
}

#[async_trait]
pub trait TakeoverCallback: Send + Sync {
    /// Blocks until the external actor signals completion or the token is
    /// cancelled.
    async fn takeover(&self, message: &str, cancel: &CancellationToken) -> Result<(), AgentError>;
}

/// Approves every sensitive tap unconditionally.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationCallback for AutoApprove {
    async fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Declines every sensitive tap unconditionally.
pub struct AutoDeny;

#[async_trait]
impl ConfirmationCallback for AutoDeny {
    async fn confirm(&self, _message: &str) -> bool {
        false
    }
}

/// Immediately cancels any takeover request rather than blocking forever
/// waiting for a human who isn't there.
pub struct AutoCancelTakeover;

#[async_trait]
impl TakeoverCallback for AutoCancelTakeover {
    async fn takeover(&self, _message: &str, _cancel: &CancellationToken) -> Result<(), AgentError> {
        Err(AgentError::Cancelled)
    }
}
