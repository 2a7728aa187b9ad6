//! Operation executor.
//!
//! `execute()` drives one client-initiated operation end to end: optimistic
//! local state, the caller-supplied action, and the wait for the server's
//! terminal `operation_status`. When the action succeeds but the server
//! never confirms within the grace window, a local completion is
//! synthesized so the UI cannot spin forever. A genuine server-side hang
//! past the window is therefore misreported as success; that tradeoff is
//! intentional product behavior and must survive refactors.

use crate::registry::ChannelHandle;
use crate::operation::OperationState;
use deckhand_core::{ActionPayload, CancelPayload, OperationKind, StatusPhase, WireMsg};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// How long a successfully started action may go unconfirmed by the server
/// before the executor synthesizes a local completion.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The server reported a terminal `failed` status.
    #[error("operation failed: {0}")]
    Failed(String),
    /// The action itself rejected, or its reply carried an embedded error.
    #[error("action failed: {0}")]
    Action(String),
    /// A newer `execute()` for the same `(operation, target)` replaced
    /// this one before it reached a terminal state.
    #[error("operation superseded by a newer execute")]
    Superseded,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub loading_message: Option<String>,
    pub success_message: Option<String>,
    pub error_message: Option<String>,
}

/// Result shape of a caller-supplied action. Backends embed failures in an
/// `error` field of an otherwise successful reply as often as they reject
/// outright, so both paths are checked.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActionReply {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

pub struct OperationExecutor {
    handle: ChannelHandle,
    kind: OperationKind,
    target: Option<String>,
    grace: Duration,
}

impl OperationExecutor {
    pub fn new(handle: ChannelHandle, kind: OperationKind, target: Option<String>) -> Self {
        Self {
            handle,
            kind,
            target,
            grace: DEFAULT_COMPLETION_GRACE,
        }
    }

    /// Overrides the completion grace window. Intended for tests.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn state(&self) -> Option<OperationState> {
        self.handle
            .operation_state(self.kind, self.target.as_deref())
    }

    pub async fn execute<F>(
        &self,
        action: F,
        options: ExecuteOptions,
    ) -> Result<(), OperationError>
    where
        F: Future<Output = Result<ActionReply, String>>,
    {
        let loading = options
            .loading_message
            .clone()
            .unwrap_or_else(|| format!("{} in progress", self.kind));
        let default_error = options
            .error_message
            .clone()
            .unwrap_or_else(|| format!("{} failed", self.kind));

        let waiter = self.handle.shared().begin_operation(
            self.kind,
            self.target.clone(),
            &loading,
            &default_error,
        );

        match action.await {
            Err(error) => {
                self.handle
                    .shared()
                    .fail_operation(self.kind, self.target.clone(), &error);
                warn!(
                    event = "operation_action_error",
                    channel = %self.handle.name(),
                    operation = %self.kind,
                    error = %error
                );
                return Err(OperationError::Action(error));
            }
            Ok(reply) => {
                if let Some(error) = reply.error.filter(|error| !error.is_empty()) {
                    // Embedded error bypasses the grace period.
                    self.handle
                        .shared()
                        .fail_operation(self.kind, self.target.clone(), &error);
                    return Err(OperationError::Action(error));
                }
            }
        }

        tokio::select! {
            outcome = waiter => match outcome {
                Ok((StatusPhase::Failed, state)) => {
                    // The fallback armed at begin() already filled in the
                    // caller default when the server sent no error text.
                    Err(OperationError::Failed(state.error.unwrap_or(default_error)))
                }
                Ok((_, _)) => Ok(()),
                Err(_) => Err(OperationError::Superseded),
            },
            _ = tokio::time::sleep(self.grace) => {
                let success = options
                    .success_message
                    .clone()
                    .unwrap_or_else(|| format!("{} complete", self.kind));
                self.handle
                    .shared()
                    .complete_operation(self.kind, self.target.clone(), &success);
                info!(
                    event = "operation_grace_complete",
                    channel = %self.handle.name(),
                    operation = %self.kind,
                    grace_ms = self.grace.as_millis() as u64
                );
                Ok(())
            }
        }
    }

    /// Emits a domain action event, auto-attaching this executor's target.
    /// Returns `false` when the channel is not connected.
    pub fn emit(&self, action: &str, args: Value) -> bool {
        self.handle.emit(WireMsg::Action(ActionPayload {
            action: action.to_string(),
            target: self.target.clone(),
            args,
        }))
    }

    /// Best-effort cancellation request. The client never assumes success;
    /// state only transitions on the server's resulting terminal status.
    pub fn cancel(&self) -> bool {
        self.handle.emit(WireMsg::Cancel(CancelPayload {
            operation: self.kind,
            target: self.target.clone(),
        }))
    }
}
