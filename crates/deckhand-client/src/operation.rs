//! Operation status machine.
//!
//! Each channel tracks operations keyed by `(kind, target)` so that two
//! concurrent operations against different targets on one channel (two
//! managed containers, say) never interfere. Transitions are monotone
//! toward a terminal phase; once terminal, every further status event for
//! that key is ignored until a new `execute()` resets it.

use deckhand_core::{OperationKind, OperationStatusPayload, StatusPhase};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub type OperationKey = (OperationKind, Option<String>);

/// Client-side projection of one operation's progress, replaced as a whole
/// on every status event.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationState {
    pub is_loading: bool,
    pub operation: Option<OperationKind>,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    pub details: Option<Value>,
}

impl Default for OperationState {
    fn default() -> Self {
        Self {
            is_loading: false,
            operation: None,
            progress: 0,
            message: String::new(),
            error: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OperationUpdate {
    pub target: Option<String>,
    pub state: OperationState,
}

struct OperationEntry {
    state: OperationState,
    terminal: bool,
    waiter: Option<oneshot::Sender<(StatusPhase, OperationState)>>,
    failure_fallback: Option<String>,
}

impl OperationEntry {
    fn new(kind: OperationKind) -> Self {
        Self {
            state: OperationState {
                operation: Some(kind),
                ..OperationState::default()
            },
            terminal: false,
            waiter: None,
            failure_fallback: None,
        }
    }
}

#[derive(Default)]
pub struct OperationTable {
    entries: Mutex<HashMap<OperationKey, OperationEntry>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the keyed operation to an optimistic in-progress state and
    /// arms a fresh terminal-status waiter. A waiter left over from a
    /// previous `execute()` is dropped, which surfaces to that caller as a
    /// superseded operation. `failure_message` is stored as the fallback
    /// error for a server `failed` that carries no error text.
    pub fn begin(
        &self,
        kind: OperationKind,
        target: Option<String>,
        loading_message: &str,
        failure_message: &str,
    ) -> (
        oneshot::Receiver<(StatusPhase, OperationState)>,
        OperationUpdate,
    ) {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().expect("operation lock");
        let entry = entries
            .entry((kind, target.clone()))
            .or_insert_with(|| OperationEntry::new(kind));
        entry.state = OperationState {
            is_loading: true,
            operation: Some(kind),
            progress: 0,
            message: loading_message.to_string(),
            error: None,
            details: None,
        };
        entry.terminal = false;
        entry.waiter = Some(tx);
        entry.failure_fallback = Some(failure_message.to_string());
        let update = OperationUpdate {
            target,
            state: entry.state.clone(),
        };
        (rx, update)
    }

    /// Applies an inbound `operation_status` event. Returns the new
    /// projection for fan-out, or `None` when the event lands on an
    /// already-terminal key and is ignored.
    pub fn apply(&self, payload: &OperationStatusPayload) -> Option<OperationUpdate> {
        let key = (payload.operation, payload.target.clone());
        let mut entries = self.entries.lock().expect("operation lock");
        let entry = entries
            .entry(key)
            .or_insert_with(|| OperationEntry::new(payload.operation));
        if entry.terminal {
            return None;
        }

        match payload.status {
            StatusPhase::InProgress => {
                entry.state.is_loading = true;
                entry.state.operation = Some(payload.operation);
                entry.state.message = payload.message.clone();
                // Progress is deliberately not clamped monotone; a later
                // lower value overwrites a higher one.
                if let Some(progress) = payload.progress {
                    entry.state.progress = progress;
                }
                if payload.details.is_some() {
                    entry.state.details = payload.details.clone();
                }
            }
            StatusPhase::Complete => {
                entry.state.is_loading = false;
                entry.state.operation = Some(payload.operation);
                entry.state.progress = 100;
                entry.state.message = payload.message.clone();
                entry.state.error = None;
                if payload.details.is_some() {
                    entry.state.details = payload.details.clone();
                }
                entry.terminal = true;
            }
            StatusPhase::Failed => {
                entry.state.is_loading = false;
                entry.state.operation = Some(payload.operation);
                entry.state.message = payload.message.clone();
                // A failed status with no error text falls back to the
                // message armed at begin(), so subscribers see one
                // consistent terminal update.
                let fallback = entry.failure_fallback.clone();
                entry.state.error = payload
                    .error
                    .clone()
                    .filter(|err| !err.is_empty())
                    .or(fallback);
                if payload.details.is_some() {
                    entry.state.details = payload.details.clone();
                }
                entry.terminal = true;
            }
        }

        let state = entry.state.clone();
        if entry.terminal {
            if let Some(waiter) = entry.waiter.take() {
                let _ = waiter.send((payload.status, state.clone()));
            }
        }
        Some(OperationUpdate {
            target: payload.target.clone(),
            state,
        })
    }

    /// Locally forced failure, used when the action itself rejects or its
    /// reply carries an embedded error. Bypasses the grace period.
    pub fn fail_local(
        &self,
        kind: OperationKind,
        target: Option<String>,
        message: &str,
    ) -> OperationUpdate {
        self.finish_local(kind, target, |state| {
            state.is_loading = false;
            state.error = Some(message.to_string());
        })
    }

    /// Locally synthesized completion, used by the grace-period fallback.
    pub fn complete_local(
        &self,
        kind: OperationKind,
        target: Option<String>,
        message: &str,
    ) -> OperationUpdate {
        self.finish_local(kind, target, |state| {
            state.is_loading = false;
            state.progress = 100;
            state.error = None;
            if !message.is_empty() {
                state.message = message.to_string();
            }
        })
    }

    fn finish_local(
        &self,
        kind: OperationKind,
        target: Option<String>,
        apply: impl FnOnce(&mut OperationState),
    ) -> OperationUpdate {
        let mut entries = self.entries.lock().expect("operation lock");
        let entry = entries
            .entry((kind, target.clone()))
            .or_insert_with(|| OperationEntry::new(kind));
        apply(&mut entry.state);
        entry.terminal = true;
        entry.waiter = None;
        OperationUpdate {
            target,
            state: entry.state.clone(),
        }
    }

    pub fn state(&self, kind: OperationKind, target: Option<&str>) -> Option<OperationState> {
        let entries = self.entries.lock().expect("operation lock");
        entries
            .get(&(kind, target.map(str::to_string)))
            .map(|entry| entry.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        kind: OperationKind,
        phase: StatusPhase,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> OperationStatusPayload {
        OperationStatusPayload {
            operation: kind,
            status: phase,
            message: String::new(),
            progress,
            error: error.map(str::to_string),
            target: None,
            details: None,
        }
    }

    #[test]
    fn progress_sequence_ends_complete_at_full_progress() {
        let table = OperationTable::new();
        table.apply(&status(
            OperationKind::Install,
            StatusPhase::InProgress,
            Some(10),
            None,
        ));
        table.apply(&status(
            OperationKind::Install,
            StatusPhase::InProgress,
            Some(55),
            None,
        ));
        let update = table
            .apply(&status(
                OperationKind::Install,
                StatusPhase::Complete,
                None,
                None,
            ))
            .expect("complete applied");

        assert!(!update.state.is_loading);
        assert_eq!(update.state.progress, 100);
        assert_eq!(update.state.error, None);
    }

    #[test]
    fn failed_surfaces_server_error_and_stops_loading() {
        let table = OperationTable::new();
        table.apply(&status(
            OperationKind::Update,
            StatusPhase::InProgress,
            Some(30),
            None,
        ));
        let update = table
            .apply(&status(
                OperationKind::Update,
                StatusPhase::Failed,
                None,
                Some("disk full"),
            ))
            .expect("failed applied");

        assert!(!update.state.is_loading);
        assert_eq!(update.state.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn failed_without_error_text_uses_fallback_armed_at_begin() {
        let table = OperationTable::new();
        let (_rx, _update) = table.begin(OperationKind::Install, None, "installing", "install failed");
        let update = table
            .apply(&status(
                OperationKind::Install,
                StatusPhase::Failed,
                None,
                None,
            ))
            .expect("failed applied");
        assert!(!update.state.is_loading);
        assert_eq!(update.state.error.as_deref(), Some("install failed"));
    }

    #[test]
    fn failed_without_begin_keeps_error_empty() {
        let table = OperationTable::new();
        let update = table
            .apply(&status(
                OperationKind::Uninstall,
                StatusPhase::Failed,
                None,
                None,
            ))
            .expect("failed applied");
        assert_eq!(update.state.error, None);
    }

    #[test]
    fn progress_may_move_backward() {
        let table = OperationTable::new();
        table.apply(&status(
            OperationKind::Install,
            StatusPhase::InProgress,
            Some(80),
            None,
        ));
        let update = table
            .apply(&status(
                OperationKind::Install,
                StatusPhase::InProgress,
                Some(35),
                None,
            ))
            .expect("in_progress applied");
        assert_eq!(update.state.progress, 35);
    }

    #[test]
    fn events_after_terminal_are_ignored_until_next_begin() {
        let table = OperationTable::new();
        table.apply(&status(
            OperationKind::Start,
            StatusPhase::Complete,
            None,
            None,
        ));
        assert!(table
            .apply(&status(
                OperationKind::Start,
                StatusPhase::InProgress,
                Some(5),
                None,
            ))
            .is_none());

        let (_rx, update) = table.begin(OperationKind::Start, None, "starting", "start failed");
        assert!(update.state.is_loading);
        assert_eq!(update.state.progress, 0);
        assert!(table
            .apply(&status(
                OperationKind::Start,
                StatusPhase::InProgress,
                Some(5),
                None,
            ))
            .is_some());
    }

    #[test]
    fn targets_sharing_a_channel_do_not_interfere() {
        let table = OperationTable::new();
        let mut for_a = status(OperationKind::Restart, StatusPhase::InProgress, Some(20), None);
        for_a.target = Some("container-a".to_string());
        let mut for_b = status(OperationKind::Restart, StatusPhase::Failed, None, Some("oom"));
        for_b.target = Some("container-b".to_string());

        table.apply(&for_a);
        table.apply(&for_b);

        let state_a = table
            .state(OperationKind::Restart, Some("container-a"))
            .expect("state a");
        assert!(state_a.is_loading);
        assert_eq!(state_a.error, None);

        let state_b = table
            .state(OperationKind::Restart, Some("container-b"))
            .expect("state b");
        assert!(!state_b.is_loading);
        assert_eq!(state_b.error.as_deref(), Some("oom"));
    }

    #[tokio::test]
    async fn waiter_fires_once_on_terminal_status() {
        let table = OperationTable::new();
        let (rx, _update) = table.begin(OperationKind::Stop, None, "stopping", "stop failed");
        table.apply(&status(
            OperationKind::Stop,
            StatusPhase::Complete,
            None,
            None,
        ));
        let (phase, state) = rx.await.expect("terminal state delivered");
        assert_eq!(phase, StatusPhase::Complete);
        assert!(!state.is_loading);
        assert_eq!(state.progress, 100);
    }
}
