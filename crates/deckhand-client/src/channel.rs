//! Canonical channel state and subscriber fan-out.
//!
//! `ChannelShared` is the aggregation point for one named channel: it owns
//! the canonical state object, the terminal log buffer, the operation
//! table, and the set of currently mounted subscribers. Every inbound wire
//! event funnels through here in arrival order; subscribers always receive
//! the entire new canonical object, never a delta, so no consumer carries
//! its own merge logic.

use crate::operation::{OperationState, OperationTable, OperationUpdate};
use crate::terminal::TerminalLogBuffer;
use deckhand_core::{
    merge_object, OperationKind, OperationStatusPayload, TerminalChunk, WireMsg,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub enum ChannelUpdate {
    /// Wholesale replacement of the channel's canonical state.
    State(Arc<Value>),
    Operation(OperationUpdate),
    Terminal(String),
}

struct SubscriberEntry {
    mounted: Arc<AtomicBool>,
    tx: mpsc::Sender<ChannelUpdate>,
}

pub struct ChannelShared {
    name: String,
    queue_capacity: usize,
    canonical: RwLock<Option<Arc<Value>>>,
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_subscriber_id: AtomicU64,
    connected: AtomicBool,
    status_received: AtomicBool,
    terminal: TerminalLogBuffer,
    operations: OperationTable,
}

impl ChannelShared {
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            queue_capacity,
            canonical: RwLock::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            status_received: AtomicBool::new(false),
            terminal: TerminalLogBuffer::new(),
            operations: OperationTable::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once the current connection has answered with a full status
    /// snapshot. Connection markers merged locally do not count; only a
    /// backend `channel_status` clears the need to resync.
    pub fn has_server_status(&self) -> bool {
        self.status_received.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<Arc<Value>> {
        self.canonical.read().expect("canonical lock").clone()
    }

    /// Registers a subscriber. When canonical state already exists the
    /// snapshot is delivered into the subscription queue before this
    /// returns; no wire round trip is involved.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mounted = Arc::new(AtomicBool::new(true));

        {
            // Snapshot and registration happen under the subscriber lock so
            // a concurrent update cannot slip between them.
            let mut subscribers = self.subscribers.lock().expect("subscriber lock");
            if let Some(snapshot) = self.snapshot() {
                // Fresh queue, cannot be full.
                let _ = tx.try_send(ChannelUpdate::State(snapshot));
            }
            subscribers.insert(
                id,
                SubscriberEntry {
                    mounted: mounted.clone(),
                    tx,
                },
            );
        }
        debug!(event = "subscriber_added", channel = %self.name, subscriber = id);

        Subscription {
            id,
            shared: self.clone(),
            mounted,
            rx,
        }
    }

    fn remove_subscriber(&self, id: u64) {
        if self
            .subscribers
            .lock()
            .expect("subscriber lock")
            .remove(&id)
            .is_some()
        {
            debug!(event = "subscriber_removed", channel = %self.name, subscriber = id);
        }
    }

    /// Merges a partial into canonical state and fans the entire new
    /// object out to every mounted subscriber.
    pub fn update_state(&self, partial: &Value) {
        let merged = {
            let mut canonical = self.canonical.write().expect("canonical lock");
            let base = canonical
                .as_deref()
                .cloned()
                .unwrap_or_else(|| json!({}));
            let next = Arc::new(merge_object(&base, partial));
            *canonical = Some(next.clone());
            next
        };
        self.fan_out(ChannelUpdate::State(merged));
    }

    pub fn handle_wire(&self, msg: WireMsg) {
        match msg {
            WireMsg::ChannelStatus(value) => {
                self.status_received.store(true, Ordering::SeqCst);
                self.update_state(&value);
            }
            WireMsg::OperationStatus(payload) => self.apply_operation(&payload),
            WireMsg::TerminalOutput(chunk) => self.append_terminal(chunk),
            other => {
                debug!(event = "inbound_ignored", channel = %self.name, msg = ?other);
            }
        }
    }

    pub fn apply_operation(&self, payload: &OperationStatusPayload) {
        match self.operations.apply(payload) {
            Some(update) => self.fan_out(ChannelUpdate::Operation(update)),
            None => {
                debug!(
                    event = "operation_status_ignored",
                    channel = %self.name,
                    operation = %payload.operation,
                    reason = "terminal"
                );
            }
        }
    }

    pub fn append_terminal(&self, chunk: TerminalChunk) {
        let line = self.terminal.append(chunk);
        self.fan_out(ChannelUpdate::Terminal(line));
    }

    pub fn terminal_lines(&self) -> Vec<String> {
        self.terminal.lines()
    }

    pub fn clear_terminal(&self) {
        self.terminal.clear();
    }

    pub fn operation_state(
        &self,
        kind: OperationKind,
        target: Option<&str>,
    ) -> Option<OperationState> {
        self.operations.state(kind, target)
    }

    pub(crate) fn begin_operation(
        &self,
        kind: OperationKind,
        target: Option<String>,
        loading_message: &str,
        failure_message: &str,
    ) -> oneshot::Receiver<(deckhand_core::StatusPhase, OperationState)> {
        let (rx, update) = self
            .operations
            .begin(kind, target, loading_message, failure_message);
        self.fan_out(ChannelUpdate::Operation(update));
        rx
    }

    pub(crate) fn fail_operation(
        &self,
        kind: OperationKind,
        target: Option<String>,
        message: &str,
    ) {
        let update = self.operations.fail_local(kind, target, message);
        self.fan_out(ChannelUpdate::Operation(update));
    }

    pub(crate) fn complete_operation(
        &self,
        kind: OperationKind,
        target: Option<String>,
        message: &str,
    ) {
        let update = self.operations.complete_local(kind, target, message);
        self.fan_out(ChannelUpdate::Operation(update));
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.update_state(&json!({"connected": true, "error": null}));
    }

    pub(crate) fn mark_disconnected(&self, error: Option<&str>) {
        self.connected.store(false, Ordering::SeqCst);
        self.status_received.store(false, Ordering::SeqCst);
        match error {
            Some(error) => self.update_state(&json!({"connected": false, "error": error})),
            None => self.update_state(&json!({"connected": false})),
        }
    }

    /// Unmounted subscribers are skipped, which absorbs the
    /// unmount-during-in-flight-event race without error. A closed queue
    /// removes the subscriber; a full one drops this update with a warn.
    fn fan_out(&self, update: ChannelUpdate) {
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("subscriber lock");
            for (id, entry) in subscribers.iter() {
                if !entry.mounted.load(Ordering::SeqCst) {
                    continue;
                }
                match entry.tx.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            event = "subscriber_queue_full",
                            channel = %self.name,
                            subscriber = id,
                            capacity = self.queue_capacity
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }
        for id in closed {
            warn!(event = "subscriber_queue_closed", channel = %self.name, subscriber = id);
            self.remove_subscriber(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock").len()
    }
}

/// Live subscription held by one mounted view. Dropping it unsubscribes;
/// the channel and its canonical state are untouched since other views may
/// still depend on them.
pub struct Subscription {
    id: u64,
    shared: Arc<ChannelShared>,
    mounted: Arc<AtomicBool>,
    rx: mpsc::Receiver<ChannelUpdate>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        self.shared.name()
    }

    pub async fn recv(&mut self) -> Option<ChannelUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelUpdate> {
        self.rx.try_recv().ok()
    }

    /// Clears or restores the mounted flag. While unmounted, deliveries
    /// are skipped rather than queued.
    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.remove_subscriber(self.id);
    }
}
