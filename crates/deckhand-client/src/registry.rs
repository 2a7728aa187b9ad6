//! Channel registry and per-channel connection tasks.
//!
//! The registry owns exactly one channel per name for the life of the
//! process. Each channel gets a connection task that dials the backend's
//! socket, replays `hello` + `check_status` on every (re)connect so the
//! client resynchronizes from the server instead of trusting stale state,
//! and applies inbound frames to the shared channel in arrival order.
//! Connection failures are merged into canonical state, never raised to
//! subscribers.

use crate::channel::{ChannelShared, Subscription};
use crate::config::{RegistryConfig, ReconnectPolicy};
use crate::executor::OperationExecutor;
use crate::operation::OperationState;
use chrono::Utc;
use deckhand_core::{
    encode_frame, CheckStatusPayload, HelloPayload, NdjsonFrameDecoder, OperationKind,
    ProtocolVersion, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE_CAPACITY: usize = 64;

pub struct ChannelRegistry {
    config: RegistryConfig,
    channels: Mutex<HashMap<String, ChannelHandle>>,
}

impl ChannelRegistry {
    /// Constructed once at startup and passed by reference into consumers;
    /// the one-connection-per-channel-name invariant lives here, not in a
    /// hidden global.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn get_or_create(&self, name: &str) -> ChannelHandle {
        let mut channels = self.channels.lock().expect("registry lock");
        if let Some(handle) = channels.get(name) {
            return handle.clone();
        }

        let shared = Arc::new(ChannelShared::new(name, self.config.queue_capacity));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let task_config = ChannelTaskConfig {
            name: name.to_string(),
            socket_path: self.config.socket_path(name),
            client_id: self.config.client_id.clone(),
            policy: self.config.reconnect.clone(),
        };
        tokio::spawn(run_channel(shared.clone(), task_config, outbound_rx));

        let handle = ChannelHandle {
            shared,
            outbound: outbound_tx,
            client_id: self.config.client_id.clone(),
        };
        channels.insert(name.to_string(), handle.clone());
        info!(event = "channel_created", channel = name);
        handle
    }
}

/// Cheap-to-clone handle onto one named channel. Channels are never torn
/// down while the process lives; dropping handles only drops references.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
    outbound: mpsc::Sender<WireEnvelope>,
    client_id: String,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn snapshot(&self) -> Option<Arc<Value>> {
        self.shared.snapshot()
    }

    /// Subscribes the calling view. Cached canonical state is delivered
    /// immediately; when the live connection has not yet answered with a
    /// status snapshot, a `check_status` resync is requested as well so
    /// the view never settles on locally synthesized connection markers.
    pub fn subscribe(&self) -> Subscription {
        let needs_resync = !self.shared.has_server_status();
        let subscription = self.shared.subscribe();
        if needs_resync && self.shared.is_connected() {
            self.emit(WireMsg::CheckStatus(CheckStatusPayload::default()));
        }
        subscription
    }

    /// Queues an outbound event. Returns `false` instead of failing when
    /// the channel is not currently connected or the queue is unavailable.
    pub fn emit(&self, msg: WireMsg) -> bool {
        if !self.shared.is_connected() {
            debug!(event = "emit_skipped", channel = %self.name(), reason = "disconnected");
            return false;
        }
        let envelope = self.build_envelope(msg);
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    event = "outbound_queue_drop",
                    channel = %self.name(),
                    reason = "queue_full",
                    capacity = OUTBOUND_QUEUE_CAPACITY
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    event = "outbound_queue_drop",
                    channel = %self.name(),
                    reason = "channel_closed"
                );
                false
            }
        }
    }

    pub fn executor(&self, kind: OperationKind, target: Option<String>) -> OperationExecutor {
        OperationExecutor::new(self.clone(), kind, target)
    }

    pub fn operation_state(
        &self,
        kind: OperationKind,
        target: Option<&str>,
    ) -> Option<OperationState> {
        self.shared.operation_state(kind, target)
    }

    pub fn terminal_lines(&self) -> Vec<String> {
        self.shared.terminal_lines()
    }

    pub fn clear_terminal(&self) {
        self.shared.clear_terminal()
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    fn build_envelope(&self, msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            channel: self.name().to_string(),
            sender_id: self.client_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }
}

struct ChannelTaskConfig {
    name: String,
    socket_path: PathBuf,
    client_id: String,
    policy: ReconnectPolicy,
}

async fn run_channel(
    shared: Arc<ChannelShared>,
    config: ChannelTaskConfig,
    mut outbound_rx: mpsc::Receiver<WireEnvelope>,
) {
    let mut backoff = config.policy.initial_backoff;
    let mut attempts: u32 = 0;
    let mut outbound_open = true;

    loop {
        let connect =
            tokio::time::timeout(config.policy.connect_timeout, UnixStream::connect(&config.socket_path))
                .await;
        let connect = match connect {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err("connect timed out".to_string()),
        };
        let stream = match connect {
            Ok(stream) => stream,
            Err(error) => {
                attempts += 1;
                shared.mark_disconnected(Some(&error));
                warn!(
                    event = "channel_connect_error",
                    channel = %config.name,
                    error = %error,
                    attempt = attempts
                );
                if attempts >= config.policy.max_attempts {
                    shared.mark_disconnected(Some("reconnect attempts exhausted"));
                    warn!(event = "channel_reconnect_exhausted", channel = %config.name);
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = config.policy.next_backoff(backoff);
                continue;
            }
        };
        attempts = 0;
        backoff = config.policy.initial_backoff;

        let (reader_half, mut writer) = stream.into_split();

        // Every connect replays the handshake and a full resync request so
        // reconnects never trust stale client state.
        let hello = task_envelope(
            &config,
            WireMsg::Hello(HelloPayload {
                client_id: config.client_id.clone(),
                capabilities: vec![
                    "channel_status".to_string(),
                    "operation_status".to_string(),
                    "terminal_output".to_string(),
                    "action".to_string(),
                    "cancel".to_string(),
                ],
            }),
        );
        let resync = task_envelope(&config, WireMsg::CheckStatus(CheckStatusPayload::default()));
        if send_frame(&mut writer, &hello).await.is_err()
            || send_frame(&mut writer, &resync).await.is_err()
        {
            attempts += 1;
            shared.mark_disconnected(Some("handshake write failed"));
            warn!(
                event = "channel_handshake_error",
                channel = %config.name,
                attempt = attempts
            );
            if attempts >= config.policy.max_attempts {
                shared.mark_disconnected(Some("reconnect attempts exhausted"));
                warn!(event = "channel_reconnect_exhausted", channel = %config.name);
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = config.policy.next_backoff(backoff);
            continue;
        }

        shared.mark_connected();
        info!(event = "channel_connected", channel = %config.name);

        let mut reader = BufReader::new(reader_half);
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(DEFAULT_MAX_FRAME_BYTES);
        let mut read_buf = [0u8; 8192];

        loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    let read = match read {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "channel_read_error", channel = %config.name, error = %err);
                            break;
                        }
                    };
                    if read == 0 {
                        break;
                    }
                    let report = decoder.push_chunk(&read_buf[..read]);
                    for err in report.errors {
                        warn!(event = "channel_decode_error", channel = %config.name, error = %err);
                    }
                    for envelope in report.frames {
                        if envelope.channel != config.name {
                            continue;
                        }
                        if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
                            continue;
                        }
                        shared.handle_wire(envelope.msg);
                    }
                }
                maybe_outbound = outbound_rx.recv(), if outbound_open => {
                    match maybe_outbound {
                        Some(envelope) => {
                            if send_frame(&mut writer, &envelope).await.is_err() {
                                warn!(event = "channel_write_error", channel = %config.name);
                                break;
                            }
                        }
                        None => outbound_open = false,
                    }
                }
            }
        }

        for err in decoder.finish().errors {
            warn!(event = "channel_decode_error", channel = %config.name, error = %err);
        }
        shared.mark_disconnected(None);
        info!(event = "channel_disconnected", channel = %config.name);
        tokio::time::sleep(backoff).await;
        backoff = config.policy.next_backoff(backoff);
    }
}

async fn send_frame(writer: &mut OwnedWriteHalf, envelope: &WireEnvelope) -> io::Result<()> {
    let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn task_envelope(config: &ChannelTaskConfig, msg: WireMsg) -> WireEnvelope {
    WireEnvelope {
        version: ProtocolVersion::CURRENT,
        channel: config.name.clone(),
        sender_id: config.client_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        request_id: None,
        msg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> RegistryConfig {
        let mut config = RegistryConfig::new(std::env::temp_dir().join("deckhand-missing"));
        config.reconnect = ReconnectPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(100),
        };
        config
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_channel_per_name() {
        let registry = ChannelRegistry::new(test_config());
        let first = registry.get_or_create("service");
        let second = registry.get_or_create("service");
        assert!(Arc::ptr_eq(first.shared(), second.shared()));

        let other = registry.get_or_create("installer");
        assert!(!Arc::ptr_eq(first.shared(), other.shared()));
    }

    #[tokio::test]
    async fn emit_returns_false_while_disconnected() {
        let registry = ChannelRegistry::new(test_config());
        let handle = registry.get_or_create("service");
        assert!(!handle.is_connected());
        assert!(!handle.emit(WireMsg::CheckStatus(CheckStatusPayload::default())));
    }

    #[tokio::test]
    async fn exhausted_reconnects_surface_in_canonical_state() {
        let registry = ChannelRegistry::new(test_config());
        let handle = registry.get_or_create("service");

        // 2 attempts at ~10ms backoff; give the task room to give up.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = handle.snapshot().expect("connect failures recorded");
        assert_eq!(snapshot["connected"], serde_json::json!(false));
        assert_eq!(
            snapshot["error"],
            serde_json::json!("reconnect attempts exhausted")
        );
    }
}
