//! Wire protocol for deckhand channels.
//!
//! Every channel speaks newline-delimited JSON frames. Each frame is a
//! [`WireEnvelope`] whose `type`/`payload` pair maps onto one [`WireMsg`]
//! variant, so unknown message names fail at decode time instead of being
//! routed through a string-keyed handler table.

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub channel: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    /// Full-resync request; answered with a `ChannelStatus` snapshot.
    CheckStatus(CheckStatusPayload),
    /// Arbitrary domain status object, merged wholesale into the channel's
    /// canonical state.
    ChannelStatus(Value),
    OperationStatus(OperationStatusPayload),
    TerminalOutput(TerminalChunk),
    Action(ActionPayload),
    Cancel(CancelPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckStatusPayload {
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
    Install,
    Uninstall,
    Update,
    Configure,
    Validate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
            OperationKind::Update => "update",
            OperationKind::Configure => "configure",
            OperationKind::Validate => "validate",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    InProgress,
    Complete,
    Failed,
}

impl StatusPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusPhase::Complete | StatusPhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStatusPayload {
    pub operation: OperationKind,
    pub status: StatusPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Terminal output arrives either as a bare string or wrapped in a
/// `{"data": ...}` object depending on which backend component emitted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TerminalChunk {
    Raw(String),
    Wrapped { data: String },
}

impl TerminalChunk {
    pub fn into_line(self) -> String {
        match self {
            TerminalChunk::Raw(line) => line,
            TerminalChunk::Wrapped { data } => data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionPayload {
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelPayload {
    pub operation: OperationKind,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> DecodeReport<T> {
    pub fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    pub fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

fn trim_eol(mut line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = line {
        line = rest;
    }
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_eol(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Streaming NDJSON decoder. Complete lines in a chunk are decoded in
/// place; only a trailing partial line is buffered until the next chunk.
/// Malformed or oversized lines are reported per frame and never poison
/// the lines that follow them.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    partial: Vec<u8>,
    _frame: PhantomData<fn() -> T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            partial: Vec::new(),
            _frame: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if self.partial.is_empty() {
                self.decode_line(line, &mut report);
            } else {
                self.partial.extend_from_slice(line);
                let assembled = std::mem::take(&mut self.partial);
                self.decode_line(&assembled, &mut report);
            }
        }

        if !rest.is_empty() {
            self.partial.extend_from_slice(rest);
            if self.partial.len() > self.max_frame_bytes {
                report.push_error(FrameError::OversizedBuffer {
                    size: self.partial.len(),
                    max: self.max_frame_bytes,
                });
                self.partial.clear();
            }
        }

        report
    }

    /// Flushes a trailing line left without its delimiter, typically after
    /// the peer closed the connection.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        if !self.partial.is_empty() {
            let tail = std::mem::take(&mut self.partial);
            self.decode_line(&tail, &mut report);
        }
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        let line = trim_eol(line);
        if line.is_empty() {
            return;
        }
        if line.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(frame) => report.push_frame(frame),
            Err(err) => report.push_error(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg: WireMsg) -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            channel: "installer".to_string(),
            sender_id: "console-1".to_string(),
            timestamp: "2026-08-29T10:00:00Z".to_string(),
            request_id: None,
            msg,
        }
    }

    #[test]
    fn envelope_round_trips_for_representative_variants() {
        let status = envelope(WireMsg::OperationStatus(OperationStatusPayload {
            operation: OperationKind::Install,
            status: StatusPhase::InProgress,
            message: "extracting image".to_string(),
            progress: Some(40),
            error: None,
            target: Some("registry-a".to_string()),
            details: Some(serde_json::json!({"layer": 3})),
        }));
        let action = WireEnvelope {
            request_id: Some("req-3".to_string()),
            ..envelope(WireMsg::Action(ActionPayload {
                action: "restart_service".to_string(),
                target: Some("registry-a".to_string()),
                args: serde_json::json!({"force": true}),
            }))
        };
        let cancel = envelope(WireMsg::Cancel(CancelPayload {
            operation: OperationKind::Install,
            target: Some("registry-a".to_string()),
        }));
        let check = envelope(WireMsg::CheckStatus(CheckStatusPayload::default()));

        for message in [status, action, cancel, check] {
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            let decoded: WireEnvelope =
                decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn terminal_chunk_accepts_raw_and_wrapped_forms() {
        let raw: TerminalChunk = serde_json::from_str(r#""abc""#).expect("raw chunk");
        assert_eq!(raw.into_line(), "abc");

        let wrapped: TerminalChunk =
            serde_json::from_str(r#"{"data":"abc"}"#).expect("wrapped chunk");
        assert_eq!(wrapped.into_line(), "abc");
    }

    #[test]
    fn decoder_recovers_after_malformed_json_line() {
        let valid_a = encode_frame(
            &envelope(WireMsg::CheckStatus(CheckStatusPayload::default())),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode first");
        let malformed = b"{\"not\":\"valid\"\n";
        let valid_b = encode_frame(
            &envelope(WireMsg::TerminalOutput(TerminalChunk::Raw(
                "pulled base layer".to_string(),
            ))),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode second");

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&valid_a);
        chunk.extend_from_slice(malformed);
        chunk.extend_from_slice(&valid_b);

        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn decoder_reassembles_lines_split_across_chunks() {
        let frame = encode_frame(
            &envelope(WireMsg::TerminalOutput(TerminalChunk::Raw(
                "layer 2/4 done".to_string(),
            ))),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let split = frame.len() / 2;

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let first = decoder.push_chunk(&frame[..split]);
        assert!(first.is_empty(), "nothing decodable before the delimiter");

        let second = decoder.push_chunk(&frame[split..]);
        assert_eq!(second.frames.len(), 1);
        assert!(second.errors.is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_rejects_oversized_line_and_continues() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let valid = encode_frame(
            &envelope(WireMsg::CheckStatus(CheckStatusPayload::default())),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode valid");

        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(&valid);

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(1_024);
        let report = decoder.push_chunk(&chunk);

        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = envelope(WireMsg::TerminalOutput(TerminalChunk::Raw("x".repeat(256))));
        let result = encode_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        let body = r#""channel": "installer",
                "sender_id": "console-1",
                "timestamp": "2026-08-29T10:00:00Z",
                "type": "check_status",
                "payload": {}"#;

        let string_version: WireEnvelope =
            serde_json::from_str(&format!("{{\"version\": \"1\", {body}}}"))
                .expect("parse string version");
        assert_eq!(string_version.version, ProtocolVersion(1));

        let numeric_version: WireEnvelope =
            serde_json::from_str(&format!("{{\"version\": 1, {body}}}"))
                .expect("parse numeric version");
        assert_eq!(numeric_version.version, ProtocolVersion(1));

        let missing_version: WireEnvelope =
            serde_json::from_str(&format!("{{{body}}}")).expect("parse missing version");
        assert_eq!(missing_version.version, ProtocolVersion::CURRENT);
    }
}
