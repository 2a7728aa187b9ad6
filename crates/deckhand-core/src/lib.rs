pub mod merge;
pub mod wire;

pub use merge::merge_object;
pub use wire::{
    decode_frame, encode_frame, ActionPayload, CancelPayload, CheckStatusPayload, DecodeReport,
    FrameError, HelloPayload, NdjsonFrameDecoder, OperationKind, OperationStatusPayload,
    ProtocolVersion, StatusPhase, TerminalChunk, WireEnvelope, WireMsg,
    CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_BYTES,
};
