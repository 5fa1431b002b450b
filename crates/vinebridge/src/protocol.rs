//! Wire protocol for the bridge sockets.
//!
//! Every frame on the dispatch and callback channels is an [`Event`] going out
//! and an [`EventResult`] coming back. The processor channel carries its own
//! request/response pair for the audio-thread call category.

use serde::{Deserialize, Serialize};

/// The close opcode of the plugin ABI. Reserved: the host shim intercepts it
/// locally to tear the session down instead of forwarding it.
pub const OPCODE_CLOSE: i32 = 1;

/// Scratch buffer size used when the caller expects a string back but sent an
/// uninitialized buffer ([`EventPayload::WantsString`]). Far larger than any
/// string the plugin ABI defines.
pub const MAX_STRING_LENGTH: usize = 256;

/// Payload accompanying an event's scalar fields.
///
/// This is a closed set; every consumer matches exhaustively. Collapsing
/// `WantsString` into an empty `Str` would corrupt legitimate empty-string
/// returns, which is the whole reason the sentinel exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// No payload; the data pointer was null or the opcode forbids payload.
    None,
    /// The bytes of a NUL-terminated C string read from the data pointer,
    /// without the terminator. Raw bytes rather than `String`: plugins emit
    /// locale-encoded text (CP-1252 preset names are common) and the round
    /// trip must be byte-exact.
    Str(Vec<u8>),
    /// A raw byte buffer. `reserve` is extra trailing capacity the callee may
    /// write into beyond `data.len()`.
    Buffer { data: Vec<u8>, reserve: usize },
    /// The caller passed a writable buffer whose first byte was zero: it wants
    /// a string back, but the contents were indistinguishable from
    /// uninitialized memory.
    WantsString,
}

/// One in-flight plugin-API call. Exists only for a single
/// encode, send, receive, decode cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub opcode: i32,
    pub index: i32,
    /// Word-sized by ABI convention; sometimes reinterpreted as a pointer or
    /// handle by the opcode's semantics. Always widened to 64 bits on the wire.
    pub value: isize,
    pub option: f32,
    pub payload: EventPayload,
}

/// Response to an [`Event`]: the opcode's integer return plus any
/// out-parameter data to write back into the caller's buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub return_value: isize,
    pub payload: EventPayload,
}

/// Audio-thread request forwarded over the processor channel. These reuse the
/// same blocking request/response pattern as dispatch, on a channel of their
/// own so audio traffic never interleaves with GUI-thread dispatch calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessorRequest {
    Process {
        inputs: Vec<Vec<f32>>,
        frames: i32,
    },
    ProcessReplacing {
        inputs: Vec<Vec<f32>>,
        frames: i32,
    },
    SetParameter {
        index: i32,
        value: f32,
    },
    GetParameter {
        index: i32,
    },
}

/// Response to a [`ProcessorRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessorResponse {
    Audio { outputs: Vec<Vec<f32>> },
    ParameterSet,
    Parameter { value: f32 },
}
