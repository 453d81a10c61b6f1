//! Length-prefixed envelope framing and the message staleness rule.

use crate::peer::{PeerEnvelope, PeerMessage, PROTOCOL_VERSION};
use hotpocket_types::epoch_millis;
use serde::{Deserialize, Serialize};

/// Messages larger than this skip the staleness check; big sync payloads
/// legitimately spend longer in flight than small consensus traffic.
pub const MAX_SIZE_FOR_TIME_CHECK: usize = 1024 * 1024;

/// Hard cap on a single frame; anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame length prefix exceeds the cap.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    FrameTooLarge(usize),
    /// The payload did not deserialize.
    #[error("malformed message: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Encode a message into a length-prefixed frame, stamping the version
/// and the current wall clock.
pub fn encode_envelope(content: PeerMessage) -> Result<Vec<u8>, CodecError> {
    encode_envelope_at(content, epoch_millis())
}

/// Encode with an explicit timestamp (tests, replays).
pub fn encode_envelope_at(content: PeerMessage, created_on: u64) -> Result<Vec<u8>, CodecError> {
    let envelope = PeerEnvelope {
        version: PROTOCOL_VERSION,
        created_on,
        content,
    };
    let body = serialize(&envelope)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (length prefix already stripped by the transport).
pub fn decode_envelope(body: &[u8]) -> Result<PeerEnvelope, CodecError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    deserialize(body)
}

/// Whether a message is too old to process.
///
/// Messages at most 1 MiB are dropped when their `created_on` lags the
/// local clock by more than `3 × roundtime`; larger messages pass
/// unconditionally.
pub fn is_stale(created_on: u64, now: u64, roundtime_ms: u32, frame_len: usize) -> bool {
    if frame_len > MAX_SIZE_FOR_TIME_CHECK {
        return false;
    }
    created_on < now.saturating_sub(3 * roundtime_ms as u64)
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}
