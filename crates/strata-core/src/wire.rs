//! Strata wire format — the frame layout all RPC traffic uses.
//!
//! These types ARE the protocol. Every message on a provider connection is:
//!
//! ```text
//! [u32 length][u64 call-id][u32 command-id][payload of `length` bytes]
//! ```
//!
//! All integers little-endian. The frame header is #[repr(C, packed)] with
//! zerocopy derives for deterministic layout and allocation-free parsing.
//! There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Call identifier, allocated per client handle by its access policy.
pub type CallId = u64;

/// Position of a command in its command set; the dispatch tag on the wire.
pub type CommandId = u32;

// ── Frame header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every RPC frame. Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Payload length in bytes, not including this header.
    pub length: u32,
    /// Echoed verbatim in the response so the client can match completions.
    pub call_id: u64,
    /// Index of the command in the provider's command set.
    pub command_id: u32,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 16]);

/// Largest accepted frame payload. A frame claiming more is a protocol error
/// and closes the connection.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

// ── Response envelope ─────────────────────────────────────────────────────────

/// First payload byte of a response frame: success carrying response bytes.
pub const RESPONSE_OK: u8 = 0;
/// First payload byte of a response frame: failure carrying a UTF-8 message.
pub const RESPONSE_ERR: u8 = 1;

/// Encode a response payload: `[u8 kind][u32 length][bytes]`.
pub fn encode_response(result: Result<&[u8], &str>) -> Vec<u8> {
    let (kind, body) = match result {
        Ok(bytes) => (RESPONSE_OK, bytes),
        Err(message) => (RESPONSE_ERR, message.as_bytes()),
    };
    let mut payload = Vec::with_capacity(1 + 4 + body.len());
    payload.push(kind);
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Decode a response payload into `Ok(response bytes)` or `Err(message)`.
pub fn decode_response(payload: &[u8]) -> Result<Result<Vec<u8>, String>, WireError> {
    let (&kind, rest) = payload
        .split_first()
        .ok_or(WireError::TruncatedResponse { have: 0, need: 1 })?;
    if rest.len() < 4 {
        return Err(WireError::TruncatedResponse {
            have: rest.len(),
            need: 4,
        });
    }
    let (length_bytes, body) = rest.split_at(4);
    let length = u32::from_le_bytes(length_bytes.try_into().unwrap()) as usize;
    if body.len() != length {
        return Err(WireError::TruncatedResponse {
            have: body.len(),
            need: length,
        });
    }
    match kind {
        RESPONSE_OK => Ok(Ok(body.to_vec())),
        RESPONSE_ERR => {
            let message = String::from_utf8_lossy(body).into_owned();
            Ok(Err(message))
        }
        other => Err(WireError::UnknownResponseKind(other)),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown response kind byte: 0x{0:02x}")]
    UnknownResponseKind(u8),

    #[error("truncated response payload: have {have} bytes, need {need}")]
    TruncatedResponse { have: usize, need: usize },

    #[error("frame payload length {0} exceeds maximum {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(u32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
