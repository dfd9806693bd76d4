//! Host/guest vsock wire protocol: message shapes and length-prefixed
//! framing. Shared verbatim by the host-side client (`vulcan-firecracker`)
//! and the in-VM guest agent (`vulcan-guest-agent`) so the two stay
//! wire-compatible by construction instead of by convention.
//!
//! Framing: `[u32 big-endian length][JSON payload]`. `decode` rejects
//! `length > MAX_FRAME_BYTES` before allocating a buffer, bounding memory
//! against a misbehaving or malicious peer.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame's payload size (16 MiB).
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Host -> guest: what to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestRequest {
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_archive: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    pub timeout_s: u64,
}

/// The terminal payload of a `GuestMessage { type: "result", .. }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GuestResponse {
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_lines: Option<Vec<String>>,
}

/// Guest -> host envelope. Tagged by `type`: either a streamed `log` line or
/// the single terminal `result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuestMessage {
    Log { line: String },
    Result { response: GuestResponse },
}

/// A protocol-layer failure: anything that does not fit the shapes above.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(u32, u32),
    #[error("malformed JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("connection closed mid-frame")]
    Truncated,
}

/// Encode `msg` as a length-prefixed frame ready to write to the socket.
///
/// # Errors
///
/// Returns `FramingError::InvalidJson` if `msg` cannot be serialized (never
/// happens for the types in this module, but the signature stays fallible
/// for forward compatibility).
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FramingError> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(len);
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

/// Decode one frame's length prefix. Call this first on a 4-byte read, then
/// read exactly that many bytes and pass them to `decode_payload`.
///
/// # Errors
///
/// Returns `FramingError::FrameTooLarge` if the declared length exceeds
/// `MAX_FRAME_BYTES`, *before* any payload bytes are read. This is the
/// point that bounds memory against an oversized declared length.
pub fn decode_length(mut header: &[u8]) -> Result<u32, FramingError> {
    let len = header.get_u32();
    if len > MAX_FRAME_BYTES {
        return Err(FramingError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    Ok(len)
}

/// Deserialize a payload already read in full.
///
/// # Errors
///
/// Returns `FramingError::InvalidJson` if `payload` is not valid JSON for
/// `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, FramingError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_request_round_trips() {
        let req = GuestRequest {
            runtime: "node".to_string(),
            code: Some("console.log('hi')".to_string()),
            code_archive: None,
            input: None,
            env: HashMap::new(),
            entrypoint: None,
            timeout_s: 30,
        };
        let framed = encode(&req).unwrap();
        let len = decode_length(&framed[0..4]).unwrap();
        let decoded: GuestRequest = decode_payload(&framed[4..4 + len as usize]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn guest_message_log_round_trips() {
        let msg = GuestMessage::Log {
            line: "a\nb\nc".to_string(),
        };
        let framed = encode(&msg).unwrap();
        let len = decode_length(&framed[0..4]).unwrap();
        let decoded: GuestMessage = decode_payload(&framed[4..4 + len as usize]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn guest_message_result_round_trips() {
        let msg = GuestMessage::Result {
            response: GuestResponse {
                exit_code: Some(0),
                output: b"hi".to_vec(),
                error: None,
                log_lines: None,
            },
        };
        let framed = encode(&msg).unwrap();
        let len = decode_length(&framed[0..4]).unwrap();
        let decoded: GuestMessage = decode_payload(&framed[4..4 + len as usize]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_length_rejects_oversized_frame_before_allocating() {
        let mut header = BytesMut::new();
        header.put_u32(MAX_FRAME_BYTES + 1);
        let err = decode_length(&header).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge(_, _)));
    }

    #[test]
    fn decode_length_accepts_exactly_the_limit() {
        let mut header = BytesMut::new();
        header.put_u32(MAX_FRAME_BYTES);
        assert_eq!(decode_length(&header).unwrap(), MAX_FRAME_BYTES);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = decode_payload::<GuestRequest>(b"not json").unwrap_err();
        assert!(matches!(err, FramingError::InvalidJson(_)));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn guest_request_round_trip_arbitrary(
            runtime in "[a-z]{1,10}",
            code in proptest::option::of("[ -~]{0,64}"),
            timeout_s in 0u64..100_000,
        ) {
            let req = GuestRequest {
                runtime,
                code,
                code_archive: None,
                input: None,
                env: HashMap::new(),
                entrypoint: None,
                timeout_s,
            };
            let framed = encode(&req).unwrap();
            let len = decode_length(&framed[0..4]).unwrap();
            let decoded: GuestRequest = decode_payload(&framed[4..4 + len as usize]).unwrap();
            prop_assert_eq!(decoded, req);
        }
    }
}
