//! y-websocket wire protocol: framing and parsing of the three message
//! kinds carried over binary WebSocket frames.
//!
//! Wire format:
//! ```text
//! ┌───────────┬───────────────────┬─────────────────────────────┐
//! │ type byte │ varint(len)       │ payload[len]                │
//! ├───────────┼───────────────────┼─────────────────────────────┤
//! │ 0 (step1) │ state vector len  │ encoded state vector        │
//! │ 1 (step2) │ update len        │ encoded CRDT update         │
//! │ 2 (aware) │ outer payload len │ varint(client_id)           │
//! │           │                   │ varint(json_len) json bytes │
//! └───────────┴───────────────────┴─────────────────────────────┘
//! ```
//!
//! Every WebSocket frame is exactly one message. Encoders allocate a fresh
//! buffer; the decoder borrows sync payloads straight out of the input and
//! only copies the awareness JSON, since the transport buffer is not kept.

use thiserror::Error;

use crate::varint::{self, VarintError};

/// Message type byte: sync step 1 (state vector).
pub const MSG_SYNC_STEP1: u8 = 0;
/// Message type byte: sync step 2 (update).
pub const MSG_SYNC_STEP2: u8 = 1;
/// Message type byte: awareness (presence).
pub const MSG_AWARENESS: u8 = 2;

/// A parsed inbound message.
///
/// Sync payloads borrow from the receive buffer. An awareness frame with
/// `state: None` is a removal — the client cleared its presence — which is
/// not the same thing as a peer we never heard awareness from.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    SyncStep1 { state_vector: &'a [u8] },
    SyncStep2 { update: &'a [u8] },
    Awareness { client_id: u32, state: Option<String> },
}

impl Frame<'_> {
    /// Human-readable kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SyncStep1 { .. } => "SYNC_STEP1",
            Frame::SyncStep2 { .. } => "SYNC_STEP2",
            Frame::Awareness { .. } => "AWARENESS",
        }
    }
}

/// Frame-level decode errors. All of these drop the frame and keep the
/// session; none are fatal to the server.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("bad frame: {0}")]
    BadVarint(#[from] VarintError),
    #[error("truncated frame: declared {declared} payload bytes, {remaining} remain")]
    Truncated { declared: usize, remaining: usize },
    #[error("awareness state is not valid UTF-8")]
    InvalidJson,
}

/// Encode a sync-step-1 frame carrying an encoded state vector.
pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    encode_length_prefixed(MSG_SYNC_STEP1, state_vector)
}

/// Encode a sync-step-2 frame carrying an encoded update.
///
/// An empty update is legal: it is the "already caught up" reply.
pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    encode_length_prefixed(MSG_SYNC_STEP2, update)
}

/// Encode an awareness frame. `state: None` encodes a removal
/// (`json_len = 0`), announcing that the client's presence is gone.
pub fn encode_awareness(client_id: u32, state: Option<&str>) -> Vec<u8> {
    let json = state.map(str::as_bytes).unwrap_or_default();

    let inner_len = varint::encoded_len(client_id)
        + varint::encoded_len(json.len() as u32)
        + json.len();

    let mut buf =
        Vec::with_capacity(1 + varint::encoded_len(inner_len as u32) + inner_len);
    buf.push(MSG_AWARENESS);
    varint::encode(inner_len as u32, &mut buf);
    varint::encode(client_id, &mut buf);
    varint::encode(json.len() as u32, &mut buf);
    buf.extend_from_slice(json);
    buf
}

fn encode_length_prefixed(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(1 + varint::encoded_len(payload.len() as u32) + payload.len());
    buf.push(kind);
    varint::encode(payload.len() as u32, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Parse one inbound frame.
pub fn decode(data: &[u8]) -> Result<Frame<'_>, FrameError> {
    let (&kind, rest) = data.split_first().ok_or(FrameError::Empty)?;

    match kind {
        MSG_SYNC_STEP1 => {
            let payload = decode_length_prefixed(rest)?;
            Ok(Frame::SyncStep1 { state_vector: payload })
        }
        MSG_SYNC_STEP2 => {
            let payload = decode_length_prefixed(rest)?;
            Ok(Frame::SyncStep2 { update: payload })
        }
        MSG_AWARENESS => {
            let payload = decode_length_prefixed(rest)?;
            decode_awareness_payload(payload)
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

/// Read `varint(len) || bytes[len]`, rejecting lengths past the input.
fn decode_length_prefixed(data: &[u8]) -> Result<&[u8], FrameError> {
    let (len, consumed) = varint::decode(data)?;
    let len = len as usize;
    let remaining = data.len() - consumed;
    if len > remaining {
        return Err(FrameError::Truncated { declared: len, remaining });
    }
    Ok(&data[consumed..consumed + len])
}

fn decode_awareness_payload(payload: &[u8]) -> Result<Frame<'static>, FrameError> {
    let (client_id, consumed) = varint::decode(payload)?;
    let rest = &payload[consumed..];

    let (json_len, consumed) = varint::decode(rest)?;
    let json_len = json_len as usize;
    let rest = &rest[consumed..];
    if json_len > rest.len() {
        return Err(FrameError::Truncated { declared: json_len, remaining: rest.len() });
    }

    let state = if json_len == 0 {
        None
    } else {
        let json = std::str::from_utf8(&rest[..json_len])
            .map_err(|_| FrameError::InvalidJson)?;
        Some(json.to_owned())
    };

    Ok(Frame::Awareness { client_id, state })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_roundtrip() {
        let sv = vec![10u8, 20, 30, 40];
        let encoded = encode_sync_step1(&sv);
        assert_eq!(encoded[0], MSG_SYNC_STEP1);

        let frame = decode(&encoded).unwrap();
        assert_eq!(frame, Frame::SyncStep1 { state_vector: &sv });
    }

    #[test]
    fn test_sync_step1_empty_state_vector() {
        let encoded = encode_sync_step1(&[]);
        assert_eq!(encoded, vec![MSG_SYNC_STEP1, 0x00]);
        let frame = decode(&encoded).unwrap();
        assert_eq!(frame, Frame::SyncStep1 { state_vector: &[] });
    }

    #[test]
    fn test_sync_step2_roundtrip() {
        let update = vec![1u8, 2, 3, 4, 5];
        let encoded = encode_sync_step2(&update);
        let frame = decode(&encoded).unwrap();
        assert_eq!(frame, Frame::SyncStep2 { update: &update });
    }

    #[test]
    fn test_sync_step2_empty_update() {
        // The "already caught up" reply.
        let encoded = encode_sync_step2(&[]);
        let frame = decode(&encoded).unwrap();
        assert_eq!(frame, Frame::SyncStep2 { update: &[] });
    }

    #[test]
    fn test_sync_step2_large_update() {
        let update = vec![42u8; 65_536];
        let encoded = encode_sync_step2(&update);
        match decode(&encoded).unwrap() {
            Frame::SyncStep2 { update: decoded } => {
                assert_eq!(decoded.len(), 65_536);
                assert_eq!(decoded, &update[..]);
            }
            other => panic!("expected SyncStep2, got {other:?}"),
        }
    }

    #[test]
    fn test_awareness_roundtrip() {
        let json = r#"{"cursor":3,"user":"alice"}"#;
        let encoded = encode_awareness(42, Some(json));
        assert_eq!(encoded[0], MSG_AWARENESS);

        match decode(&encoded).unwrap() {
            Frame::Awareness { client_id, state } => {
                assert_eq!(client_id, 42);
                assert_eq!(state.as_deref(), Some(json));
            }
            other => panic!("expected Awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_awareness_removal_roundtrip() {
        let encoded = encode_awareness(7, None);
        match decode(&encoded).unwrap() {
            Frame::Awareness { client_id, state } => {
                assert_eq!(client_id, 7);
                assert_eq!(state, None);
            }
            other => panic!("expected Awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_awareness_large_client_id() {
        let encoded = encode_awareness(u32::MAX, Some("{}"));
        match decode(&encoded).unwrap() {
            Frame::Awareness { client_id, state } => {
                assert_eq!(client_id, u32::MAX);
                assert_eq!(state.as_deref(), Some("{}"));
            }
            other => panic!("expected Awareness, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode_awareness(99, Some(r#"{"cursor":1}"#));
        let b = encode_awareness(99, Some(r#"{"cursor":1}"#));
        assert_eq!(a, b);
        assert_eq!(encode_sync_step2(&[1, 2, 3]), encode_sync_step2(&[1, 2, 3]));
    }

    #[test]
    fn test_frame_kind_names() {
        assert_eq!(decode(&encode_sync_step1(&[])).unwrap().kind(), "SYNC_STEP1");
        assert_eq!(decode(&encode_sync_step2(&[])).unwrap().kind(), "SYNC_STEP2");
        assert_eq!(decode(&encode_awareness(1, None)).unwrap().kind(), "AWARENESS");
    }

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert_eq!(decode(&[0x05]), Err(FrameError::UnknownKind(5)));
        assert_eq!(decode(&[0xFF, 0x00]), Err(FrameError::UnknownKind(255)));
    }

    #[test]
    fn test_decode_missing_length() {
        // Type byte alone: the length varint is truncated, not the payload.
        assert_eq!(
            decode(&[MSG_SYNC_STEP1]),
            Err(FrameError::BadVarint(VarintError::Truncated))
        );
    }

    #[test]
    fn test_decode_bad_length_varint() {
        assert_eq!(
            decode(&[MSG_SYNC_STEP2, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]),
            Err(FrameError::BadVarint(VarintError::Overflow))
        );
    }

    #[test]
    fn test_decode_declared_length_past_end() {
        // Claims 10 payload bytes, carries 2.
        assert_eq!(
            decode(&[MSG_SYNC_STEP2, 10, 0xAA, 0xBB]),
            Err(FrameError::Truncated { declared: 10, remaining: 2 })
        );
    }

    #[test]
    fn test_decode_awareness_truncated_inner() {
        // Outer payload is consistent but the inner json_len overruns it.
        let mut buf = vec![MSG_AWARENESS];
        // outer_len = 3: client_id=1 (1 byte), json_len=5 (1 byte), 1 json byte
        buf.extend_from_slice(&[3, 1, 5, b'{']);
        assert_eq!(
            decode(&buf),
            Err(FrameError::Truncated { declared: 5, remaining: 1 })
        );
    }

    #[test]
    fn test_decode_awareness_invalid_utf8() {
        let mut buf = vec![MSG_AWARENESS];
        buf.extend_from_slice(&[4, 1, 2, 0xC3, 0x28]); // broken 2-byte sequence
        assert_eq!(decode(&buf), Err(FrameError::InvalidJson));
    }

    #[test]
    fn test_decode_ignores_trailing_garbage_outside_payload() {
        // The outer length bounds the payload; anything after it is not ours
        // to interpret, and sync decoding must not read past the declaration.
        let mut encoded = encode_sync_step2(&[9, 9]);
        encoded.extend_from_slice(&[0xDE, 0xAD]);
        match decode(&encoded).unwrap() {
            Frame::SyncStep2 { update } => assert_eq!(update, &[9, 9]),
            other => panic!("expected SyncStep2, got {other:?}"),
        }
    }
}
