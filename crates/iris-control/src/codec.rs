//! Control-protocol framing.
//!
//! The wire format is deliberately simple, and bit-exact compatibility
//! matters, since external tooling speaks it:
//!
//! ```text
//! Frame := ControlByte(1) Length(8, big-endian u64) Payload(Length bytes)
//! ControlByte bit0 = ENCRYPTED, bit1 = COMMAND, other bits reserved = 0
//! If COMMAND (after decryption): Payload := CommandId(2, big-endian u16) JSONBody
//! ```
//!
//! Encrypted payload chunking lives in [`crate::envelope`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{FLAG_COMMAND, FLAG_ENCRYPTED};
use crate::error::{ControlError, ControlResult};

/// Control byte plus length prefix.
const HEADER_LEN: usize = 9;

/// One control-protocol frame, payload still raw (possibly encrypted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// The raw control byte.
    pub flags: u8,
    /// The frame payload.
    pub payload: Bytes,
}

impl ControlFrame {
    /// Whether the ENCRYPTED bit is set.
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Whether the COMMAND bit is set.
    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }
}

/// Outcome of a control-frame decode attempt.
#[derive(Debug)]
pub enum DecodedControl {
    /// The buffer holds less than one full frame; nothing consumed.
    Incomplete,
    /// One complete frame, consumed from the buffer.
    Frame(ControlFrame),
}

/// Decode a single frame from the front of `buf`.
pub fn decode(buf: &mut BytesMut) -> DecodedControl {
    if buf.len() < HEADER_LEN {
        return DecodedControl::Incomplete;
    }

    let flags = buf[0];
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[1..9]);
    let payload_len = u64::from_be_bytes(len_bytes) as usize;

    if buf.len() < HEADER_LEN + payload_len {
        return DecodedControl::Incomplete;
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).freeze();

    DecodedControl::Frame(ControlFrame { flags, payload })
}

/// Encode one frame.
pub fn encode(flags: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(flags);
    out.put_u64(payload.len() as u64);
    out.put_slice(payload);
    out.freeze()
}

/// Build a command cleartext: id followed by the JSON body.
///
/// Id zero is reserved for the custom-command path and cannot be
/// encoded explicitly.
pub fn encode_command(id: u16, body: &serde_json::Value) -> ControlResult<Vec<u8>> {
    if id == 0 {
        return Err(ControlError::CommandType);
    }
    let json =
        serde_json::to_vec(body).map_err(|e| ControlError::MessageFormat(e.to_string()))?;
    let mut out = Vec::with_capacity(2 + json.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Split a command cleartext into id and JSON body.
pub fn decode_command(cleartext: &[u8]) -> ControlResult<(u16, serde_json::Value)> {
    if cleartext.len() < 2 {
        return Err(ControlError::MessageFormat(
            "command payload shorter than the id".to_string(),
        ));
    }
    let id = u16::from_be_bytes([cleartext[0], cleartext[1]]);
    let body = serde_json::from_slice(&cleartext[2..])
        .map_err(|e| ControlError::MessageFormat(e.to_string()))?;
    Ok((id, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_layout_is_bit_exact() {
        let frame = encode(FLAG_COMMAND, b"abc");
        assert_eq!(frame.len(), 9 + 3);
        assert_eq!(frame[0], 0x02);
        assert_eq!(&frame[1..9], &3u64.to_be_bytes());
        assert_eq!(&frame[9..], b"abc");
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(FLAG_ENCRYPTED | FLAG_COMMAND, b"payload"));

        match decode(&mut buf) {
            DecodedControl::Frame(frame) => {
                assert!(frame.is_encrypted());
                assert!(frame.is_command());
                assert_eq!(&frame.payload[..], b"payload");
            }
            DecodedControl::Incomplete => panic!("expected a frame"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_needs_nine_header_bytes() {
        let mut buf = BytesMut::from(&[0x00u8; 8][..]);
        assert!(matches!(decode(&mut buf), DecodedControl::Incomplete));
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_decode_waits_for_full_payload() {
        let full = encode(0, b"0123456789");
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(matches!(decode(&mut buf), DecodedControl::Incomplete));

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(matches!(decode(&mut buf), DecodedControl::Frame(_)));
    }

    #[test]
    fn test_pipelined_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(0, b"one"));
        buf.extend_from_slice(&encode(0, b"two"));

        let DecodedControl::Frame(first) = decode(&mut buf) else {
            panic!("expected first frame");
        };
        assert_eq!(&first.payload[..], b"one");
        let DecodedControl::Frame(second) = decode(&mut buf) else {
            panic!("expected second frame");
        };
        assert_eq!(&second.payload[..], b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_command_roundtrip() {
        let body = json!({"auth": true, "error": 0});
        let cleartext = encode_command(1000, &body).unwrap();
        assert_eq!(&cleartext[..2], &1000u16.to_be_bytes());

        let (id, decoded) = decode_command(&cleartext).unwrap();
        assert_eq!(id, 1000);
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_command_id_zero_rejected() {
        assert!(matches!(
            encode_command(0, &json!({})),
            Err(ControlError::CommandType)
        ));
    }

    #[test]
    fn test_decode_command_garbage_json() {
        let mut cleartext = 1001u16.to_be_bytes().to_vec();
        cleartext.extend_from_slice(b"{not json");
        assert!(matches!(
            decode_command(&cleartext),
            Err(ControlError::MessageFormat(_))
        ));
    }
}
