//! Round-trip properties of the frame codec.
//!
//! Encodes messages across the interesting payload-size boundaries and
//! through the fragmentation path, then decodes and reassembles them,
//! checking that opcode and payload survive unchanged.

use bytes::BytesMut;
use iris_proto::fragment::FragmentBuffer;
use iris_proto::frame::{self, Decoded};
use iris_proto::opcode::Opcode;
use proptest::prelude::*;

/// Decode every frame in `wire` and reassemble data messages.
fn decode_all(wire: &mut BytesMut) -> Vec<(Opcode, Vec<u8>)> {
    let mut assembler = FragmentBuffer::new();
    let mut out = Vec::new();
    loop {
        match frame::decode(wire).expect("decode failed") {
            Decoded::Incomplete => break,
            Decoded::Frame(f) => {
                if f.opcode.is_control() {
                    out.push((f.opcode, f.payload.to_vec()));
                } else if let Some(msg) = assembler.push(f).expect("bad fragment sequence") {
                    out.push((msg.opcode, msg.payload.to_vec()));
                }
            }
        }
    }
    out
}

fn roundtrip(opcode: Opcode, payload: &[u8], masked: bool) {
    let frames = frame::encode_message(opcode, payload, masked, 0xFFFF).expect("encode failed");
    let mut wire = BytesMut::new();
    for f in &frames {
        wire.extend_from_slice(f);
    }

    let messages = decode_all(&mut wire);
    assert_eq!(messages.len(), 1, "expected exactly one message");
    assert_eq!(messages[0].0, opcode);
    assert_eq!(messages[0].1, payload);
    assert!(wire.is_empty());
}

#[test]
fn data_opcodes_roundtrip_at_boundary_sizes() {
    for opcode in [Opcode::Text, Opcode::Binary] {
        for size in [0usize, 1, 125, 126, 65535, 65536, 70000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            roundtrip(opcode, &payload, false);
            roundtrip(opcode, &payload, true);
        }
    }
}

#[test]
fn control_opcodes_roundtrip_at_boundary_sizes() {
    for opcode in [Opcode::Ping, Opcode::Pong, Opcode::Close] {
        for size in [0usize, 1, 125] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            roundtrip(opcode, &payload, false);
        }
    }
}

#[test]
fn interleaved_control_frame_mid_fragment() {
    // a ping may arrive between fragments of a data message
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&frame::encode_frame(Opcode::Text, b"he", false, false));
    wire.extend_from_slice(&frame::encode_frame(Opcode::Ping, b"k", true, false));
    wire.extend_from_slice(&frame::encode_frame(Opcode::Continuation, b"llo", true, false));

    let messages = decode_all(&mut wire);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], (Opcode::Ping, b"k".to_vec()));
    assert_eq!(messages[1], (Opcode::Text, b"hello".to_vec()));
}

proptest! {
    #[test]
    fn prop_any_payload_roundtrips(payload in proptest::collection::vec(any::<u8>(), 0..100_000)) {
        roundtrip(Opcode::Binary, &payload, false);
    }

    #[test]
    fn prop_masked_payload_roundtrips(payload in proptest::collection::vec(any::<u8>(), 0..20_000)) {
        roundtrip(Opcode::Binary, &payload, true);
    }

    #[test]
    fn prop_mask_is_involution(payload in proptest::collection::vec(any::<u8>(), 0..4096), key: [u8; 4]) {
        let mut data = payload.clone();
        frame::apply_mask(&mut data, key);
        frame::apply_mask(&mut data, key);
        prop_assert_eq!(data, payload);
    }

    #[test]
    fn prop_fragment_cap_respected(
        payload in proptest::collection::vec(any::<u8>(), 0..200_000),
        cap in 64usize..100_000,
    ) {
        let frames = frame::encode_message(Opcode::Binary, &payload, false, cap).unwrap();
        for f in &frames {
            prop_assert!(f.len() <= cap);
        }

        let mut wire = BytesMut::new();
        for f in &frames {
            wire.extend_from_slice(f);
        }
        let messages = decode_all(&mut wire);
        prop_assert_eq!(messages.len(), 1);
        prop_assert_eq!(&messages[0].1, &payload);
    }
}
