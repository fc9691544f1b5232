//! Integration coverage for the canonical-JSON + framing codec pair
//! exactly as a transport implementation would use them back to back.

use cribcall_core::canonical_json::to_canonical_bytes;
use cribcall_core::framing::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
use serde_json::json;

#[test]
fn canonical_encode_then_frame_then_decode_byte_by_byte() {
    let value = json!({
        "type": "NOISE_EVENT",
        "payload": {
            "timestamp_ms": 10,
            "peak_level": 72,
            "source_device_id": "device-9",
            "monitor_display_name": "Nursery",
        }
    });
    let canonical = to_canonical_bytes(&value).unwrap();
    let frame = encode_frame(&canonical).unwrap();

    let mut decoder = FrameDecoder::new();
    for byte in &frame {
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(std::slice::from_ref(byte));
    }
    let decoded = decoder.next_frame().unwrap().unwrap();
    assert_eq!(decoded, canonical);

    let redecoded: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(redecoded["payload"]["peak_level"], 72);
}

#[test]
fn frame_at_exactly_max_len_boundary_is_accepted_one_over_is_not() {
    let exactly_max = vec![b'a'; MAX_FRAME_LEN];
    assert!(encode_frame(&exactly_max).is_ok());

    let one_over = vec![b'a'; MAX_FRAME_LEN + 1];
    assert!(encode_frame(&one_over).is_err());
}

#[test]
fn decoder_recovers_multiple_back_to_back_frames_split_arbitrarily() {
    let frame_a = encode_frame(&to_canonical_bytes(&json!({"type": "PING", "nonce": 1})).unwrap()).unwrap();
    let frame_b = encode_frame(&to_canonical_bytes(&json!({"type": "PONG", "nonce": 1})).unwrap()).unwrap();

    let mut combined = frame_a.clone();
    combined.extend_from_slice(&frame_b);

    let mut decoder = FrameDecoder::new();
    for chunk in combined.chunks(7) {
        decoder.push(chunk);
    }

    let first = decoder.next_frame().unwrap().unwrap();
    let second = decoder.next_frame().unwrap().unwrap();
    assert_eq!(first, to_canonical_bytes(&json!({"type": "PING", "nonce": 1})).unwrap());
    assert_eq!(second, to_canonical_bytes(&json!({"type": "PONG", "nonce": 1})).unwrap());
    assert!(decoder.next_frame().unwrap().is_none());
}
