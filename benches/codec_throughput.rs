use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cribcall_core::canonical_json::to_canonical_bytes;
use cribcall_core::framing::{encode_frame, FrameDecoder};
use serde_json::json;

fn sample_noise_event() -> serde_json::Value {
    json!({
        "type": "NOISE_EVENT",
        "payload": {
            "source_device_id": "c0ffee-device",
            "monitor_display_name": "Nursery Monitor",
            "peak_level": 87,
            "timestamp_ms": 1_732_000_000_000i64,
        }
    })
}

fn codec_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let value = sample_noise_event();
    group.bench_function("canonical_json_encode", |b| {
        b.iter(|| black_box(to_canonical_bytes(&value).unwrap()));
    });

    let canonical = to_canonical_bytes(&value).unwrap();
    group.bench_function("frame_encode", |b| {
        b.iter(|| black_box(encode_frame(&canonical).unwrap()));
    });

    let frame = encode_frame(&canonical).unwrap();
    group.bench_function("frame_decode_single_push", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.push(&frame);
            black_box(decoder.next_frame().unwrap().unwrap());
        });
    });

    group.bench_function("frame_decode_byte_at_a_time", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            for byte in &frame {
                decoder.push(std::slice::from_ref(byte));
            }
            black_box(decoder.next_frame().unwrap().unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, codec_benchmarks);
criterion_main!(benches);
