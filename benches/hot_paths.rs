use criterion::{black_box, criterion_group, criterion_main, Criterion};

use loginflow::enrich::process_payload;
use loginflow::event::decode::{decode_event, normalize_timestamp};
use loginflow::event::DeviceType;
use loginflow::state::AggregationState;

fn login_payload(user_id: &str, ip: &str) -> Vec<u8> {
    serde_json::json!({
        "user_id": user_id,
        "app_version": "2.3.0",
        "device_type": "Android",
        "ip": ip,
        "locale": "NC",
        "device_id": "d1",
        "timestamp": "1711302636",
    })
    .to_string()
    .into_bytes()
}

fn bench_decode(c: &mut Criterion) {
    let payload = login_payload("u1", "1.2.3.4");

    c.bench_function("decode_event", |b| {
        b.iter(|| decode_event(black_box(&payload)).expect("valid payload"))
    });
}

fn bench_normalize_timestamp(c: &mut Criterion) {
    c.bench_function("normalize_timestamp", |b| {
        b.iter(|| normalize_timestamp(black_box("1711302636")).expect("valid timestamp"))
    });
}

fn bench_observe_hot_key(c: &mut Criterion) {
    let state = AggregationState::new();
    let event = decode_event(&login_payload("u1", "1.2.3.4")).expect("valid payload");

    c.bench_function("observe_hot_key", |b| {
        b.iter(|| state.observe(black_box(&event), DeviceType::Android))
    });
}

fn bench_observe_cold_keys(c: &mut Criterion) {
    let state = AggregationState::new();
    let mut i = 0u64;

    c.bench_function("observe_cold_keys", |b| {
        b.iter(|| {
            i += 1;
            let event = decode_event(&login_payload(
                &format!("user-{i}"),
                &format!("10.0.{}.{}", (i >> 8) & 0xff, i & 0xff),
            ))
            .expect("valid payload");
            state.observe(black_box(&event), DeviceType::Android)
        })
    });
}

fn bench_full_pipeline(c: &mut Criterion) {
    let state = AggregationState::new();
    let payload = login_payload("u1", "1.2.3.4");

    c.bench_function("process_payload", |b| {
        b.iter(|| process_payload(black_box(&payload), &state).expect("accepted"))
    });
}

criterion_group!(
    benches,
    bench_decode,
    bench_normalize_timestamp,
    bench_observe_hot_key,
    bench_observe_cold_keys,
    bench_full_pipeline,
);
criterion_main!(benches);
