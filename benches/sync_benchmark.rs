use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use coauthor::{Accepted, ClientMessage, Effect, GroupChannel, PresenceState, Update, WireUpdate};

/// An opaque stand-in change; the codec never looks inside.
fn sample_update() -> Update<String> {
    Update::edit(
        "3f6a1c2e-peer",
        "insert 'hello' at 42".to_string(),
        vec![Effect::Presence {
            tag: "1".into(),
            positions: vec![42, 47],
        }],
    )
}

fn bench_update_encode(c: &mut Criterion) {
    let update = sample_update();
    c.bench_function("update_encode", |b| {
        b.iter(|| black_box(WireUpdate::encode(black_box(&update)).unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let wire = WireUpdate::encode(&sample_update()).unwrap();
    c.bench_function("update_decode", |b| {
        b.iter(|| black_box(black_box(wire.clone()).decode::<String>().unwrap()))
    });
}

fn bench_push_message_roundtrip(c: &mut Criterion) {
    let msg = ClientMessage::PushUpdates {
        group_id: "bench-group".into(),
        base_version: 17,
        updates: vec![WireUpdate::encode(&sample_update()).unwrap()],
    };
    c.bench_function("push_message_roundtrip", |b| {
        b.iter(|| {
            let encoded = msg.encode().unwrap();
            black_box(ClientMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_fan_out_100_peers(c: &mut Criterion) {
    let mut channel = GroupChannel::<String>::new(2048);
    let receivers: Vec<_> = (0..100).map(|i| channel.register(i.to_string())).collect();
    let accepted = Accepted {
        version: 1,
        update: Arc::new(sample_update()),
    };

    c.bench_function("fan_out_100_peers", |b| {
        b.iter(|| black_box(channel.broadcast(accepted.clone())))
    });
    drop(receivers);
}

fn bench_presence_markers_50_peers(c: &mut Criterion) {
    let mut state = PresenceState::new("0");
    state.set_local(vec![3]);
    for tag in 1usize..=50 {
        state.merge_effect(&Effect::Presence {
            tag: tag.to_string(),
            positions: vec![tag, tag * 2],
        });
    }

    c.bench_function("presence_markers_50_peers", |b| {
        b.iter(|| black_box(state.markers()))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_push_message_roundtrip,
    bench_fan_out_100_peers,
    bench_presence_markers_50_peers,
);
criterion_main!(benches);
