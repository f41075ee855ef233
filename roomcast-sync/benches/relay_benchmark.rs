use criterion::{criterion_group, criterion_main, Criterion};
use roomcast_sync::protocol::{ClientEvent, Framing, Frame, Message, RoomId, ServerEvent};
use roomcast_sync::reconcile::Reconciler;
use roomcast_sync::registry::{ConnectionHandle, RoomRegistry};
use roomcast_sync::storage::{RocksConfig, RocksStore, StoredMessage};
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::mpsc;

fn room(n: u64) -> RoomId {
    RoomId::new(n).unwrap()
}

fn chat(i: u64) -> Message {
    Message::new(format!("m{i}"), "a typical short chat line", "alice", room(7), i)
}

// ─── Wire benchmarks ────────────────────────────────────────

fn bench_event_encode(c: &mut Criterion) {
    let event = ServerEvent::ReceivedMessage(chat(1));

    c.bench_function("event_encode_binary", |b| {
        b.iter(|| black_box(black_box(&event).encode(Framing::Binary).unwrap()))
    });
    c.bench_function("event_encode_json", |b| {
        b.iter(|| black_box(black_box(&event).encode(Framing::Json).unwrap()))
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = ClientEvent::SendMessage(chat(1));
    let Frame::Binary(bytes) = event.encode(Framing::Binary).unwrap() else {
        unreachable!()
    };
    let Frame::Text(text) = event.encode(Framing::Json).unwrap() else {
        unreachable!()
    };

    c.bench_function("event_decode_binary", |b| {
        b.iter(|| black_box(ClientEvent::decode_binary(black_box(&bytes)).unwrap()))
    });
    c.bench_function("event_decode_json", |b| {
        b.iter(|| black_box(ClientEvent::decode_text(black_box(&text)).unwrap()))
    });
}

// ─── Fan-out benchmarks ─────────────────────────────────────

fn registry_with_peers(
    peers: usize,
    capacity: usize,
) -> (RoomRegistry, Vec<mpsc::Receiver<Arc<ServerEvent>>>) {
    let mut registry = RoomRegistry::new();
    let mut receivers = Vec::with_capacity(peers);
    for _ in 0..peers {
        let (tx, rx) = mpsc::channel(capacity);
        registry.join(ConnectionHandle::new(tx), room(7));
        receivers.push(rx);
    }
    (registry, receivers)
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            let (registry, receivers) = registry_with_peers(100, 16);
            let event = Arc::new(ServerEvent::ReceivedMessage(chat(1)));
            black_box(registry.broadcast(room(7), black_box(event), None));
            drop(receivers);
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            let (registry, receivers) = registry_with_peers(100, 1024);
            for i in 0..1000u64 {
                let event = Arc::new(ServerEvent::ReceivedMessage(chat(i)));
                registry.broadcast(room(7), black_box(event), None);
            }
            drop(receivers);
        })
    });
}

// ─── Reconciler benchmarks ──────────────────────────────────

fn bench_receive_live_with_duplicates(c: &mut Criterion) {
    c.bench_function("receive_live_1000_half_duplicates", |b| {
        b.iter(|| {
            let mut reconciler = Reconciler::new();
            let ticket = reconciler.enter_room(room(7));
            reconciler.apply_history(ticket, Vec::new());
            for i in 0..1000u64 {
                black_box(reconciler.receive_live(chat(i / 2)));
            }
            black_box(reconciler.len());
        })
    });
}

fn bench_apply_history(c: &mut Criterion) {
    let backlog: Vec<Message> = (0..1000u64).rev().map(chat).collect();
    let live: Vec<Message> = (900..1100u64).map(chat).collect();

    c.bench_function("apply_history_1000_with_200_queued", |b| {
        b.iter(|| {
            let mut reconciler = Reconciler::new();
            let ticket = reconciler.enter_room(room(7));
            for message in &live {
                reconciler.receive_live(message.clone());
            }
            black_box(reconciler.apply_history(ticket, backlog.clone()));
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_store_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

    c.bench_function("store_append", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let record = StoredMessage::from(&chat(i));
            store.append_message(room(7), black_box(&record)).unwrap();
            i += 1;
        })
    });
}

fn bench_store_load_room(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
    for i in 0..500u64 {
        store.append_message(room(7), &StoredMessage::from(&chat(i))).unwrap();
        store.append_message(room(8), &StoredMessage::from(&chat(i))).unwrap();
    }

    c.bench_function("store_load_room_500", |b| {
        b.iter(|| black_box(store.load_room(black_box(room(7))).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_broadcast_100_peers,
    bench_broadcast_1000_messages,
    bench_receive_live_with_duplicates,
    bench_apply_history,
    bench_store_append,
    bench_store_load_room,
);
criterion_main!(benches);
