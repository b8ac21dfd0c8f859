//! Benchmarks for the send hot path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use don_p2p::signer::{open, seal};
use don_p2p::{
    ConnectionManager, Ed25519Signer, LinkRateLimiter, MemoryNetwork, PeerConfig, Signer,
    StreamConfig,
};

fn unlimited() -> StreamConfig {
    StreamConfig::default()
        .with_message_rate(1e12, u32::MAX)
        .with_bytes_rate(1e15, u32::MAX)
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut limiter = LinkRateLimiter::new(&unlimited());

    c.bench_function("rate_limiter_acquire", |b| {
        b.iter(|| {
            let _ = limiter.try_acquire_at(black_box(256), Instant::now());
        });
    });
}

fn benchmark_seal_open(c: &mut Criterion) {
    let sender = Ed25519Signer::from_seed([1u8; 32]);
    let sender_id = sender.peer_id().unwrap();
    let recipient_id = Ed25519Signer::from_seed([2u8; 32]).peer_id().unwrap();
    let payload = vec![7u8; 256];

    c.bench_function("seal_256b", |b| {
        b.iter(|| seal(&sender, &sender_id, &recipient_id, black_box(&payload)).unwrap());
    });

    let frame = seal(&sender, &sender_id, &recipient_id, &payload).unwrap();
    c.bench_function("open_256b", |b| {
        b.iter(|| open(&sender_id, &recipient_id, black_box(&frame)).unwrap().len());
    });
}

fn benchmark_manager_send(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let network = MemoryNetwork::new();

    let node = |seed: u8| {
        let signer = Arc::new(Ed25519Signer::from_seed([seed; 32]));
        let id = signer.peer_id().unwrap();
        let manager = Arc::new(
            ConnectionManager::new(PeerConfig::default(), network.transport(id), signer).unwrap(),
        );
        manager.start().unwrap();
        (id, manager)
    };
    let (a_id, a) = node(10);
    let (b_id, b) = node(11);
    a.update_connections_for(don_p2p::Scope::Default, &HashMap::from([(b_id, unlimited())]))
        .unwrap();
    b.update_connections_for(don_p2p::Scope::Default, &HashMap::from([(a_id, unlimited())]))
        .unwrap();

    let payload = vec![7u8; 256];
    c.bench_function("manager_send_256b", |bench| {
        bench.iter(|| {
            let _ = a.send(b_id, black_box(&payload));
        });
    });
}

criterion_group!(
    benches,
    benchmark_rate_limiter,
    benchmark_seal_open,
    benchmark_manager_send,
);

criterion_main!(benches);
