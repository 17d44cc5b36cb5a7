//! Performance benchmarks for inbound stream processing.
//!
//! These benchmarks measure the hot paths on the receive side:
//! - Chunk assembly into streaming units
//! - Frame correlation against the session registry
//! - Envelope decoding

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use protocol::{Envelope, InboundFrame, Message};
use sessionmux::assembler::{Chunk, ChunkAssembler, UnitRole};
use sessionmux::correlator;
use sessionmux::state::ManagerState;
use sessionmux::{SessionKind, SessionSpec};

fn state_with_sessions(count: usize) -> ManagerState {
    let mut state = ManagerState::new();
    for i in 0..count {
        let id = format!("s{}", i);
        let session = SessionSpec::new("bench", id.clone(), SessionKind::Terminal).into_session(id, 0);
        state.registry.upsert(session);
    }
    state.registry.set_current(Some("s0".to_string()));
    state
}

/// Benchmark folding chunks into one unit.
fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");

    for size in [16usize, 1024] {
        let chunk = "x".repeat(size);
        group.throughput(Throughput::Bytes((size * 100) as u64));
        group.bench_function(format!("100_chunks_{}B", size), |b| {
            b.iter(|| {
                let mut assembler = ChunkAssembler::new();
                for i in 0..100u64 {
                    assembler.on_chunk("s0", UnitRole::Output, Chunk::new(black_box(&chunk), false), i);
                }
                assembler.on_chunk("s0", UnitRole::Output, Chunk::new("", true), 100)
            });
        });
    }

    group.finish();
}

/// Benchmark routing frames for the current and background sessions.
fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");
    let frames: Vec<InboundFrame> = (0..100)
        .map(|i| InboundFrame::output(format!("s{}", i % 8), "line of output\n", false))
        .collect();
    group.throughput(Throughput::Elements(frames.len() as u64));

    group.bench_function("100_frames_8_sessions", |b| {
        b.iter_batched(
            || (state_with_sessions(8), frames.clone()),
            |(mut state, frames)| {
                for (i, frame) in frames.into_iter().enumerate() {
                    black_box(correlator::on_event(&mut state, frame, i as u64));
                }
                state
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("heartbeat", |b| {
        b.iter_batched(
            || state_with_sessions(1),
            |mut state| {
                black_box(correlator::on_event(&mut state, InboundFrame::heartbeat("s0"), 1));
                state
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark envelope decoding in both wire formats.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let envelope = Envelope::new(
        1,
        Message::Frame(InboundFrame::output("s0", "x".repeat(4096), false).with_unit_id("u1")),
    );
    let json = envelope.to_json().unwrap_or_default();
    let msgpack = envelope.to_msgpack().unwrap_or_default();

    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("json_4KB", |b| b.iter(|| Envelope::from_json(black_box(&json))));

    group.throughput(Throughput::Bytes(msgpack.len() as u64));
    group.bench_function("msgpack_4KB", |b| {
        b.iter(|| Envelope::from_msgpack(black_box(&msgpack)))
    });

    group.finish();
}

criterion_group!(benches, bench_assembly, bench_correlation, bench_decode);
criterion_main!(benches);
