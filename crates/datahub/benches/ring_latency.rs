// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring Latency Benchmark
//!
//! Measures the latency of the acquire/commit/release hot path with
//! different:
//! - Payload sizes (64B, 1KB, 4KB)
//! - Delivery policies (SingleReader vs LatestOnly)
//!
//! This benchmark isolates the slot-state-machine overhead; there is no
//! network I/O and no broker involvement on this path.

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use datahub::config::{ChecksumPolicy, SegmentConfig};
use datahub::policy::DeliveryPolicy;
use datahub::protocol::{Consumer, Producer};
use datahub::segment::{CreateIdentity, Segment};
use std::hint::black_box as bb;
use std::time::Duration;

fn bench_name(tag: &str, unique: u64) -> String {
    format!("/datahub_bench_{tag}_{unique}")
}

fn identity() -> CreateIdentity<'static> {
    CreateIdentity {
        hub_uid: b"bench",
        hub_name: b"bench",
        producer_uid: b"bench_writer",
        producer_name: b"bench_writer",
    }
}

/// Benchmark a single producer/consumer pair ping-ponging through the
/// ring at different payload sizes, SingleReader policy (full backlog
/// replay, the common point-to-point case).
fn bench_round_trip_payload_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_round_trip_by_size");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let name = bench_name("size", size as u64);
            let config = SegmentConfig::new(256, size as u32, DeliveryPolicy::SingleReader);
            let mut producer =
                Producer::create(&name, &config, identity(), [0u8; 32], 1, 1).expect("create");
            let mut consumer = Consumer::attach(
                &name,
                &[0u8; 32],
                1,
                1,
                b"bench_reader",
                b"bench_reader",
                ChecksumPolicy::Enforced,
            )
            .expect("attach");

            b.iter(|| {
                let mut guard = producer
                    .acquire(Duration::from_millis(50))
                    .expect("acquire for write");
                let payload = guard.payload_mut();
                payload[..size].fill(0xAB);
                guard.commit(size).expect("commit");

                let read_guard = consumer
                    .acquire(Duration::from_millis(50))
                    .expect("acquire for read");
                bb(read_guard.payload());
                read_guard.release().expect("release");
            });

            drop(consumer);
            drop(producer);
            Segment::unlink(&name).ok();
        });
    }

    group.finish();
}

/// Benchmark producer-side acquire/commit throughput alone with no
/// consumer draining the ring. Only meaningful under `LatestOnly`, whose
/// ring-full behavior is to wrap the oldest slot rather than block; a
/// blocking policy would stall the first time the ring filled up.
fn bench_produce_only_wrap_oldest(c: &mut Criterion) {
    let name = bench_name("wrap_oldest", 1);
    let config = SegmentConfig::new(64, 256, DeliveryPolicy::LatestOnly);
    let mut producer =
        Producer::create(&name, &config, identity(), [1u8; 32], 1, 1).expect("create");

    c.bench_function("ring_produce_only_wrap_oldest", |b| {
        b.iter(|| {
            let mut guard = producer
                .acquire(Duration::from_millis(50))
                .expect("acquire for write");
            guard.payload_mut()[..4].copy_from_slice(b"ping");
            guard.commit(4).expect("commit");
        });
    });

    drop(producer);
    Segment::unlink(&name).ok();
}

criterion_group!(
    ring_benches,
    bench_round_trip_payload_sizes,
    bench_produce_only_wrap_oldest
);
criterion_main!(ring_benches);
