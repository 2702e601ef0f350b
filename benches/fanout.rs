// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for engine throughput across store tunings and fan-out widths.
//!
//! Scenarios:
//! - size-tuned vs speed-tuned publish-and-drain, 1 and 4 subscribers

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keyfan::{Consumer, ConsumerHandle, PoolConfig, Registry, ThreadPool, Tuning, WorkerPool};
use parking_lot::{Condvar, Mutex};

const MSG_COUNT: usize = 10_000;

/// Counts deliveries and lets the bench thread block until a batch drained.
struct Acknowledge {
    delivered: Mutex<usize>,
    signal: Condvar,
}

impl Acknowledge {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(0),
            signal: Condvar::new(),
        })
    }

    fn wait_for(&self, count: usize) {
        let mut delivered = self.delivered.lock();
        while *delivered < count {
            self.signal.wait(&mut delivered);
        }
        *delivered = 0;
    }
}

impl Consumer<u32, u64> for Acknowledge {
    fn consume(&self, _key: &u32, _value: &u64) {
        *self.delivered.lock() += 1;
        self.signal.notify_all();
    }
}

fn run_publish_and_drain(
    registry: &Registry<u32, u64>,
    consumers: &[Arc<Acknowledge>],
    msg_count: usize,
) {
    for i in 0..msg_count {
        registry.enqueue(&1, i as u64);
    }
    for consumer in consumers {
        consumer.wait_for(msg_count);
    }
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    group.throughput(Throughput::Elements(MSG_COUNT as u64));

    for tuning in [Tuning::FavorSize, Tuning::FavorSpeed] {
        for subscribers in [1usize, 4] {
            let pool = Arc::new(
                ThreadPool::with_config(PoolConfig { workers: 4 })
                    .expect("worker threads should spawn"),
            );
            let registry: Registry<u32, u64> =
                Registry::with_tuning(Arc::clone(&pool) as Arc<dyn WorkerPool>, tuning);
            let consumers: Vec<Arc<Acknowledge>> =
                (0..subscribers).map(|_| Acknowledge::new()).collect();
            for consumer in &consumers {
                let handle: ConsumerHandle<u32, u64> = consumer.clone();
                registry.subscribe(&1, &handle);
            }

            group.bench_with_input(
                BenchmarkId::new(format!("{tuning:?}"), subscribers),
                &subscribers,
                |b, _| b.iter(|| run_publish_and_drain(&registry, &consumers, MSG_COUNT)),
            );

            pool.stop();
        }
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out);
criterion_main!(benches);
