// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! # keyfan
//!
//! An in-process multi-queue publish/subscribe fan-out engine. Producers
//! enqueue values tagged with a key; consumers subscribe to keys and receive
//! those values through a worker pool, decoupled from the producers.
//!
//! | Area | Description | Key types / traits |
//! |------|-------------|--------------------|
//! | **Registry** | Subscribe, unsubscribe, enqueue | [`Registry`] |
//! | **Consumers** | User-implemented value sink | [`Consumer`], [`ConsumerHandle`] |
//! | **Worker pool** | Task execution seam; built-in pool included | [`WorkerPool`], [`ThreadPool`], [`AffinityToken`] |
//! | **Tuning** | Per-registry storage strategy | [`Tuning`] |
//! | **Cancellation** | Cooperative skip of queued deliveries | [`CancellationSource`], [`CancellationToken`] |
//!
//! # Guarantees
//!
//! - Deliveries to one consumer are strictly sequential: no two `consume`
//!   calls for the same handle ever overlap, whatever the pool parallelism.
//! - For one consumer and one key, values arrive in enqueue order, each at
//!   most once. Across keys there is no total order.
//! - A subscriber observes only values enqueued after it subscribed.
//! - Enqueue is non-blocking and, with the default size tuning, stores one
//!   copy of the value no matter how many consumers are subscribed; an
//!   owned value is moved in without any copy at all.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyfan::{Consumer, ConsumerHandle, Registry, ThreadPool, WorkerPool};
//!
//! struct Printer;
//!
//! impl Consumer<u32, String> for Printer {
//!     fn consume(&self, key: &u32, value: &String) {
//!         println!("{key}: {value}");
//!     }
//! }
//!
//! fn main() -> Result<(), keyfan::Error> {
//!     let pool = Arc::new(ThreadPool::new()?);
//!     let registry = Registry::new(pool.clone() as Arc<dyn WorkerPool>);
//!
//!     let printer: ConsumerHandle<u32, String> = Arc::new(Printer);
//!     registry.subscribe(&1, &printer);
//!
//!     for i in 0..10 {
//!         registry.enqueue(&1, i.to_string());
//!     }
//!
//!     // ... let the consumers catch up, then wind the pool down.
//!     pool.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Non-goals
//!
//! All state is in memory -- nothing survives a restart. Producers are never
//! back-pressured; memory grows with unconsumed values. Delivery is
//! at-most-once: unsubscribing may drop values that were still queued.

mod cancel;
mod error;
mod pool;
mod processor;
mod registry;
mod source;
mod store;
mod types;


pub use cancel::{CancellationSource, CancellationToken};
pub use error::Error;
pub use pool::{AffinityToken, PoolConfig, Task, ThreadPool, WorkerPool};
pub use registry::Registry;
pub use source::ValueSource;
pub use types::{Consumer, ConsumerHandle, Tuning};
