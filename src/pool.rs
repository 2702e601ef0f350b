// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! The worker-pool contract and the built-in thread pool.
//!
//! The engine never executes consumer callbacks on the caller's thread: all
//! deliveries are packaged as [`Task`]s and handed to a [`WorkerPool`]. The
//! pool is a seam -- callers may plug in their own implementation and the
//! engine relies only on "a posted task runs at most once, eventually".
//!
//! # Affinity Tokens
//!
//! Every post carries an [`AffinityToken`] derived from the consumer the
//! task delivers to. It is a *hint*: a pool may route equal tokens to a
//! single thread so one consumer is always called from the same thread
//! (single-thread-apartment emulation). A pool is free to ignore it --
//! per-consumer serialization is enforced upstream by the consumer
//! processor, never by the pool.
//!
//! # Built-in Pool
//!
//! [`ThreadPool`] routes each token to a fixed lane (one channel + one
//! worker thread per lane), which honors the affinity hint and keeps
//! same-token posts in FIFO order. `stop()` closes the lanes, drains tasks
//! already queued, and joins the workers. Task panics are caught per task so
//! a misbehaving consumer cannot take a worker down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::Error;

/// A unit of work scheduled on a pool.
pub type Task = Box<dyn FnOnce() + Send>;

/// Opaque serialization hint attached to every posted task.
///
/// Tasks carrying equal tokens belong to the same consumer; a pool may use
/// that to co-locate them on one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityToken(u64);

impl AffinityToken {
    /// Create a token from an arbitrary identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn from_addr(addr: usize) -> Self {
        Self(addr as u64)
    }

    fn lane(self, lanes: usize) -> usize {
        (self.0 % lanes as u64) as usize
    }
}

/// Executes delivery tasks on behalf of the engine.
///
/// Implementations must run each posted task at most once. No ordering is
/// required between tasks with different tokens.
pub trait WorkerPool: Send + Sync {
    /// Schedule `task` for execution. `token` is a serialization hint only;
    /// failures are not surfaced to the engine -- pool policy governs.
    fn post(&self, task: Task, token: AffinityToken);

    /// Stop accepting tasks and wind the pool down.
    fn stop(&self);
}

/// Configuration for the built-in [`ThreadPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of worker threads (and affinity lanes). Clamped to at least 1.
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// The built-in worker pool: one channel-fed worker thread per lane.
///
/// Equal tokens always map to the same lane, so deliveries for one consumer
/// happen on one thread, in post order. Different tokens may share a lane;
/// that costs parallelism, never correctness.
pub struct ThreadPool {
    lanes: RwLock<Vec<Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ThreadPool {
    /// Create a pool with [`PoolConfig::default`].
    pub fn new() -> Result<Self, Error> {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with an explicit configuration.
    pub fn with_config(config: PoolConfig) -> Result<Self, Error> {
        let workers = config.workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = crossbeam_channel::unbounded::<Task>();
            let handle = thread::Builder::new()
                .name(format!("keyfan-worker-{index}"))
                .spawn(move || worker_loop(&rx))?;
            lanes.push(tx);
            handles.push(handle);
        }
        tracing::debug!(workers, "thread pool started");
        Ok(Self {
            lanes: RwLock::new(lanes),
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        })
    }

    /// Schedule a task, reporting failure instead of dropping it.
    ///
    /// This is the fallible twin of [`WorkerPool::post`] for callers that
    /// want to observe a stopped pool.
    pub fn try_post(&self, task: Task, token: AffinityToken) -> Result<(), Error> {
        let lanes = self.lanes.read();
        if self.stopped.load(Ordering::Acquire) || lanes.is_empty() {
            return Err(Error::PoolStopped);
        }
        let lane = token.lane(lanes.len());
        lanes[lane].send(task).map_err(|_| Error::PoolStopped)
    }
}

impl WorkerPool for ThreadPool {
    fn post(&self, task: Task, token: AffinityToken) {
        if self.try_post(task, token).is_err() {
            tracing::warn!("task posted to a stopped pool was dropped");
        }
    }

    /// Stop the pool: close all lanes, run what was already queued, join.
    ///
    /// Must not be called from inside a pool task.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lanes.write().clear();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            _ = handle.join();
        }
        tracing::debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(rx: &Receiver<Task>) {
    // The iterator ends once every sender is dropped and the queue is dry.
    for task in rx.iter() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("pool task panicked; worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn same_token_runs_in_post_order() {
        let pool = ThreadPool::with_config(PoolConfig { workers: 4 }).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = AffinityToken::new(7);
        for i in 0..100usize {
            let seen = Arc::clone(&seen);
            pool.post(Box::new(move || seen.lock().push(i)), token);
        }
        pool.stop();
        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn stop_drains_already_queued_tasks() {
        let pool = ThreadPool::with_config(PoolConfig { workers: 2 }).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..64u64 {
            let done = Arc::clone(&done);
            pool.post(
                Box::new(move || {
                    thread::sleep(Duration::from_micros(100));
                    _ = done.fetch_add(1, Ordering::Relaxed);
                }),
                AffinityToken::new(i),
            );
        }
        pool.stop();
        assert_eq!(done.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn post_after_stop_is_rejected() {
        let pool = ThreadPool::with_config(PoolConfig { workers: 1 }).unwrap();
        pool.stop();
        let result = pool.try_post(Box::new(|| {}), AffinityToken::new(0));
        assert!(matches!(result, Err(Error::PoolStopped)));
        // The infallible path must not panic either.
        pool.post(Box::new(|| {}), AffinityToken::new(0));
    }

    #[test]
    fn panicking_task_does_not_kill_its_worker() {
        let pool = ThreadPool::with_config(PoolConfig { workers: 1 }).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let token = AffinityToken::new(1);
        pool.post(Box::new(|| panic!("boom")), token);
        let after = Arc::clone(&done);
        pool.post(
            Box::new(move || {
                _ = after.fetch_add(1, Ordering::Relaxed);
            }),
            token,
        );
        pool.stop();
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn workers_clamped_to_at_least_one() {
        let pool = ThreadPool::with_config(PoolConfig { workers: 0 }).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&done);
        pool.post(
            Box::new(move || {
                _ = observed.fetch_add(1, Ordering::Relaxed);
            }),
            AffinityToken::new(0),
        );
        pool.stop();
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
