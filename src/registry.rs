// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! The central registry. Subscribe consumers to keys and publish values.
//!
//! # Per-Registry Store Selection
//!
//! The store implementation backing every key is selected once, at registry
//! creation time, via [`Tuning`]. The choice is immutable for the registry's
//! lifetime; all keys of one registry share it. See `store.rs` for the two
//! variants and their trade-offs.
//!
//! # Locking
//!
//! One read/write lock guards both internal maps (key to store plus
//! subscriber list, consumer identity to processor). Publishing takes the
//! read side just long enough to clone the store handle out; the store call
//! itself -- and everything it triggers -- runs outside the registry lock,
//! so subscribing never waits behind a slow fan-out and publishers never
//! wait behind each other here.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pool::WorkerPool;
use crate::processor::ConsumerProcessor;
use crate::store::{store_for, Store};
use crate::types::{consumer_id, ConsumerHandle, Tuning};

struct Channel<K, V> {
    store: Arc<dyn Store<K, V>>,
    /// Identities of the subscribed consumers, in subscription order.
    subscribers: Vec<usize>,
}

struct RegistryState<K, V> {
    channels: HashMap<K, Channel<K, V>>,
    processors: HashMap<usize, Arc<ConsumerProcessor<K, V>>>,
}

struct RegistryInner<K, V> {
    tuning: Tuning,
    pool: Arc<dyn WorkerPool>,
    state: RwLock<RegistryState<K, V>>,
}

/// The multi-queue fan-out engine's entry point.
///
/// Thread-safe and cheaply cloneable; clones share the same state. Producers
/// call [`enqueue`](Self::enqueue) from any thread, consumers come and go
/// via [`subscribe`](Self::subscribe)/[`unsubscribe`](Self::unsubscribe),
/// and deliveries run on the worker pool supplied at construction.
///
/// A consumer subscribed to a key is notified sequentially -- never
/// concurrently -- about every value enqueued for that key after the
/// subscription, in enqueue order. A consumer subscribed to several keys
/// gets no ordering promise across them, only within each.
pub struct Registry<K, V> {
    inner: Arc<RegistryInner<K, V>>,
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a registry with the default [`Tuning`].
    ///
    /// `pool` executes the consumer-call tasks; its parallelism is entirely
    /// up to the caller.
    #[must_use]
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self::with_tuning(pool, Tuning::default())
    }

    /// Create a registry with an explicit store tuning.
    #[must_use]
    pub fn with_tuning(pool: Arc<dyn WorkerPool>, tuning: Tuning) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tuning,
                pool,
                state: RwLock::new(RegistryState {
                    channels: HashMap::new(),
                    processors: HashMap::new(),
                }),
            }),
        }
    }

    /// The tuning this registry was created with.
    #[must_use]
    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }

    /// Subscribe `consumer` to value notifications for `key`.
    ///
    /// Subscribing the same handle to the same key twice is ignored -- the
    /// consumer still receives each value exactly once. The subscription
    /// only covers values enqueued after this call returns (or after the
    /// internal cursor attaches, for enqueues racing with it).
    pub fn subscribe(&self, key: &K, consumer: &ConsumerHandle<K, V>) {
        let id = consumer_id(consumer);
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        let channel = state.channels.entry(key.clone()).or_insert_with(|| Channel {
            store: store_for(self.inner.tuning, key.clone()),
            subscribers: Vec::new(),
        });
        if channel.subscribers.contains(&id) {
            return;
        }
        let processor = Arc::clone(state.processors.entry(id).or_insert_with(|| {
            ConsumerProcessor::new(Arc::clone(consumer), Arc::clone(&self.inner.pool))
        }));
        let source = Arc::clone(&channel.store).create_source(Arc::downgrade(&processor));
        processor.add_subscription(key.clone(), source);
        channel.subscribers.push(id);
        tracing::debug!(subscribers = channel.subscribers.len(), "consumer subscribed");
    }

    /// Remove `consumer`'s subscription to `key`.
    ///
    /// Unknown keys and consumers are ignored, and repeating the call is
    /// harmless. One delivery already in flight may still reach the consumer
    /// after this returns; queued ones are cancelled. The key's store is
    /// dropped with its last subscriber, and the consumer's processor with
    /// its last subscription.
    pub fn unsubscribe(&self, key: &K, consumer: &ConsumerHandle<K, V>) {
        let id = consumer_id(consumer);
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        let Some(processor) = state.processors.get(&id).map(Arc::clone) else {
            return;
        };
        let Some(channel) = state.channels.get_mut(key) else {
            return;
        };
        let Some(position) = channel.subscribers.iter().position(|s| *s == id) else {
            return;
        };
        _ = channel.subscribers.remove(position);
        if channel.subscribers.is_empty() {
            _ = state.channels.remove(key);
        }
        processor.remove_subscription(key);
        if !processor.is_subscribed_to_any() {
            _ = state.processors.remove(&id);
        }
        tracing::debug!("consumer unsubscribed");
    }

    /// Enqueue an owned value for `key`.
    ///
    /// Non-blocking and never copies the value, regardless of the number of
    /// subscribers (the speed-tuned store clones internally by design).
    /// Without subscribers for `key` the value is silently dropped.
    pub fn enqueue(&self, key: &K, value: V) {
        let Some(store) = self.lookup_store(key) else {
            tracing::trace!("enqueue for a key with no subscribers; value dropped");
            return;
        };
        store.add_owned(value);
    }

    /// Enqueue a borrowed value for `key`.
    ///
    /// Like [`enqueue`](Self::enqueue) but clones the value exactly once on
    /// the way in (size-tuned stores; the speed-tuned store clones once per
    /// subscriber either way). The per-value cost never depends on the
    /// subscriber count.
    pub fn enqueue_ref(&self, key: &K, value: &V) {
        let Some(store) = self.lookup_store(key) else {
            tracing::trace!("enqueue for a key with no subscribers; value dropped");
            return;
        };
        store.add_borrowed(value);
    }

    /// Clone the store handle out under the read lock so the publish itself
    /// runs with no registry lock held.
    fn lookup_store(&self, key: &K) -> Option<Arc<dyn Store<K, V>>> {
        let state = self.inner.state.read();
        state.channels.get(key).map(|c| Arc::clone(&c.store))
    }
}
