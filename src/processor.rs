// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-consumer delivery serialization.
//!
//! One `ConsumerProcessor` exists per subscribed consumer. It owns that
//! consumer's cursors (one per subscribed key) and guarantees that at most
//! one delivery task for the consumer is in flight at any moment, whatever
//! the pool's parallelism. All deliveries to the consumer are therefore
//! strictly sequential, and per-key publish order is preserved because each
//! cursor is itself sequential.
//!
//! # State Machine
//!
//! The delivery state is `idle` or `busy` plus a pending FIFO of cursors
//! waiting for a task:
//!
//! - cursor notification while `idle`: post a task, go `busy`;
//! - cursor notification while `busy`: append the cursor to the FIFO;
//! - task completion with a non-empty FIFO: pop the next live entry (dead,
//!   stopped or cancelled entries are skipped) and post its task;
//! - task completion with an empty FIFO: go `idle`.
//!
//! A task whose `advance` reports further values re-queues its own cursor at
//! the FIFO tail before completing: store notifications only fire on the
//! empty-to-non-empty edge, so this chain is what keeps a non-empty cursor
//! draining. The tail position round-robins a multi-key consumer across its
//! keys.
//!
//! # References and Lifetime
//!
//! Tasks capture only weak references to the processor and the cursor; a
//! task whose upgrades fail is a no-op. While work is queued or in flight
//! the processor keeps itself alive through a self-reference stored in the
//! delivery state, released on the busy-to-idle transition, so a pending
//! chain survives the registry dropping the processor mid-stream.
//!
//! # Locks
//!
//! Two locks: the subscription map and the delivery state. When both are
//! needed the map lock is taken first. No lock is ever held across a `post`
//! or a consumer callback.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cancel::{CancellationSource, CancellationToken};
use crate::pool::{AffinityToken, Task, WorkerPool};
use crate::source::ValueSource;
use crate::types::{consumer_id, ConsumerHandle};

struct SubscriptionEntry<K, V> {
    source: Arc<dyn ValueSource<K, V>>,
    cancel: CancellationSource,
}

struct PendingDelivery<K, V> {
    source: Weak<dyn ValueSource<K, V>>,
    /// `None` when the notification raced ahead of subscription bookkeeping;
    /// the stopped-cursor check in the task is the correctness backstop.
    cancel: Option<CancellationToken>,
}

struct DeliveryState<K, V> {
    busy: bool,
    pending: VecDeque<PendingDelivery<K, V>>,
    /// Held from idle-to-busy until busy-to-idle.
    keep_alive: Option<Arc<ConsumerProcessor<K, V>>>,
}

/// Serializes all deliveries to one consumer.
pub(crate) struct ConsumerProcessor<K, V> {
    consumer: ConsumerHandle<K, V>,
    /// Serialization hint handed to the pool with every task; derived from
    /// the consumer's identity so one consumer maps to one pool lane.
    token: AffinityToken,
    pool: Arc<dyn WorkerPool>,
    weak_self: Weak<Self>,
    subscriptions: Mutex<HashMap<K, SubscriptionEntry<K, V>>>,
    delivery: Mutex<DeliveryState<K, V>>,
}

impl<K, V> ConsumerProcessor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(consumer: ConsumerHandle<K, V>, pool: Arc<dyn WorkerPool>) -> Arc<Self> {
        let token = AffinityToken::from_addr(consumer_id(&consumer));
        Arc::new_cyclic(|weak_self| Self {
            consumer,
            token,
            pool,
            weak_self: weak_self.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            delivery: Mutex::new(DeliveryState {
                busy: false,
                pending: VecDeque::new(),
                keep_alive: None,
            }),
        })
    }

    /// Register the cursor for `key`. Idempotent per key: a second cursor
    /// for an already subscribed key is stopped and discarded.
    pub(crate) fn add_subscription(&self, key: K, source: Arc<dyn ValueSource<K, V>>) {
        let duplicate = {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(&key) {
                Some(source)
            } else {
                _ = subscriptions.insert(
                    key,
                    SubscriptionEntry {
                        source,
                        cancel: CancellationSource::new(),
                    },
                );
                None
            }
        };
        if let Some(duplicate) = duplicate {
            duplicate.stop();
        }
    }

    /// Drop the subscription for `key`: cancel its queued deliveries and
    /// stop its cursor. Unknown keys are ignored.
    pub(crate) fn remove_subscription(&self, key: &K) {
        let removed = self.subscriptions.lock().remove(key);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            entry.source.stop();
        }
    }

    pub(crate) fn is_subscribed_to_any(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    pub(crate) fn consumer(&self) -> &ConsumerHandle<K, V> {
        &self.consumer
    }

    /// Entry point for store notifications: a cursor of this consumer went
    /// from drained to having a value.
    pub(crate) fn on_new_value(&self, key: K, source: Arc<dyn ValueSource<K, V>>) {
        let cancel = self
            .subscriptions
            .lock()
            .get(&key)
            .map(|entry| entry.cancel.token());
        let task = {
            let mut delivery = self.delivery.lock();
            if delivery.busy {
                delivery.pending.push_back(PendingDelivery {
                    source: Arc::downgrade(&source),
                    cancel,
                });
                None
            } else {
                delivery.busy = true;
                delivery.keep_alive = self.weak_self.upgrade();
                Some(self.delivery_task(Arc::downgrade(&source), cancel))
            }
        };
        if let Some(task) = task {
            self.pool.post(task, self.token);
        }
    }

    fn delivery_task(
        &self,
        source: Weak<dyn ValueSource<K, V>>,
        cancel: Option<CancellationToken>,
    ) -> Task {
        let processor = self.weak_self.clone();
        Box::new(move || {
            let Some(processor) = processor.upgrade() else {
                return;
            };
            processor.run_delivery(&source, cancel);
        })
    }

    /// Deliver one value through `source`, then hand the lane to the next
    /// pending cursor. Runs on a pool thread.
    fn run_delivery(
        &self,
        source: &Weak<dyn ValueSource<K, V>>,
        cancel: Option<CancellationToken>,
    ) {
        let skipped = cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancellation_requested);
        if !skipped {
            if let Some(live) = source.upgrade() {
                if !live.is_stopped() {
                    if let Some((key, value)) = live.current() {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.consumer.consume(&key, &value);
                        }));
                        if outcome.is_err() {
                            tracing::warn!("consumer panicked in consume; delivery continues");
                        }
                        if live.advance() {
                            // More values behind this one: chain the cursor
                            // back in at the tail so sibling keys get their
                            // turn first.
                            self.delivery.lock().pending.push_back(PendingDelivery {
                                source: source.clone(),
                                cancel,
                            });
                        }
                    }
                }
            }
        }
        self.on_delivered();
    }

    /// Task completion: post the next live pending delivery, or go idle.
    fn on_delivered(&self) {
        loop {
            let (next, released) = {
                let mut delivery = self.delivery.lock();
                match delivery.pending.pop_front() {
                    Some(entry) => (Some(entry), None),
                    None => {
                        delivery.busy = false;
                        (None, delivery.keep_alive.take())
                    }
                }
            };
            drop(released);
            let Some(entry) = next else {
                return;
            };
            if entry
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancellation_requested)
            {
                continue;
            }
            let Some(live) = entry.source.upgrade() else {
                continue;
            };
            if live.is_stopped() {
                continue;
            }
            let task = self.delivery_task(entry.source, entry.cancel);
            self.pool.post(task, self.token);
            return;
        }
    }
}

impl<K, V> Drop for ConsumerProcessor<K, V> {
    fn drop(&mut self) {
        // Tearing the processor down detaches every cursor, whether or not
        // the owner unsubscribed explicitly.
        for (_, entry) in self.subscriptions.get_mut().drain() {
            entry.cancel.cancel();
            entry.source.stop();
        }
    }
}
