// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! Core value types shared across the crate.
//!
//! This module defines the types that flow through the public API. No
//! behavior lives here -- only data definitions and small conversions.
//!
//! # Consumer Identity
//!
//! Consumers are addressed by handle identity, not by value: two
//! subscriptions made with clones of the same `Arc` are the same consumer,
//! two distinct `Arc`s wrapping equal objects are different consumers. The
//! `consumer_id` helper extracts the address of the handle's target, which
//! is stable for the lifetime of the allocation.
//!
//! # Tuning
//!
//! Chosen at registry creation time and immutable. Controls which store
//! implementation backs every key (see `store.rs`). The two variants trade
//! value copies against cross-consumer lock traffic -- neither is a
//! correctness choice.

use std::sync::Arc;

/// Receives values delivered by the engine.
///
/// Implementations must not panic: a panic is treated as a programmer error
/// and is caught (and logged) at the task boundary so it cannot poison a
/// worker thread. `consume` may block, but it blocks only deliveries to this
/// consumer -- other consumers keep their own delivery lanes.
pub trait Consumer<K, V>: Send + Sync {
    /// Handle one value published for `key`.
    ///
    /// Calls for a given consumer are strictly sequential, never concurrent,
    /// and preserve per-key publish order.
    fn consume(&self, key: &K, value: &V);
}

/// A shared, reference-counted consumer handle.
pub type ConsumerHandle<K, V> = Arc<dyn Consumer<K, V>>;

/// Identity of a consumer handle: the address of its target.
pub(crate) fn consumer_id<K, V>(handle: &ConsumerHandle<K, V>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// Storage strategy applied to every key of a registry, chosen at creation
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tuning {
    /// One shared value list per key; each subscriber holds a cursor into
    /// it and consumed prefixes are reclaimed. A published value is stored
    /// once regardless of the number of subscribers, at the price of a
    /// shared lock among that key's cursors.
    #[default]
    FavorSize,
    /// One private queue per subscriber; publishing clones the value into
    /// every queue. Cursor operations touch only their own lock, at the
    /// price of one copy per subscriber.
    FavorSpeed,
}
