// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! The pull-cursor interface between stores and consumer processors.
//!
//! A value source is the per-subscription view onto a store: it exposes the
//! oldest value this subscription has not yet consumed, and advances over it
//! exactly once. The store side pushes a "new value available" notification
//! to the processor the source was bound to at creation; the processor side
//! pulls through this trait from a worker task. Both store tunings implement
//! it (see `store.rs`).
//!
//! Values come out as `(K, Arc<V>)` so the caller can release every engine
//! lock before invoking user code: the `Arc` keeps the value alive even if
//! the store reclaims or overwrites its slot concurrently.

use std::sync::Arc;

/// A per-subscription cursor onto a store.
pub trait ValueSource<K, V>: Send + Sync {
    /// The value this source currently points at, or `None` at
    /// end-of-stream. Reading does not advance.
    fn current(&self) -> Option<(K, Arc<V>)>;

    /// Whether a value is ready.
    fn has_value(&self) -> bool;

    /// Consume the current value and step forward. Returns whether a further
    /// value is ready after the step. At end-of-stream this is a no-op
    /// returning `false`.
    fn advance(&self) -> bool;

    /// Detach from the store. Idempotent. After `stop` no further
    /// notifications are delivered and the store retains no references to
    /// this source; `current`/`has_value` degrade to empty.
    fn stop(&self);

    /// Whether [`stop`](Self::stop) has been called.
    fn is_stopped(&self) -> bool;
}
