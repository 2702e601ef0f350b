// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! Store internals -- the performance-critical core of the crate.
//!
//! This is the largest module. It contains the two store implementations and
//! their cursors, all `pub(crate)`. Nothing here is directly exposed to
//! users.
//!
//! # Two Store Variants
//!
//! A store owns the published values of one key and hands each subscriber a
//! cursor over them. The variant is selected per registry at creation time
//! via [`Tuning`]; each pays only for what it needs:
//!
//! - **`SharedStore`** (size-tuned): one value list shared by every cursor.
//!   Values are stored once regardless of fan-out; each slot counts the
//!   cursors positioned on it and the zero-count head prefix is reclaimed
//!   as cursors advance. Memory is bounded by the slowest cursor's lag.
//!
//! - **`MirroredStore`** (speed-tuned): no shared value storage at all. A
//!   publish clones the value once into every cursor's private deque, so
//!   cursor operations contend only on their own lock.
//!
//! # Sequence-Indexed Slots
//!
//! `SharedStore` keeps its list as a `VecDeque` with a monotonically
//! increasing `head_seq` instead of a linked list: a cursor position is just
//! a sequence number (`At(seq)`) or the `End` sentinel, and slot lookup is
//! `seq - head_seq`. Head-trimming is a `pop_front` loop, O(reclaimed).
//!
//! # Notification Discipline
//!
//! A publish moves every `End` cursor onto the new slot and snapshots
//! exactly the cursors it moved, all under the store's write lock; the
//! notifications fire after the lock is released. That edge -- empty to
//! non-empty, per cursor -- is the only push signal in the engine; a cursor
//! that already had values pending needs none because its processor's task
//! chain is still running (see `processor.rs`).

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::processor::ConsumerProcessor;
use crate::source::ValueSource;
use crate::types::Tuning;

/// Per-key value storage. One implementation per [`Tuning`] variant.
pub(crate) trait Store<K, V>: Send + Sync {
    /// Accept an owned value. Never clones it.
    fn add_owned(&self, value: V);

    /// Accept a borrowed value, cloning it into the store.
    fn add_borrowed(&self, value: &V);

    /// Create a cursor bound to `processor` and attach it to this store.
    /// The new cursor starts past everything already stored.
    fn create_source(
        self: Arc<Self>,
        processor: Weak<ConsumerProcessor<K, V>>,
    ) -> Arc<dyn ValueSource<K, V>>;
}

/// Instantiate the store implementation selected by `tuning`.
pub(crate) fn store_for<K, V>(tuning: Tuning, key: K) -> Arc<dyn Store<K, V>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    match tuning {
        Tuning::FavorSize => Arc::new(SharedStore::new(key)),
        Tuning::FavorSpeed => Arc::new(MirroredStore::new(key)),
    }
}

// ---------------------------------------------------------------------------
// SharedStore -- size-tuned: one refcounted list, per-cursor positions
// ---------------------------------------------------------------------------

/// A cursor position inside a [`SharedStore`].
///
/// `At(seq)` addresses the slot with that sequence number; `End` means the
/// cursor consumed everything currently stored. A freshly attached cursor is
/// at `End` even when the list is non-empty: values enqueued before the
/// subscription are never observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    End,
    At(u64),
}

struct Slot<V> {
    value: Arc<V>,
    /// Number of cursors currently positioned on this slot.
    holds: u32,
}

struct Attached<K, V> {
    id: u64,
    pos: Position,
    cursor: Arc<SharedCursor<K, V>>,
}

struct SharedState<K, V> {
    values: VecDeque<Slot<V>>,
    /// Sequence number of `values[0]`.
    head_seq: u64,
    next_cursor_id: u64,
    cursors: Vec<Attached<K, V>>,
}

/// Size-tuned store: a single shared value list with per-cursor positions
/// and reference-counted reclamation of the consumed prefix.
pub(crate) struct SharedStore<K, V> {
    key: K,
    state: RwLock<SharedState<K, V>>,
}

impl<K, V> SharedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            state: RwLock::new(SharedState {
                values: VecDeque::new(),
                head_seq: 0,
                next_cursor_id: 0,
                cursors: Vec::new(),
            }),
        }
    }

    /// Append a value and wake the cursors that were drained.
    fn append(&self, value: Arc<V>) {
        let to_notify = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let seq = state.head_seq + state.values.len() as u64;
            let mut moved = Vec::new();
            for attached in &mut state.cursors {
                if attached.pos == Position::End {
                    attached.pos = Position::At(seq);
                    moved.push(Arc::clone(&attached.cursor));
                }
            }
            state.values.push_back(Slot {
                value,
                holds: moved.len() as u32,
            });
            moved
        };
        // Fired outside the lock: the processor may immediately post a task
        // that reads back through this store.
        for cursor in &to_notify {
            SharedCursor::notify(cursor);
        }
    }

    pub(crate) fn attach_cursor(
        this: &Arc<Self>,
        processor: Weak<ConsumerProcessor<K, V>>,
    ) -> Arc<SharedCursor<K, V>> {
        let mut guard = this.state.write();
        let id = guard.next_cursor_id;
        guard.next_cursor_id += 1;
        let cursor = Arc::new(SharedCursor {
            id,
            store: Arc::clone(this),
            processor,
            stopped: AtomicBool::new(false),
        });
        guard.cursors.push(Attached {
            id,
            pos: Position::End,
            cursor: Arc::clone(&cursor),
        });
        cursor
    }

    fn current(&self, id: u64) -> Option<(K, Arc<V>)> {
        let guard = self.state.read();
        let attached = guard.cursors.iter().find(|a| a.id == id)?;
        match attached.pos {
            Position::End => None,
            Position::At(seq) => {
                let slot = guard.values.get((seq - guard.head_seq) as usize)?;
                Some((self.key.clone(), Arc::clone(&slot.value)))
            }
        }
    }

    fn has_value(&self, id: u64) -> bool {
        let guard = self.state.read();
        guard
            .cursors
            .iter()
            .find(|a| a.id == id)
            .is_some_and(|a| a.pos != Position::End)
    }

    fn advance(&self, id: u64) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(index) = state.cursors.iter().position(|a| a.id == id) else {
            return false;
        };
        let Position::At(seq) = state.cursors[index].pos else {
            return false;
        };
        state.values[(seq - state.head_seq) as usize].holds -= 1;
        let next = seq + 1;
        let has_more = next < state.head_seq + state.values.len() as u64;
        if has_more {
            state.values[(next - state.head_seq) as usize].holds += 1;
            state.cursors[index].pos = Position::At(next);
        } else {
            state.cursors[index].pos = Position::End;
        }
        collect_consumed(state);
        has_more
    }

    /// Remove a cursor from the attached set and release its hold.
    fn detach(&self, id: u64) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(index) = state.cursors.iter().position(|a| a.id == id) else {
            return;
        };
        let attached = state.cursors.remove(index);
        if let Position::At(seq) = attached.pos {
            state.values[(seq - state.head_seq) as usize].holds -= 1;
            collect_consumed(state);
        }
    }

    #[cfg(test)]
    pub(crate) fn value_count(&self) -> usize {
        self.state.read().values.len()
    }
}

/// Reclaim the consumed prefix: slots are dropped from the head until one
/// with a live hold is found.
fn collect_consumed<K, V>(state: &mut SharedState<K, V>) {
    while state.values.front().is_some_and(|slot| slot.holds == 0) {
        _ = state.values.pop_front();
        state.head_seq += 1;
    }
}

impl<K, V> Store<K, V> for SharedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn add_owned(&self, value: V) {
        self.append(Arc::new(value));
    }

    fn add_borrowed(&self, value: &V) {
        // The single engine copy of the borrowed-enqueue path.
        self.append(Arc::new(value.clone()));
    }

    fn create_source(
        self: Arc<Self>,
        processor: Weak<ConsumerProcessor<K, V>>,
    ) -> Arc<dyn ValueSource<K, V>> {
        Self::attach_cursor(&self, processor)
    }
}

/// A subscriber's view onto a [`SharedStore`]. Position and hold counts live
/// in the store, guarded by its lock; the cursor itself carries only
/// identity, the processor binding, and the stop flag.
pub(crate) struct SharedCursor<K, V> {
    id: u64,
    store: Arc<SharedStore<K, V>>,
    processor: Weak<ConsumerProcessor<K, V>>,
    stopped: AtomicBool,
}

impl<K, V> SharedCursor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn notify(this: &Arc<Self>) {
        if this.is_stopped() {
            return;
        }
        if let Some(processor) = this.processor.upgrade() {
            let source: Arc<dyn ValueSource<K, V>> = Arc::clone(this) as _;
            processor.on_new_value(this.store.key.clone(), source);
        }
    }
}

impl<K, V> ValueSource<K, V> for SharedCursor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn current(&self) -> Option<(K, Arc<V>)> {
        self.store.current(self.id)
    }

    fn has_value(&self) -> bool {
        self.store.has_value(self.id)
    }

    fn advance(&self) -> bool {
        self.store.advance(self.id)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.store.detach(self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// MirroredStore -- speed-tuned: a private deque per cursor
// ---------------------------------------------------------------------------

/// Speed-tuned store: keeps only the cursor list. Values live in the
/// cursors' private deques, one clone per cursor per publish.
pub(crate) struct MirroredStore<K, V> {
    key: K,
    cursors: Mutex<Vec<Arc<MirroredCursor<K, V>>>>,
}

impl<K, V> MirroredStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            cursors: Mutex::new(Vec::new()),
        }
    }

    /// Clone the value into every attached cursor's deque. The cursor list
    /// is snapshotted under the store lock; pushes and notifications run
    /// outside it.
    fn fan_out(&self, value: &V) {
        let cursors = self.cursors.lock().clone();
        for cursor in &cursors {
            MirroredCursor::push(cursor, value.clone());
        }
    }

    pub(crate) fn attach_cursor(
        this: &Arc<Self>,
        processor: Weak<ConsumerProcessor<K, V>>,
    ) -> Arc<MirroredCursor<K, V>> {
        let cursor = Arc::new(MirroredCursor {
            store: Arc::clone(this),
            queue: Mutex::new(VecDeque::new()),
            processor,
            stopped: AtomicBool::new(false),
        });
        this.cursors.lock().push(Arc::clone(&cursor));
        cursor
    }

    fn detach(&self, cursor: &MirroredCursor<K, V>) {
        self.cursors
            .lock()
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), cursor));
    }
}

impl<K, V> Store<K, V> for MirroredStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn add_owned(&self, value: V) {
        self.fan_out(&value);
    }

    fn add_borrowed(&self, value: &V) {
        self.fan_out(value);
    }

    fn create_source(
        self: Arc<Self>,
        processor: Weak<ConsumerProcessor<K, V>>,
    ) -> Arc<dyn ValueSource<K, V>> {
        Self::attach_cursor(&self, processor)
    }
}

/// A subscriber's private queue over a [`MirroredStore`].
pub(crate) struct MirroredCursor<K, V> {
    store: Arc<MirroredStore<K, V>>,
    queue: Mutex<VecDeque<Arc<V>>>,
    processor: Weak<ConsumerProcessor<K, V>>,
    stopped: AtomicBool,
}

impl<K, V> MirroredCursor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn push(this: &Arc<Self>, value: V) {
        if this.is_stopped() {
            return;
        }
        let was_empty = {
            let mut queue = this.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Arc::new(value));
            was_empty
        };
        // Only the empty-to-non-empty edge needs a push signal; a non-empty
        // queue already has a task chain draining it.
        if was_empty {
            Self::notify(this);
        }
    }

    fn notify(this: &Arc<Self>) {
        if this.is_stopped() {
            return;
        }
        if let Some(processor) = this.processor.upgrade() {
            let source: Arc<dyn ValueSource<K, V>> = Arc::clone(this) as _;
            processor.on_new_value(this.store.key.clone(), source);
        }
    }
}

impl<K, V> ValueSource<K, V> for MirroredCursor<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn current(&self) -> Option<(K, Arc<V>)> {
        let queue = self.queue.lock();
        queue
            .front()
            .map(|value| (self.store.key.clone(), Arc::clone(value)))
    }

    fn has_value(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn advance(&self) -> bool {
        let mut queue = self.queue.lock();
        _ = queue.pop_front();
        !queue.is_empty()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.store.detach(self);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_store() -> Arc<SharedStore<u32, String>> {
        Arc::new(SharedStore::new(7))
    }

    fn mirrored_store() -> Arc<MirroredStore<u32, String>> {
        Arc::new(MirroredStore::new(7))
    }

    // Cursors detached from any live processor: notifications become no-ops
    // and the cursor is driven by hand.
    fn shared_cursor(store: &Arc<SharedStore<u32, String>>) -> Arc<SharedCursor<u32, String>> {
        SharedStore::attach_cursor(store, Weak::new())
    }

    fn mirrored_cursor(
        store: &Arc<MirroredStore<u32, String>>,
    ) -> Arc<MirroredCursor<u32, String>> {
        MirroredStore::attach_cursor(store, Weak::new())
    }

    fn drain(cursor: &Arc<SharedCursor<u32, String>>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some((_, value)) = cursor.current() {
            seen.push((*value).clone());
            _ = cursor.advance();
        }
        seen
    }

    // A value list shared by two cursors is empty again once both consumed
    // everything.
    #[test]
    fn shared_store_reclaims_fully_consumed_values() {
        let store = shared_store();
        let a = shared_cursor(&store);
        let b = shared_cursor(&store);
        for i in 0..3 {
            store.add_owned(i.to_string());
        }
        assert_eq!(store.value_count(), 3);
        assert_eq!(drain(&a), vec!["0", "1", "2"]);
        assert_eq!(store.value_count(), 3); // b still pins the whole list
        assert_eq!(drain(&b), vec!["0", "1", "2"]);
        assert_eq!(store.value_count(), 0);
    }

    // A slow cursor pins exactly the suffix it has not consumed yet.
    #[test]
    fn shared_store_slow_cursor_pins_its_suffix() {
        let store = shared_store();
        let fast = shared_cursor(&store);
        let slow = shared_cursor(&store);
        for i in 0..4 {
            store.add_owned(i.to_string());
        }
        _ = drain(&fast);
        assert_eq!(store.value_count(), 4);
        _ = slow.advance();
        assert_eq!(store.value_count(), 3);
        _ = slow.advance();
        assert_eq!(store.value_count(), 2);
    }

    // A cursor attached to a non-empty list starts past the stored values.
    #[test]
    fn shared_store_late_cursor_starts_at_end() {
        let store = shared_store();
        let early = shared_cursor(&store);
        store.add_owned("0".into());
        store.add_owned("1".into());

        let late = shared_cursor(&store);
        assert!(!late.has_value());

        store.add_owned("2".into());
        assert_eq!(drain(&late), vec!["2"]);
        assert_eq!(drain(&early), vec!["0", "1", "2"]);
    }

    // Stopping a cursor releases its hold so the values it pinned can be
    // reclaimed, and hides any remaining values from it.
    #[test]
    fn shared_store_stop_releases_holds() {
        let store = shared_store();
        let active = shared_cursor(&store);
        let stopping = shared_cursor(&store);
        for i in 0..3 {
            store.add_owned(i.to_string());
        }
        stopping.stop();
        assert!(stopping.is_stopped());
        assert!(!stopping.has_value());
        assert!(stopping.current().is_none());
        assert_eq!(drain(&active), vec!["0", "1", "2"]);
        assert_eq!(store.value_count(), 0);
    }

    // Stop is idempotent and advance after stop degrades to false.
    #[test]
    fn shared_store_stop_is_idempotent() {
        let store = shared_store();
        let cursor = shared_cursor(&store);
        store.add_owned("0".into());
        cursor.stop();
        cursor.stop();
        assert!(!cursor.advance());
    }

    // Values published after a cursor stopped are not retained on its
    // behalf.
    #[test]
    fn shared_store_stopped_cursor_never_pins_new_values() {
        let store = shared_store();
        let cursor = shared_cursor(&store);
        cursor.stop();
        store.add_owned("0".into());
        assert_eq!(store.value_count(), 0);
    }

    // Every cursor of a mirrored store gets its own copy, consumed
    // independently.
    #[test]
    fn mirrored_store_cursors_consume_independently() {
        let store = mirrored_store();
        let a = mirrored_cursor(&store);
        let b = mirrored_cursor(&store);
        store.add_owned("x".into());
        store.add_owned("y".into());

        assert_eq!(a.current().map(|(_, v)| (*v).clone()), Some("x".into()));
        assert!(a.advance());
        assert!(!a.advance());
        // b is unaffected by a's progress.
        assert_eq!(b.current().map(|(_, v)| (*v).clone()), Some("x".into()));
        assert!(b.has_value());
    }

    // A stopped mirrored cursor no longer receives published values.
    #[test]
    fn mirrored_store_stopped_cursor_receives_nothing() {
        let store = mirrored_store();
        let stopped = mirrored_cursor(&store);
        let live = mirrored_cursor(&store);
        stopped.stop();
        store.add_owned("x".into());
        assert!(!stopped.has_value());
        assert!(live.has_value());
    }

    // Both stores hand out the key alongside the value.
    #[test]
    fn cursors_report_their_key() {
        let store = shared_store();
        let cursor = shared_cursor(&store);
        store.add_owned("v".into());
        assert_eq!(cursor.current().map(|(k, _)| k), Some(7));

        let store = mirrored_store();
        let cursor = mirrored_cursor(&store);
        store.add_owned("v".into());
        assert_eq!(cursor.current().map(|(k, _)| k), Some(7));
    }
}
