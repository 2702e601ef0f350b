// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

/// Errors produced by the built-in thread pool.
///
/// The registry itself is infallible by contract: publishing to an unknown
/// key, repeating a subscription, or unsubscribing something that was never
/// subscribed are all silently ignored.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The pool was stopped and no longer accepts tasks.
    #[error("thread pool is stopped")]
    PoolStopped,
}
