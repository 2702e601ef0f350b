// Copyright The KeyFan Authors
// SPDX-License-Identifier: Apache-2.0

//! Cooperative cancellation for queued delivery tasks.
//!
//! A [`CancellationSource`] owns the requested flag; every
//! [`CancellationToken`] holds a weak reference to it. Dropping the source
//! therefore cancels implicitly -- a token whose upgrade fails reports
//! cancellation, so an owner that disappears mid-flight behaves exactly like
//! one that called [`CancellationSource::cancel`]. Tokens are freely
//! cloneable; sources are not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Owning side of a cancellation pair.
#[derive(Debug, Default)]
pub struct CancellationSource {
    requested: Arc<AtomicBool>,
}

impl CancellationSource {
    /// Create a source with cancellation not yet requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested on this source.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Create a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            requested: Arc::downgrade(&self.requested),
        }
    }
}

/// Observing side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    requested: Weak<AtomicBool>,
}

impl CancellationToken {
    /// True when the source cancelled or no longer exists.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        match self.requested.upgrade() {
            Some(flag) => flag.load(Ordering::Acquire),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_reflects_cancel() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancellation_requested());
        source.cancel();
        assert!(token.is_cancellation_requested());
        assert!(source.is_cancellation_requested());
    }

    #[test]
    fn dropping_source_cancels_tokens() {
        let source = CancellationSource::new();
        let token = source.token();
        let clone = token.clone();
        drop(source);
        assert!(token.is_cancellation_requested());
        assert!(clone.is_cancellation_requested());
    }

    #[test]
    fn cancel_is_idempotent() {
        let source = CancellationSource::new();
        source.cancel();
        source.cancel();
        assert!(source.token().is_cancellation_requested());
    }
}
