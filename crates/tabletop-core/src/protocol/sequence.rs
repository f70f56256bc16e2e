//! Thread-safe counter used to number accepted connections.
//!
//! Every socket the server accepts gets an id of the form
//! `<remote-address>-<sequence>`; the sequence part comes from one of these
//! counters, so two connections from the same address never share an id.
//!
//! # Thread safety
//!
//! The counter is a single `AtomicU64`.  `fetch_add` reads and increments in
//! one indivisible step, so any number of accept threads may call
//! [`SequenceCounter::next`] at once without ever seeing the same value.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use tabletop_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next value; wraps from `u64::MAX` to 0 without panicking.
    ///
    /// `Relaxed` ordering is enough: the value only has to be unique, it
    /// does not publish any other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
