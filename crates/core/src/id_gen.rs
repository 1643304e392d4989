//! ID generation
//!
//! nanoid-based tags for connection attempts, plus the numeric generators the
//! protocol needs: time-derived correlation ids for orders and a plain
//! sequence for ping `cid`s.

use crate::timing::millis;
use nanoid::nanoid;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generate a unique 12 character id
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Generate a unique id with prefix and millisecond timestamp, e.g. `CONN-1700000000000-x1Y2z3W4aB5c`
pub fn generate_id_with_prefix(prefix: &str) -> String {
    format!("{prefix}-{}-{}", millis(), generate_id())
}

/// Strictly monotonic, millisecond-derived correlation ids.
///
/// Each id is at least the current Unix time in milliseconds and always
/// greater than every id handed out before it, so ids stay unique even when
/// many are requested within the same millisecond. [`reserve`](Self::reserve)
/// hands out a contiguous block, which lets a batch use `base + offset`.
#[derive(Debug, Default)]
pub struct CorrelationIdGenerator {
    last: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next single correlation id
    pub fn next_id(&self) -> u64 {
        self.reserve(1)
    }

    /// Reserve `count` consecutive ids and return the first one.
    pub fn reserve(&self, count: u64) -> u64 {
        let count = count.max(1);
        let now = millis();
        let mut base = 0;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                base = now.max(last + 1);
                Some(base + count - 1)
            });
        base
    }

    /// Highest id handed out so far (0 before the first reservation)
    pub fn last_issued(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Sequential ids starting at 1
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    counter: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
