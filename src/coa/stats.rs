//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and exist for diagnostic display only.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Total block-storage bytes acquired from the OS by all arenas
crate::sync::static_atomic! {
    pub static OS_BYTES_ACQUIRED: Counter = Counter::new();
}
// Number of OS regions backing block storage
crate::sync::static_atomic! {
    pub static OS_REGIONS_ACQUIRED: Counter = Counter::new();
}

// Address space reserved for page-info tables (lazily committed)
crate::sync::static_atomic! {
    pub static PAGE_MAP_RESERVED: Counter = Counter::new();
}

// Bytes carved into tree-node free lists
crate::sync::static_atomic! {
    pub static NODE_REGION_BYTES: Counter = Counter::new();
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let c = Counter::new();
        c.add(10);
        c.add(5);
        c.sub(3);
        assert_eq!(c.get(), 12);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(100);
        assert_eq!(c.get(), 0, "reads clamp transient negatives to zero");
        c.add(150);
        assert_eq!(c.get(), 50);
    }
}
