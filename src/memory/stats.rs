//! All counters use `Relaxed` ordering and are diagnostic only. They are
//! updated from the crash-safety path too, which is why they are plain
//! atomics: no locks, no allocation.
//! Do NOT use these values for allocation decisions.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// The raw value may transiently dip below zero if a subtraction is recorded
/// before its matching addition. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    pub const fn new() -> Self {
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
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes currently mapped for registered large allocations.
pub static MAPPED_BYTES: Counter = Counter::new();
/// Registered large allocations currently live.
pub static LIVE_MAPPINGS: Counter = Counter::new();
/// Backing-file descriptors currently held by the registry.
pub static OPEN_DESCRIPTORS: Counter = Counter::new();
/// Times the crash-safety hooks have been installed.
pub static HOOK_INSTALLS: Counter = Counter::new();

/// Point-in-time view of the counters above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LargeAllocStats {
    pub mapped_bytes: usize,
    pub live_mappings: usize,
    pub open_descriptors: usize,
    pub hook_installs: usize,
}

#[must_use]
pub fn snapshot() -> LargeAllocStats {
    LargeAllocStats {
        mapped_bytes: MAPPED_BYTES.get(),
        live_mappings: LIVE_MAPPINGS.get(),
        open_descriptors: OPEN_DESCRIPTORS.get(),
        hook_installs: HOOK_INSTALLS.get(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_counter_huge_delta_does_not_wrap() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX as usize);
    }
}
