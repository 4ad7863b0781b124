//! Opt-in dispatch accounting,
//! gated behind the `instrumentation` feature — the same
//! opt-in-cost-accounting idea as `fuel-vm`'s `profile-gas`/
//! `profile-coverage` features (see `fuel_vm::profiler`), generalized
//! from gas ticks to per-strategy call counts since this crate has no
//! gas model of its own.
//!
//! Unlike `fuel_vm::Profiler`, which is threaded through the
//! interpreter and exported after a transaction runs, `DispatchStats` is
//! a plain counter a caller owns and passes in alongside the backend
//! context; nothing in `vcall-core` reaches for a global.

use alloc::vec::Vec;
use hashbrown::HashMap;

/// Which path a single [`crate::Dispatcher::call`] invocation took, for
/// histogram purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPath {
    /// The degenerate all-masked/zero-callable case.
    Degenerate,
    /// The recording strategy.
    Recording,
    /// The evaluated strategy.
    Evaluated,
    /// The getter strategy.
    Getter,
}

/// Per-call-site counters: how many times each [`DispatchPath`] was
/// taken, and a histogram of `callable_count` seen per path.
///
/// Cheap to construct and clone; callers typically keep one instance per
/// call site (or one global instance keyed externally) and call
/// [`Self::record`] from around [`crate::Dispatcher::call`].
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    counts: HashMap<DispatchPath, u64>,
    callable_counts: HashMap<DispatchPath, Vec<u32>>,
}

impl DispatchStats {
    /// An empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dispatch having taken `path` with the given
    /// `callable_count`.
    pub fn record(&mut self, path: DispatchPath, callable_count: u32) {
        *self.counts.entry(path).or_insert(0) += 1;
        self.callable_counts.entry(path).or_default().push(callable_count);
    }

    /// Total number of calls recorded for `path`.
    pub fn count(&self, path: DispatchPath) -> u64 {
        self.counts.get(&path).copied().unwrap_or(0)
    }

    /// The `callable_count` histogram recorded for `path`, in recording
    /// order.
    pub fn callable_counts(&self, path: DispatchPath) -> &[u32] {
        self.callable_counts.get(&path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of calls recorded across every path.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_path() {
        let mut stats = DispatchStats::new();
        stats.record(DispatchPath::Recording, 3);
        stats.record(DispatchPath::Recording, 2);
        stats.record(DispatchPath::Getter, 3);

        assert_eq!(stats.count(DispatchPath::Recording), 2);
        assert_eq!(stats.count(DispatchPath::Getter), 1);
        assert_eq!(stats.count(DispatchPath::Evaluated), 0);
        assert_eq!(stats.callable_counts(DispatchPath::Recording), &[3, 2]);
        assert_eq!(stats.total(), 3);
    }
}
