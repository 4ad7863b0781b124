use core::fmt;

/// A 1-based index into the dense `[1..callable_count]` callable table.
/// `0` is the reserved null instance: its
/// lane is masked off and its callable is never invoked.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Wrap a raw instance id. `0` is the null instance.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `true` for the reserved null instance.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Iterate `1..=count` as `InstanceId`s, skipping the null instance by
    /// construction.
    pub fn range(count: u32) -> impl Iterator<Item = InstanceId> {
        (1..=count).map(InstanceId::new)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        assert!(InstanceId::new(0).is_null());
        assert!(InstanceId::default().is_null());
    }

    #[test]
    fn range_skips_zero() {
        let ids: Vec<_> = InstanceId::range(3).map(InstanceId::raw).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn range_empty_for_zero_count() {
        assert_eq!(InstanceId::range(0).count(), 0);
    }
}
