use crate::handle::IrHandle;
use core::fmt;

/// A 64-bit composite handle: the upper 32 bits are an AD-graph node id (0
/// if the value isn't tracked), the lower 32 bits are the IR handle.
///
/// Packed as a tagged union of indices rather than a separate allocation
/// per variable.
/// Zero in either half is meaningful on its own: a zero IR half means
/// uninitialized/empty; a zero AD half means "not differentiable". The two
/// halves are ref-counted independently by whoever owns the handle.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdHandle(u64);

impl AdHandle {
    /// The empty / uninitialized sentinel (both halves zero).
    pub const NULL: Self = Self(0);

    /// Compose an AD handle from its two halves.
    pub const fn new(ad_id: u32, ir: IrHandle) -> Self {
        Self(((ad_id as u64) << 32) | ir.raw() as u64)
    }

    /// Build a non-differentiable handle from a plain IR handle.
    pub const fn from_ir(ir: IrHandle) -> Self {
        Self::new(0, ir)
    }

    /// The IR half.
    pub const fn ir(self) -> IrHandle {
        IrHandle::new(self.0 as u32)
    }

    /// The AD-graph node id, or 0 if not tracked.
    pub const fn ad_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// `true` if this handle is tracked by the AD graph.
    pub const fn is_differentiable(self) -> bool {
        self.ad_id() != 0
    }

    /// `true` if the IR half is the empty sentinel.
    pub const fn is_null(self) -> bool {
        self.ir().is_null()
    }

    /// Return a copy of this handle with the AD tag stripped, keeping the
    /// IR half. Used when AD wrapping is skipped.
    pub const fn detached(self) -> Self {
        Self::from_ir(self.ir())
    }

    /// Replace the IR half, keeping whatever AD tag was present.
    pub const fn with_ir(self, ir: IrHandle) -> Self {
        Self::new(self.ad_id(), ir)
    }
}

impl fmt::Debug for AdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdHandle")
            .field("ad_id", &self.ad_id())
            .field("ir", &self.ir())
            .finish()
    }
}

impl From<IrHandle> for AdHandle {
    fn from(ir: IrHandle) -> Self {
        Self::from_ir(ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_both_halves() {
        let h = AdHandle::new(42, IrHandle::new(7));
        assert_eq!(h.ad_id(), 42);
        assert_eq!(h.ir(), IrHandle::new(7));
        assert!(h.is_differentiable());
    }

    #[test]
    fn plain_ir_is_not_differentiable() {
        let h = AdHandle::from_ir(IrHandle::new(3));
        assert_eq!(h.ad_id(), 0);
        assert!(!h.is_differentiable());
        assert!(!h.is_null());
    }

    #[test]
    fn null_is_both_halves_zero() {
        assert!(AdHandle::NULL.is_null());
        assert!(!AdHandle::NULL.is_differentiable());
    }

    #[test]
    fn detach_keeps_ir_drops_ad_tag() {
        let h = AdHandle::new(9, IrHandle::new(5));
        let d = h.detached();
        assert_eq!(d.ir(), IrHandle::new(5));
        assert_eq!(d.ad_id(), 0);
    }

    #[quickcheck_macros::quickcheck]
    fn pack_unpack_roundtrip(ad_id: u32, ir_raw: u32) -> bool {
        let h = AdHandle::new(ad_id, IrHandle::new(ir_raw));
        h.ad_id() == ad_id && h.ir() == IrHandle::new(ir_raw)
    }
}
