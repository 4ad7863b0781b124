use core::fmt;

/// A 32-bit reference to a node in the IR graph.
///
/// Reference-counted by the backend; a zero value is the uninitialized /
/// empty sentinel and must never be observed crossing the dispatcher's
/// public boundary.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrHandle(u32);

impl IrHandle {
    /// The empty / uninitialized sentinel.
    pub const NULL: Self = Self(0);

    /// Wrap a raw backend-assigned id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id, for handing back to the backend.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `true` if this is the empty/uninitialized sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for IrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IrHandle({:#010x})", self.0)
    }
}

/// Which side of the host/device boundary a handle's data lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Scalar, host-resident value.
    Host,
    /// Wide, device-resident array.
    Device,
}

/// Lifecycle state of an IR node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// The value is a compile-time constant baked into the graph.
    Literal,
    /// Recorded but not yet scheduled for evaluation.
    Unevaluated,
    /// Scheduled and materialized; device data is readable.
    Evaluated,
    /// Evaluated, but since mutated through an aliasing write; must be
    /// re-evaluated before it can be trusted.
    Dirty,
}

/// A minimal placeholder type tag for IR values.
///
/// The real type system (bit widths, vector/matrix shapes, pointer types)
/// lives in the IR backend this crate is written against; the dispatcher only ever needs to compare two types for
/// equality when validating that callables agree on return types
/// (`ReturnTypeMismatch`), so a small closed enum is sufficient here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    /// Boolean / mask lane.
    Bool,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// A pointer-sized opaque value (e.g. an array handle held by value).
    Pointer,
}

impl VarType {
    /// `true` for the floating-point types, i.e. the ones that can carry a
    /// tangent/cotangent and therefore participate in AD.
    pub const fn is_differentiable(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_zero() {
        assert!(IrHandle::NULL.is_null());
        assert!(IrHandle::default().is_null());
        assert_eq!(IrHandle::new(0).raw(), 0);
    }

    #[test]
    fn nonzero_handle_is_not_null() {
        assert!(!IrHandle::new(7).is_null());
    }

    #[test]
    fn float_types_are_differentiable() {
        assert!(VarType::F32.is_differentiable());
        assert!(VarType::F64.is_differentiable());
        assert!(!VarType::I32.is_differentiable());
        assert!(!VarType::Bool.is_differentiable());
    }
}
