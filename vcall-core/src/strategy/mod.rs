//! The three call strategies and the return-shape check
//! they share.

pub mod evaluated;
pub mod getter;
pub mod recording;

use smallvec::SmallVec;
use vcall_backend::{Backend, IrBackend};
use vcall_types::{AdHandle, InstanceId, IrHandle, VarType};

use crate::error::{Bug, BugVariant, DispatchError};
use crate::{Result, INLINE_RETURNS};

/// The output of any of the three call strategies, before the dispatcher
/// decides whether to wrap it in a [`crate::custom_op::DispatchOp`].
pub struct StrategyOutput {
    /// One plain IR handle per return slot.
    pub rv: SmallVec<[IrHandle; INLINE_RETURNS]>,
    /// Per-slot: did any callable's corresponding return value carry an AD
    /// tag? Feeds `needs_ad` in [`crate::dispatcher::Dispatcher::call`]
    /// alongside the input arguments' AD tags.
    pub differentiable: SmallVec<[bool; INLINE_RETURNS]>,
}

/// The arity/type/backend signature fixed by the first non-empty
/// callable a strategy visits; every later callable must match it
/// exactly.
#[derive(Debug, Clone)]
pub struct ReturnShape {
    types: SmallVec<[VarType; INLINE_RETURNS]>,
    backends: SmallVec<[Backend; INLINE_RETURNS]>,
}

impl ReturnShape {
    /// The arity this shape fixed.
    pub fn arity(&self) -> usize {
        self.types.len()
    }

    /// The type fixed for return slot `slot`, if in range.
    pub fn type_at(&self, slot: usize) -> Option<VarType> {
        self.types.get(slot).copied()
    }
}

/// Validate one callable's return values against the shape fixed by the
/// first non-empty callable, fixing it if this is the first. `rv_i` must not be empty — an empty callable's region is
/// simply never visited by this check.
pub fn check_rv<B: IrBackend>(
    ir: &B,
    callable: InstanceId,
    shape: &mut Option<ReturnShape>,
    rv_i: &[AdHandle],
) -> Result<()> {
    for (slot, handle) in rv_i.iter().enumerate() {
        if handle.ir().is_null() {
            return Err(DispatchError::EmptyReturn {
                callable: callable.raw(),
                slot: slot as u32,
            });
        }
    }

    match shape {
        None => {
            let types = rv_i.iter().map(|h| ir.var_type(h.ir())).collect();
            let backends = rv_i.iter().map(|h| ir.backend_of(h.ir())).collect();
            *shape = Some(ReturnShape { types, backends });
            Ok(())
        }
        Some(shape) => {
            if rv_i.len() != shape.types.len() {
                return Err(DispatchError::ReturnArityMismatch {
                    callable: callable.raw(),
                    expected: shape.types.len(),
                    found: rv_i.len(),
                });
            }
            for (slot, handle) in rv_i.iter().enumerate() {
                let found_ty = ir.var_type(handle.ir());
                if found_ty != shape.types[slot] {
                    return Err(DispatchError::ReturnTypeMismatch {
                        callable: callable.raw(),
                        slot: slot as u32,
                        expected: shape.types[slot],
                        found: found_ty,
                    });
                }
                let found_backend = ir.backend_of(handle.ir());
                if found_backend != shape.backends[slot] {
                    return Err(DispatchError::ReturnBackendMismatch {
                        callable: callable.raw(),
                        slot: slot as u32,
                    });
                }
            }
            Ok(())
        }
    }
}

/// Require that a return shape was fixed by at least one callable.
/// Tripping this means every callable slot was skipped (unregistered
/// ids) yet the caller didn't hit the degenerate all-null-instance path
/// that [`crate::dispatcher::Dispatcher::call`] special-cases up front —
/// an internal bookkeeping bug, not a caller error.
pub fn require_shape(shape: Option<ReturnShape>) -> Result<ReturnShape> {
    shape.ok_or_else(|| {
        Bug::new(BugVariant::CheckpointCountMismatch)
            .with_message("no callable produced a return shape")
            .into()
    })
}
