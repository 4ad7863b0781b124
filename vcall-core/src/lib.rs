//! The symbolic indirect-call dispatcher.
//!
//! This crate is the meta-tracer at the heart of the JIT: given a vector of
//! per-lane instance ids and a callable, it fuses the per-instance
//! sub-computations into a single compiled kernel (the *recording*
//! strategy), evaluates them eagerly bucket-by-bucket (the *evaluated*
//! strategy), or — when every callable returns only a scalar literal —
//! compiles the call into a single gather from a packed table (the
//! *getter* strategy). A [`custom_op::DispatchOp`] re-enters the
//! dispatcher to route gradients through the call for both automatic
//! differentiation modes, and the symbolic [`control_flow::if_stmt`] and
//! [`control_flow::while_loop`] frontends reuse the same recording
//! machinery.
//!
//! The crate carries no IR instruction set and no code generator: those
//! live behind the [`vcall_backend::IrBackend`] and
//! [`vcall_backend::AdEngine`] traits this crate is written against.
//!
//! # Why `dyn`, not generics
//!
//! `vcall-backend::AdEngine::ad_custom_op` must be able to store a
//! [`custom_op::DispatchOp`] from *any* call site in one AD graph, which
//! means the op type it accepts has to be object-safe
//! (`vcall_backend::CustomOp`, stored as `Box<dyn CustomOp>`). An
//! object-safe op can't hand back a concretely-typed backend to the
//! callable it re-invokes — so, rather than mix static generics (like
//! `fuel-vm`'s `Interpreter<S, Tx, Ecal>`) with an object-safe escape
//! hatch only for the AD hook, this crate commits to `&mut dyn
//! IrBackend` / `&mut dyn AdEngine` everywhere. The indirect-call
//! boundary is not a hot numeric loop itself — the vectorized kernel
//! dynamic dispatch compiles down to is — so the extra vtable indirection
//! here is the right tradeoff, not a shortcut.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unused_must_use)]

extern crate alloc;

pub mod control_flow;
pub mod custom_op;
pub mod dispatcher;
pub mod error;
pub mod pytree;
mod stacks;
pub mod strategy;

#[cfg(feature = "instrumentation")]
pub mod stats;

#[cfg(feature = "test-helpers")]
pub mod testutil;

use alloc::boxed::Box;
use smallvec::SmallVec;
use vcall_backend::{AdEngine, IrBackend};
use vcall_types::AdHandle;

pub use dispatcher::{CallRequest, Dispatcher};
pub use error::{Bug, BugVariant, DispatchError, Result};

/// The inline capacity used for per-call return-value buffers.
///
/// Most callables return 0-4 values; `smallvec` keeps that common case off
/// the heap while still supporting arbitrary arity.
pub const INLINE_RETURNS: usize = 4;

/// A list of AD-tagged return-value handles, inline-allocated up to
/// [`INLINE_RETURNS`] slots.
pub type RvVec = SmallVec<[AdHandle; INLINE_RETURNS]>;

/// An opaque pointer to a resolved callable instance, or `None` for the
/// degenerate "null instance" prototype call.
pub type InstancePtr = Option<core::ptr::NonNull<()>>;

/// Bundles the two process-wide collaborators the dispatcher threads
/// through every strategy and control-flow frontend: the IR backend and
/// the AD engine.
pub struct Ctx<'a> {
    /// The IR backend.
    pub ir: &'a mut dyn IrBackend,
    /// The AD engine.
    pub ad: &'a mut dyn AdEngine,
}

impl<'a> Ctx<'a> {
    /// Borrow both collaborators together.
    pub fn new(ir: &'a mut dyn IrBackend, ad: &'a mut dyn AdEngine) -> Self {
        Self { ir, ad }
    }

    /// Reborrow for a shorter lifetime, e.g. to pass into a nested call.
    pub fn reborrow(&mut self) -> Ctx<'_> {
        Ctx {
            ir: self.ir,
            ad: self.ad,
        }
    }
}

/// The callable protocol.
///
/// A C-shaped `user_fn(payload, instance_ptr, args, out rv)` plus
/// a separate `cleanup_fn(payload)` is, in Rust, just a closure (or any
/// type) that owns its captured state and implements [`Drop`] for
/// cleanup — see DESIGN.md for the full reasoning. `vcall-core` takes
/// `Box<dyn UserFn>` by *value*: on the differentiable path that box is
/// moved into the constructed [`custom_op::DispatchOp`], which owns it
/// until the AD graph drops the op; on every other path it is simply
/// dropped at the end of [`Dispatcher::call`], which runs the same
/// destructor a hand-written `cleanup_fn` would have.
pub trait UserFn {
    /// Invoke the callable for one resolved instance (or `None` for the
    /// degenerate prototype call), writing its return values into `rv`.
    /// May fail; must never leave a scoped stack unbalanced, even on
    /// failure — callers push/pop around this call, not the callee.
    fn call(&mut self, ctx: &mut Ctx<'_>, instance: InstancePtr, args: &[AdHandle], rv: &mut RvVec) -> Result<()>;
}

impl<F> UserFn for F
where
    F: FnMut(&mut Ctx<'_>, InstancePtr, &[AdHandle], &mut RvVec) -> Result<()>,
{
    fn call(&mut self, ctx: &mut Ctx<'_>, instance: InstancePtr, args: &[AdHandle], rv: &mut RvVec) -> Result<()> {
        (self)(ctx, instance, args, rv)
    }
}

/// A boxed [`UserFn`], the form [`dispatcher::Dispatcher::call`] takes
/// ownership of. `'static` because on the differentiable path it is
/// moved into a [`custom_op::DispatchOp`] that may outlive the call that
/// constructed it, for as long as the AD graph keeps the op alive.
/// Internal re-entry from `forward`/`backward` instead calls
/// [`dispatcher::Dispatcher::dispatch`], which only *borrows* a
/// `&mut dyn UserFn` and so never needs this ownership at all.
pub type BoxedUserFn = Box<dyn UserFn>;
