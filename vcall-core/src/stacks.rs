//! Combinators over the three process-wide scoped stacks.
//!
//! These are naturally RAII/try-finally wrappers around a mutable
//! process-wide backend. In Rust, a guard that must call back into the
//! very `&mut dyn IrBackend` it was constructed from at `Drop` time
//! can't coexist with that reference being used for anything else in
//! between — so instead of a guard struct, each helper here is a
//! combinator: push, run the closure, pop, independent of whether the
//! closure returned `Ok` or `Err`. Because this crate reports failure
//! through `Result` rather than unwinding, "release on every exit path,
//! success or exception" reduces exactly to "pop after the
//! closure returns" — there is no panic-mediated exit path to
//! additionally guard against in ordinary operation.
//!
//! Every helper pops exactly once per push, preserving stack depth
//! regardless of the closure's outcome.
//!
//! Every combinator threads the full [`Ctx`], not just the IR backend:
//! the closures these wrap invoke `user_fn`, which needs both the IR
//! backend and the AD engine.

use vcall_backend::RecordScope;
use vcall_types::{InstanceId, IrHandle};

use crate::{Ctx, Result};

/// Push `mask` onto the mask stack, run `f`, then pop — regardless of
/// whether `f` succeeded.
pub fn with_mask<R>(ctx: &mut Ctx<'_>, mask: IrHandle, f: impl FnOnce(&mut Ctx<'_>) -> Result<R>) -> Result<R> {
    ctx.ir.mask_push(mask);
    let result = f(ctx);
    ctx.ir.mask_pop();
    result
}

/// Push `(value, per_lane)` onto the self stack, run `f`, then pop.
pub fn with_self<R>(ctx: &mut Ctx<'_>, value: InstanceId, per_lane: IrHandle, f: impl FnOnce(&mut Ctx<'_>) -> Result<R>) -> Result<R> {
    ctx.ir.set_self(value, per_lane);
    let result = f(ctx);
    ctx.ir.pop_self();
    result
}

/// Open a recording scope, run `f`, then close it. `f` decides whether
/// the region is committed or discarded by returning the `cleanup` flag
/// alongside its result; on `Err`, the region is always discarded.
pub fn with_record_scope<R>(ctx: &mut Ctx<'_>, f: impl FnOnce(&mut Ctx<'_>, RecordScope) -> Result<(R, bool)>) -> Result<R> {
    let scope = ctx.ir.record_begin();
    match f(ctx, scope) {
        Ok((value, cleanup)) => {
            ctx.ir.record_end(scope, cleanup);
            Ok(value)
        }
        Err(err) => {
            ctx.ir.record_end(scope, true);
            Err(err)
        }
    }
}
