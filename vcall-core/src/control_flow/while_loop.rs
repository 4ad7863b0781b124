//! The symbolic while-loop: pytree-traversed state, a `cond`
//! callable, a `body` callable, recorded once as a single loop construct.

use alloc::string::String;
use alloc::vec::Vec;
use vcall_types::{AdHandle, Size, VarType};

use crate::error::{Bug, BugVariant, DispatchError};
use crate::pytree::{self, PyTree};
use crate::{Ctx, Result, RvVec};

/// Whether a while-loop runs as a real host-side loop or is recorded
/// symbolically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Pick scalar if `cond`'s first evaluation is a literal, symbolic
    /// otherwise.
    Auto,
    /// Actually repeat: call `cond`/`body` host-side until `cond` is
    /// false, mutating `state` in place after each iteration.
    Scalar,
    /// Record `cond` and `body` once each, into their own checkpointed
    /// regions, and emit a single loop construct.
    Symbolic,
}

/// Run a symbolic (or scalar) while-loop over `state`.
pub fn while_loop<S: PyTree>(
    ctx: &mut Ctx<'_>,
    state: &mut S,
    labels: Option<&[&str]>,
    mode: LoopMode,
    mut cond_fn: impl FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
    mut body_fn: impl FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
) -> Result<()> {
    let entry = pytree::flatten(state, labels)?;
    let effective = match mode {
        LoopMode::Auto => {
            let args: Vec<AdHandle> = entry.iter().map(|(_, h)| *h).collect();
            let mut probe = RvVec::new();
            cond_fn(ctx, &args, &mut probe)?;
            let is_literal = probe.first().is_some_and(|h| ctx.ir.state(h.ir()) == vcall_types::HandleState::Literal);
            if is_literal {
                LoopMode::Scalar
            } else {
                LoopMode::Symbolic
            }
        }
        other => other,
    };

    match effective {
        LoopMode::Scalar => run_scalar(ctx, state, labels, &mut cond_fn, &mut body_fn),
        _ => run_symbolic(ctx, state, labels, &entry, &mut cond_fn, &mut body_fn),
    }
}

fn run_scalar<S: PyTree>(
    ctx: &mut Ctx<'_>,
    state: &mut S,
    labels: Option<&[&str]>,
    cond_fn: &mut dyn FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
    body_fn: &mut dyn FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
) -> Result<()> {
    loop {
        let leaves = pytree::flatten(state, labels)?;
        let args: Vec<AdHandle> = leaves.iter().map(|(_, h)| *h).collect();

        let mut cond_rv = RvVec::new();
        cond_fn(ctx, &args, &mut cond_rv)?;
        let Some(cond_handle) = cond_rv.first() else {
            return Err(Bug::new(BugVariant::LeafCountMismatch).with_message("while-loop cond returned no value").into());
        };
        if ctx.ir.read_literal(cond_handle.ir()) == 0 {
            return Ok(());
        }

        let mut body_rv = RvVec::new();
        body_fn(ctx, &args, &mut body_rv)?;
        let new_values: Vec<AdHandle> = body_rv.into_iter().collect();
        pytree::write_back(state, labels, &new_values)?;
    }
}

#[allow(clippy::too_many_arguments)]
fn run_symbolic<S: PyTree>(
    ctx: &mut Ctx<'_>,
    state: &mut S,
    labels: Option<&[&str]>,
    entry: &[(String, AdHandle)],
    cond_fn: &mut dyn FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
    body_fn: &mut dyn FnMut(&mut Ctx<'_>, &[AdHandle], &mut RvVec) -> Result<()>,
) -> Result<()> {
    let names: Vec<&str> = entry.iter().map(|(n, _)| n.as_str()).collect();
    let types: Vec<VarType> = entry.iter().map(|(_, h)| ctx.ir.var_type(h.ir())).collect();
    let sizes: Vec<Size> = entry.iter().map(|(_, h)| ctx.ir.size(h.ir())).collect();
    let state_in: Vec<AdHandle> = entry.iter().map(|(_, h)| *h).collect();

    let scope = ctx.ir.record_begin();

    let cond_start = ctx.ir.record_checkpoint();
    let mut cond_rv = RvVec::new();
    let cond_result = cond_fn(ctx, &state_in, &mut cond_rv);
    let cond_end = ctx.ir.record_checkpoint();
    if let Err(err) = cond_result {
        ctx.ir.record_end(scope, true);
        return Err(err);
    }
    let Some(cond_handle) = cond_rv.first().copied() else {
        ctx.ir.record_end(scope, true);
        return Err(Bug::new(BugVariant::LeafCountMismatch).with_message("while-loop cond returned no value").into());
    };

    let body_start = ctx.ir.record_checkpoint();
    let mut body_rv = RvVec::new();
    let body_result = body_fn(ctx, &state_in, &mut body_rv);
    let body_end = ctx.ir.record_checkpoint();
    if let Err(err) = body_result {
        ctx.ir.record_end(scope, true);
        return Err(err);
    }

    if let Err(err) = validate_body_shape(ctx, &names, &types, &sizes, &body_rv) {
        ctx.ir.record_end(scope, true);
        return Err(err);
    }

    ctx.ir.record_end(scope, false);

    let state_in_ir: Vec<_> = state_in.iter().map(|h| h.ir()).collect();
    let body_out_ir: Vec<_> = body_rv.iter().map(|h| h.ir()).collect();
    let emitted = ctx.ir.emit_loop(cond_handle.ir(), &state_in_ir, &body_out_ir, (cond_start, cond_end, body_start, body_end));

    let new_values: Vec<AdHandle> = emitted.into_iter().map(AdHandle::from_ir).collect();
    pytree::write_back(state, labels, &new_values)
}

fn validate_body_shape(ctx: &Ctx<'_>, names: &[&str], types: &[VarType], sizes: &[Size], body_rv: &[AdHandle]) -> Result<()> {
    if body_rv.len() != names.len() {
        return Err(DispatchError::LoopStateChanged {
            path: String::from("<state>"),
            reason: alloc::format!("body returned {} leaves, expected {}", body_rv.len(), names.len()),
        });
    }

    for (slot, handle) in body_rv.iter().enumerate() {
        let found_ty = ctx.ir.var_type(handle.ir());
        if found_ty != types[slot] {
            return Err(DispatchError::LoopStateChanged {
                path: String::from(names[slot]),
                reason: alloc::format!("type changed from {:?} to {found_ty:?}", types[slot]),
            });
        }

        let found_size = ctx.ir.size(handle.ir());
        let grew_from_scalar = sizes[slot].is_scalar() && !found_size.is_scalar();
        if found_size != sizes[slot] && !grew_from_scalar {
            return Err(DispatchError::LoopSizeConflict {
                path: String::from(names[slot]),
                from: sizes[slot],
                to: found_size,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_mode_variant_exists() {
        assert_eq!(LoopMode::Scalar, LoopMode::Scalar);
    }
}
