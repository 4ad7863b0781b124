//! The symbolic if-statement: two callables dispatched
//! through the same recording strategy the indirect-call dispatcher
//! uses, picked per lane by the condition.

use alloc::string::String;
use alloc::vec::Vec;
use vcall_backend::Backend;
use vcall_types::{AdHandle, HandleState};

use crate::dispatcher::{CallRequest, Dispatcher};
use crate::error::{Bug, BugVariant, DispatchError};
use crate::pytree::{self, PyTree};
use crate::{BoxedUserFn, Ctx, InstancePtr, Result, RvVec, UserFn};

/// Which branch-selection strategy an if-statement uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfMode {
    /// Pick scalar or symbolic based on the condition's type/size.
    Auto,
    /// Run exactly one branch, chosen host-side from a literal condition.
    Scalar,
    /// Force the recording strategy regardless of the ambient
    /// `SymbolicCalls` flag.
    Symbolic,
    /// Force the evaluated strategy.
    Evaluated,
}

/// Run a symbolic if-statement over `state`.
///
/// `state` is read, flattened to a flat argument list, and (for the
/// scalar path) overwritten in place with the branch's return values;
/// for the symbolic/evaluated paths the branches are dispatched through
/// [`Dispatcher::call`] as a two-callable indirect call, so
/// AD-wrapping and shape/arity checks are the same logic the main
/// indirect-call path uses — not a separate implementation.
///
/// Unlike the host-language model this was distilled from, branches here
/// never share a mutable state object: each receives the same read-only
/// flattened arguments and returns its own new values, so there is
/// nothing to deep-copy between them and no dirty-handle bookkeeping to
/// propagate back out (see "if-statement state handling" in DESIGN.md).
#[allow(clippy::too_many_arguments)]
pub fn if_stmt<S: PyTree>(
    ctx: &mut Ctx<'_>,
    state: &mut S,
    condition: AdHandle,
    mode: IfMode,
    labels: Option<&[&str]>,
    backend: Backend,
    symbolic_active: bool,
    true_fn: BoxedUserFn,
    false_fn: BoxedUserFn,
) -> Result<()> {
    let leaves = pytree::flatten(state, labels)?;
    let args: Vec<AdHandle> = leaves.iter().map(|(_, h)| *h).collect();

    let effective = match mode {
        IfMode::Auto if ctx.ir.size(condition.ir()).is_scalar() && ctx.ir.state(condition.ir()) == HandleState::Literal => IfMode::Scalar,
        IfMode::Auto => IfMode::Symbolic,
        other => other,
    };

    let rv: Vec<AdHandle> = if let IfMode::Scalar = effective {
        let taken = ctx.ir.read_literal(condition.ir()) != 0;
        let mut picked = if taken { true_fn } else { false_fn };
        let mut rv_i = RvVec::new();
        picked.call(ctx, None, &args, &mut rv_i)?;
        rv_i.into_iter().collect()
    } else {
        let instance_index = ctx.ir.select_id(condition.ir(), 1, 2);
        let mask = ctx.ir.call_mask();
        let branch = Branch { true_fn, false_fn };

        let req = CallRequest {
            backend,
            domain: None,
            callable_count: Some(2),
            name: "if_stmt",
            is_getter: false,
            instance_index,
            mask,
            args: &args,
            ad_enabled: true,
            symbolic_calls: matches!(effective, IfMode::Symbolic),
            symbolic_active,
        };

        Dispatcher::call(ctx, req, alloc::boxed::Box::new(branch))
            .map_err(to_shape_mismatch)?
            .into_iter()
            .collect()
    };

    pytree::write_back(state, labels, &rv)
}

/// Dispatches to `true_fn` for callable 1, `false_fn` for callable 2 —
/// the pointer values the no-domain `resolve_pointer` convention
/// produces for a raw two-callable count.
struct Branch {
    true_fn: BoxedUserFn,
    false_fn: BoxedUserFn,
}

impl UserFn for Branch {
    fn call(&mut self, ctx: &mut Ctx<'_>, instance: InstancePtr, args: &[AdHandle], rv: &mut RvVec) -> Result<()> {
        match instance.map(|p| p.as_ptr() as usize) {
            Some(1) | None => self.true_fn.call(ctx, instance, args, rv),
            Some(2) => self.false_fn.call(ctx, instance, args, rv),
            Some(other) => Err(Bug::new(BugVariant::UnbalancedScope)
                .with_message(alloc::format!("if-statement saw unexpected instance pointer {other}"))
                .into()),
        }
    }
}

/// Re-label the generic return-shape mismatches the recording strategy
/// raises as the if-statement's own, more specific error.
fn to_shape_mismatch(err: DispatchError) -> DispatchError {
    match err {
        DispatchError::ReturnArityMismatch { callable, expected, found } => DispatchError::ReturnShapeMismatch {
            path: branch_path(callable),
            reason: alloc::format!("arity {found}, expected {expected}"),
        },
        DispatchError::ReturnTypeMismatch { callable, slot, expected, found } => DispatchError::ReturnShapeMismatch {
            path: alloc::format!("{}[{slot}]", branch_path(callable)),
            reason: alloc::format!("type {found:?}, expected {expected:?}"),
        },
        DispatchError::ReturnBackendMismatch { callable, slot } => DispatchError::ReturnShapeMismatch {
            path: alloc::format!("{}[{slot}]", branch_path(callable)),
            reason: String::from("return backend residency disagreement"),
        },
        other => other,
    }
}

fn branch_path(callable: u32) -> String {
    match callable {
        1 => String::from("<true_fn>"),
        2 => String::from("<false_fn>"),
        other => alloc::format!("<branch {other}>"),
    }
}
