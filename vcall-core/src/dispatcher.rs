//! The dispatcher entry point.

use alloc::string::ToString;
use vcall_backend::Backend;
use vcall_types::{unify_size, AdHandle, Size};

use crate::custom_op::DispatchOp;
use crate::error::DispatchError;
use crate::strategy::{evaluated, getter, recording, StrategyOutput};
use crate::{BoxedUserFn, Ctx, Result, RvVec, UserFn};

/// A fully described indirect-call request. Exactly one of `domain` and `callable_count` must be set.
pub struct CallRequest<'a> {
    /// Which backend (host/device) the call runs on.
    pub backend: Backend,
    /// The registry domain to resolve callable ids through, if any.
    pub domain: Option<&'a str>,
    /// The explicit callable count, if no `domain` is given.
    pub callable_count: Option<u32>,
    /// The call's name, combined with `domain` (if present) to form the
    /// emitted instruction's name.
    pub name: &'a str,
    /// `true` selects the getter strategy unconditionally.
    pub is_getter: bool,
    /// Per-lane callable selector.
    pub instance_index: vcall_types::IrHandle,
    /// Per-lane active mask.
    pub mask: vcall_types::IrHandle,
    /// The call's arguments, broadcast/unified against `instance_index`
    /// and `mask`.
    pub args: &'a [AdHandle],
    /// `true` if AD wrapping should be attempted when any input or
    /// output is differentiable.
    pub ad_enabled: bool,
    /// The process-wide `SymbolicCalls` flag.
    pub symbolic_calls: bool,
    /// The process-wide `Symbolic` flag: is a symbolic region already
    /// active.
    pub symbolic_active: bool,
}

/// What running the degenerate check and (if it didn't apply) a call
/// strategy produced.
enum CoreOutcome {
    /// The degenerate case applied: every return slot is
    /// already a finished, non-differentiable zero literal.
    Degenerate(RvVec),
    /// A strategy ran; the dispatcher still needs to decide whether to
    /// wrap the result in a [`DispatchOp`].
    Strategy(StrategyOutput),
}

/// The symbolic indirect-call dispatcher. Stateless: every method takes
/// the backend/AD context and request explicitly, matching
/// `IrBackend`/`AdEngine` being process-wide collaborators rather than
/// state this type would itself own.
pub struct Dispatcher;

impl Dispatcher {
    /// Dispatch one indirect call.
    ///
    /// Takes `user_fn` by value: on the differentiable path it is moved
    /// into the constructed [`DispatchOp`], which owns it for as long as
    /// the AD graph keeps the op alive; on every other path — including
    /// every error path, via `?` — it is simply dropped when this
    /// function returns, which is how ownership-based cleanup replaces a
    /// manual `cleanup_fn(payload)` callback (see [`crate::UserFn`]).
    #[cfg_attr(
        feature = "std",
        tracing::instrument(level = "debug", skip_all, fields(name = %req.name, is_getter = req.is_getter))
    )]
    pub fn call(ctx: &mut Ctx<'_>, req: CallRequest<'_>, mut user_fn: BoxedUserFn) -> Result<RvVec> {
        let callable_count = Self::resolve_callable_count(ctx, &req)?;
        let size = Self::unify_sizes(ctx, &req)?;

        match Self::run_core(ctx, &req, size, callable_count, user_fn.as_mut())? {
            CoreOutcome::Degenerate(rv) => Ok(rv),
            CoreOutcome::Strategy(output) => Self::wrap_ad(ctx, &req, callable_count, output, user_fn),
        }
    }

    /// The borrowing counterpart of [`Self::call`], used for re-entrant
    /// dispatch from inside [`custom_op::DispatchOp::forward`]/`backward`.
    /// Those callers never need AD wrapping — `req.ad_enabled` is always
    /// `false` for a re-entrant call, since the enclosing AD node is
    /// already handling differentiation — so this never needs ownership
    /// of `user_fn`.
    pub fn dispatch(ctx: &mut Ctx<'_>, req: CallRequest<'_>, user_fn: &mut dyn UserFn) -> Result<RvVec> {
        let callable_count = Self::resolve_callable_count(ctx, &req)?;
        let size = Self::unify_sizes(ctx, &req)?;

        match Self::run_core(ctx, &req, size, callable_count, user_fn)? {
            CoreOutcome::Degenerate(rv) => Ok(rv),
            CoreOutcome::Strategy(output) => Ok(output.rv.into_iter().map(AdHandle::from_ir).collect()),
        }
    }

    fn run_core(
        ctx: &mut Ctx<'_>,
        req: &CallRequest<'_>,
        size: Size,
        callable_count: u32,
        user_fn: &mut dyn UserFn,
    ) -> Result<CoreOutcome> {
        if let Some(rv) = Self::degenerate(ctx, req, size, callable_count, user_fn)? {
            return Ok(CoreOutcome::Degenerate(rv));
        }

        let output = if req.is_getter {
            #[cfg(feature = "std")]
            tracing::debug!(strategy = "getter");
            getter::run(ctx, req, callable_count, user_fn)?
        } else if req.symbolic_calls {
            #[cfg(feature = "std")]
            tracing::debug!(strategy = "recording");
            recording::run(ctx, req, callable_count, size, user_fn)?
        } else if req.symbolic_active {
            return Err(DispatchError::SymbolicModeRequired);
        } else {
            #[cfg(feature = "std")]
            tracing::debug!(strategy = "evaluated");
            evaluated::run(ctx, req, callable_count, user_fn)?
        };

        Ok(CoreOutcome::Strategy(output))
    }

    fn resolve_callable_count(ctx: &Ctx<'_>, req: &CallRequest<'_>) -> Result<u32> {
        match (req.domain, req.callable_count) {
            (Some(_), Some(_)) | (None, None) => Err(DispatchError::ModeConflict),
            (Some(domain), None) => Ok(ctx.ir.registry_id_bound(req.backend, domain)?),
            (None, Some(count)) => Ok(count),
        }
    }

    fn unify_sizes(ctx: &Ctx<'_>, req: &CallRequest<'_>) -> Result<Size> {
        let sizes = core::iter::once(ctx.ir.size(req.instance_index))
            .chain(core::iter::once(ctx.ir.size(req.mask)))
            .chain(req.args.iter().map(|a| ctx.ir.size(a.ir())));
        unify_size(sizes).map_err(|e| DispatchError::ShapeMismatch {
            expected: e.expected,
            found: e.found,
        })
    }

    /// The degenerate case: a null
    /// instance index, zero lanes, a literal-false mask, or zero
    /// callables. Runs `user_fn` once purely to learn the output arity
    /// and types, then discards every value it produced in favor of zero
    /// literals.
    fn degenerate(
        ctx: &mut Ctx<'_>,
        req: &CallRequest<'_>,
        size: Size,
        callable_count: u32,
        user_fn: &mut dyn UserFn,
    ) -> Result<Option<RvVec>> {
        let is_null_index = ctx.ir.is_zero_literal(req.instance_index) && ctx.ir.size(req.instance_index).is_scalar();
        let is_false_mask = ctx.ir.is_zero_literal(req.mask);
        if !(is_null_index || size.is_empty() || is_false_mask || callable_count == 0) {
            return Ok(None);
        }

        let false_mask = ctx.ir.bool(false, size);
        let mut rv = RvVec::new();
        ctx.ir.mask_push(false_mask);
        let result = user_fn.call(ctx, None, req.args, &mut rv);
        ctx.ir.mask_pop();
        result?;

        let zeroed = rv
            .iter()
            .map(|h| {
                let ty = ctx.ir.var_type(h.ir());
                AdHandle::from_ir(ctx.ir.literal(ty, 0))
            })
            .collect();
        Ok(Some(zeroed))
    }

    fn wrap_ad(
        ctx: &mut Ctx<'_>,
        req: &CallRequest<'_>,
        callable_count: u32,
        output: StrategyOutput,
        user_fn: BoxedUserFn,
    ) -> Result<RvVec> {
        let needs_ad = req.ad_enabled
            && (req.args.iter().any(|a| a.is_differentiable()) || output.differentiable.iter().any(|d| *d));

        if !needs_ad {
            return Ok(output.rv.into_iter().map(AdHandle::from_ir).collect());
        }

        let output_ads: alloc::vec::Vec<AdHandle> = output
            .rv
            .iter()
            .zip(output.differentiable.iter())
            .map(|(handle, diff)| {
                if *diff {
                    ctx.ad.ad_var_new(*handle)
                } else {
                    AdHandle::from_ir(*handle)
                }
            })
            .collect();

        let mut op = DispatchOp::new(
            req.backend,
            req.domain.map(ToString::to_string),
            req.name.to_string(),
            callable_count,
            req.instance_index,
            req.mask,
            user_fn,
        );
        let input_ad_ids: alloc::vec::Vec<u32> = req.args.iter().map(|a| a.ad_id()).collect();
        let output_ad_ids: alloc::vec::Vec<u32> = output_ads.iter().map(|a| a.ad_id()).collect();
        op.bind(req.args, &input_ad_ids, &output_ad_ids);
        let attached = ctx.ad.ad_custom_op(alloc::boxed::Box::new(op), req.args, &output_ads);

        if attached {
            Ok(output_ads.into())
        } else {
            Ok(output.rv.into_iter().map(AdHandle::from_ir).collect())
        }
    }
}
