//! The recording strategy: emit exactly one indirect-branch
//! instruction covering every reachable callable, by invoking `user_fn`
//! once per callable while redirecting its IR writes into a per-callable
//! checkpoint region.

use alloc::vec::Vec;
use smallvec::SmallVec;
use vcall_backend::RecordCheckpoint;
use vcall_types::{AdHandle, InstanceId, IrHandle, Size};

use crate::dispatcher::CallRequest;
use crate::stacks::{with_mask, with_record_scope};
use crate::{Ctx, InstancePtr, Result, RvVec, UserFn, INLINE_RETURNS};

use super::{check_rv, require_shape, StrategyOutput};

/// Run the recording strategy.
#[cfg_attr(
    feature = "std",
    tracing::instrument(level = "trace", skip(ctx, req, user_fn), fields(callable_count))
)]
pub fn run(ctx: &mut Ctx<'_>, req: &CallRequest<'_>, callable_count: u32, size: Size, user_fn: &mut dyn UserFn) -> Result<StrategyOutput> {
    with_record_scope(ctx, |ctx, _scope| {
        let call_mask = ctx.ir.call_mask();
        let outcome = with_mask(ctx, call_mask, |ctx| record_callables(ctx, req, callable_count, size, user_fn));

        match outcome {
            Ok(output) => Ok((output, false)),
            Err(err) => Err(err),
        }
    })
}

/// Wrap inputs as call inputs, visit every callable recording its
/// region, and fix the return shape.
fn record_callables(
    ctx: &mut Ctx<'_>,
    req: &CallRequest<'_>,
    callable_count: u32,
    _size: Size,
    user_fn: &mut dyn UserFn,
) -> Result<StrategyOutput> {
    let args: Vec<AdHandle> = req.args.iter().map(|a| a.with_ir(ctx.ir.call_input(a.ir()))).collect();

    let mut shape = None;
    let mut active_ids: Vec<InstanceId> = Vec::new();
    let mut rv3: Vec<IrHandle> = Vec::new();
    let mut rv_ad: SmallVec<[bool; INLINE_RETURNS]> = SmallVec::new();
    let mut checkpoints: Vec<(RecordCheckpoint, RecordCheckpoint)> = Vec::with_capacity(callable_count as usize);

    for callable in InstanceId::range(callable_count) {
        let ptr = resolve_pointer(ctx, req, callable);
        let start = ctx.ir.record_checkpoint();

        if let Some(ptr) = ptr {
            let mut rv_i = RvVec::new();
            ctx.ir.set_self(callable, IrHandle::NULL);
            let call_result = user_fn.call(ctx, Some(ptr), &args, &mut rv_i);
            ctx.ir.pop_self();
            call_result?;
            check_rv(&*ctx.ir, callable, &mut shape, &rv_i)?;

            // This callable's body ran against `args`; anything
            // differentiable in there is now an implicit dependency of the
            // region just recorded, whether or not it shows up in `rv_i`.
            for a in args.iter().filter(|a| a.is_differentiable()) {
                ctx.ad.check_implicit(*a);
            }

            if rv_ad.is_empty() {
                rv_ad = rv_i.iter().map(|h| h.is_differentiable()).collect();
            } else {
                for (slot, h) in rv_i.iter().enumerate() {
                    rv_ad[slot] = rv_ad[slot] || h.is_differentiable();
                }
            }

            active_ids.push(callable);
            rv3.extend(rv_i.iter().map(|h| h.ir()));
        }

        let end = ctx.ir.record_checkpoint();
        checkpoints.push((start, end));
    }

    let _shape = require_shape(shape)?;
    let combined_name = combined_name(req);

    let emitted = ctx.ir.call(
        &combined_name,
        req.instance_index,
        req.mask,
        &active_ids,
        &args.iter().map(|a| a.ir()).collect::<Vec<_>>(),
        &rv3,
        &checkpoints,
    );

    Ok(StrategyOutput {
        rv: emitted.into_iter().collect(),
        differentiable: rv_ad,
    })
}

fn resolve_pointer(ctx: &Ctx<'_>, req: &CallRequest<'_>, callable: InstanceId) -> InstancePtr {
    match req.domain {
        Some(domain) => ctx
            .ir
            .registry_ptr(req.backend, domain, callable)
            .and_then(|p| core::ptr::NonNull::new(p as *mut ())),
        None => core::ptr::NonNull::new(callable.raw() as *mut ()),
    }
}

fn combined_name(req: &CallRequest<'_>) -> alloc::string::String {
    match req.domain {
        Some(domain) => alloc::format!("{domain}::{}", req.name),
        None => req.name.into(),
    }
}
