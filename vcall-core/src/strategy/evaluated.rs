//! The evaluated strategy: bucketize lanes by callable,
//! evaluate one materialized kernel per bucket, scatter results back.

use alloc::vec::Vec;
use smallvec::SmallVec;
use vcall_backend::Bucket;
use vcall_types::{AdHandle, InstanceId, IrHandle, Size, VarType};

use crate::dispatcher::CallRequest;
use crate::error::DispatchError;
use crate::{Ctx, InstancePtr, Result, RvVec, UserFn, INLINE_RETURNS};

use super::{check_rv, require_shape, StrategyOutput};

/// Run the evaluated strategy.
#[cfg_attr(feature = "std", tracing::instrument(level = "trace", skip(ctx, req, user_fn)))]
pub fn run(ctx: &mut Ctx<'_>, req: &CallRequest<'_>, _callable_count: u32, user_fn: &mut dyn UserFn) -> Result<StrategyOutput> {
    // Step 1: schedule instance_index and every arg for evaluation.
    ctx.ir.schedule(req.instance_index);
    for arg in req.args {
        ctx.ir.schedule(arg.ir());
    }
    ctx.ir.eval();

    // Step 2: bucketize by callable id.
    let buckets = ctx.ir.call_reduce(req.backend, req.domain, req.instance_index)?;

    let mut shape = None;
    let mut rv: SmallVec<[Option<IrHandle>; INLINE_RETURNS]> = SmallVec::new();
    let mut rv_ad: SmallVec<[bool; INLINE_RETURNS]> = SmallVec::new();
    let mut prev_wavefront: Option<usize> = None;

    for bucket in &buckets {
        if bucket.permutation.is_empty() {
            continue;
        }

        let ptr = resolve_pointer(ctx, req, bucket.id)?;
        let wavefront = bucket.permutation.len();

        if prev_wavefront == Some(wavefront) {
            ctx.ir.eval();
        }
        prev_wavefront = Some(wavefront);

        run_bucket(ctx, req, bucket, ptr, wavefront, user_fn, &mut shape, &mut rv, &mut rv_ad)?;
    }

    let shape = require_shape(shape)?;
    let size = ctx.ir.size(req.instance_index);
    let rv: RvVec = rv
        .into_iter()
        .enumerate()
        .map(|(slot, h)| h.unwrap_or_else(|| zero_of(ctx, shape_type(&shape, slot), size)))
        .map(AdHandle::from_ir)
        .collect();

    // Step 4: schedule every entry of rv for evaluation.
    for handle in &rv {
        ctx.ir.schedule(handle.ir());
    }

    Ok(StrategyOutput {
        rv: rv.into_iter().map(|h| h.ir()).collect(),
        differentiable: rv_ad,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_bucket(
    ctx: &mut Ctx<'_>,
    req: &CallRequest<'_>,
    bucket: &Bucket,
    ptr: InstancePtr,
    wavefront: usize,
    user_fn: &mut dyn UserFn,
    shape: &mut Option<super::ReturnShape>,
    rv: &mut SmallVec<[Option<IrHandle>; INLINE_RETURNS]>,
    rv_ad: &mut SmallVec<[bool; INLINE_RETURNS]>,
) -> Result<()> {
    let bucket_size = Size::new(wavefront as u32);
    let active = ctx.ir.mask_default(bucket_size);

    let gathered_args: Vec<AdHandle> = req
        .args
        .iter()
        .map(|a| a.with_ir(ctx.ir.gather(a.ir(), &bucket.permutation, active)))
        .collect();
    let per_lane = ctx.ir.gather(req.instance_index, &bucket.permutation, active);

    ctx.ir.mask_push(active);
    ctx.ir.set_self(bucket.id, per_lane);
    let mut rv_i = RvVec::new();
    let call_result = user_fn.call(ctx, ptr, &gathered_args, &mut rv_i);
    ctx.ir.pop_self();
    ctx.ir.mask_pop();
    call_result?;

    check_rv(&*ctx.ir, bucket.id, shape, &rv_i)?;

    if rv.is_empty() {
        rv.resize(rv_i.len(), None);
        rv_ad.resize(rv_i.len(), false);
    }

    for (slot, handle) in rv_i.iter().enumerate() {
        rv_ad[slot] = rv_ad[slot] || handle.is_differentiable();
        let dest = match rv[slot] {
            Some(existing) => existing,
            None => zero_of(ctx, ctx.ir.var_type(handle.ir()), ctx.ir.size(req.instance_index)),
        };
        rv[slot] = Some(ctx.ir.scatter(dest, handle.ir(), &bucket.permutation, active));
    }

    Ok(())
}

fn resolve_pointer(ctx: &Ctx<'_>, req: &CallRequest<'_>, id: InstanceId) -> Result<InstancePtr> {
    match req.domain {
        Some(domain) => {
            let ptr = ctx
                .ir
                .registry_ptr(req.backend, domain, id)
                .and_then(|p| core::ptr::NonNull::new(p as *mut ()));
            ptr.map(Some).ok_or(DispatchError::RegistryMiss { callable: id.raw() })
        }
        None => Ok(core::ptr::NonNull::new(id.raw() as *mut ())),
    }
}

fn shape_type(shape: &Option<super::ReturnShape>, slot: usize) -> VarType {
    shape.as_ref().and_then(|s| s.type_at(slot)).unwrap_or(VarType::I32)
}

fn zero_of(ctx: &mut Ctx<'_>, ty: VarType, size: Size) -> IrHandle {
    let zero = ctx.ir.literal(ty, 0);
    if size.is_scalar() {
        zero
    } else {
        let mask = ctx.ir.mask_default(size);
        ctx.ir.gather(zero, &alloc::vec![0u32; size.get() as usize], mask)
    }
}
