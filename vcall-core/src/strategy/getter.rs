//! The getter strategy: applies when every callable returns
//! only a scalar literal; compiles the call into a single gather from a
//! packed literal/evaluated table.

use alloc::vec::Vec;
use vcall_backend::AggregateEntry;
use vcall_types::{AdHandle, HandleState, InstanceId, IrHandle, VarType};

use crate::dispatcher::CallRequest;
use crate::error::DispatchError;
use crate::stacks::with_record_scope;
use crate::{Ctx, InstancePtr, Result, RvVec, UserFn};

use super::{check_rv, require_shape, StrategyOutput};

/// Run the getter strategy.
#[cfg_attr(feature = "std", tracing::instrument(level = "trace", skip(ctx, req, user_fn)))]
pub fn run(ctx: &mut Ctx<'_>, req: &CallRequest<'_>, callable_count: u32, user_fn: &mut dyn UserFn) -> Result<StrategyOutput> {
    let mut shape = None;
    // Slot 0 is the sentinel for instance id 0.
    let mut entries: Vec<Option<AggregateEntry>> = alloc::vec![None; callable_count as usize + 1];
    // Handles an `AggregateEntry::Evaluated` borrows, kept alive until `aggregate` has copied their data.
    let mut keep_alive: Vec<IrHandle> = Vec::new();
    let mut differentiable = false;

    for callable in InstanceId::range(callable_count) {
        let Some(ptr) = resolve_pointer(ctx, req, callable) else {
            continue;
        };

        let entry = with_record_scope(ctx, |ctx, _scope| {
            let mut rv_i = RvVec::new();
            let call_result = user_fn.call(ctx, Some(ptr), req.args, &mut rv_i);
            call_result?;
            check_rv(&*ctx.ir, callable, &mut shape, &rv_i)?;

            if rv_i.len() != 1 {
                return Err(DispatchError::ReturnArityMismatch {
                    callable: callable.raw(),
                    expected: 1,
                    found: rv_i.len(),
                });
            }
            let handle = rv_i[0];
            if !ctx.ir.size(handle.ir()).is_scalar() {
                return Err(DispatchError::ReturnNotScalar { callable: callable.raw() });
            }

            let entry = classify(ctx, handle.ir());
            // Must happen before the scope closes below, which discards
            // everything recorded in it — an `Evaluated` handle's node
            // would otherwise be freed before `keep_alive` sees it.
            if let AggregateEntry::Evaluated { handle } = entry {
                ctx.ir.inc_ref(handle);
                keep_alive.push(handle);
            }
            Ok(((entry, handle.is_differentiable()), true))
        })?;

        differentiable = differentiable || entry.1;
        entries[callable.raw() as usize] = Some(entry.0);
    }

    let shape = require_shape(shape)?;
    let out_ty = shape.type_at(0).unwrap_or(VarType::I32);
    // Unfilled slots are either the id-0 sentinel or an unregistered
    // callable; both are masked out by `select_mask`/`nonzero` below, so
    // a placeholder zero literal is never actually observed.
    let dense_entries: Vec<AggregateEntry> = entries.into_iter().map(|e| e.unwrap_or(AggregateEntry::Literal { bits: 0 })).collect();

    let result = if let Some(shared) = shortcut(&dense_entries, ctx, out_ty) {
        // `shared` may itself be one of the `keep_alive` handles (the
        // `Evaluated` case): release every protective ref except the one
        // that now backs the returned handle, so the caller ends up owning
        // exactly one reference to it.
        let mut kept = false;
        for handle in &keep_alive {
            if *handle == shared && !kept {
                kept = true;
                continue;
            }
            ctx.ir.dec_ref(*handle);
        }
        shared
    } else {
        let buffer = ctx.ir.aggregate(req.backend, &dense_entries);
        for handle in &keep_alive {
            ctx.ir.dec_ref(*handle);
        }

        let zero = ctx.ir.literal(ctx.ir.var_type(req.instance_index), 0);
        let nonzero = ctx.ir.neq(req.instance_index, zero);
        let select_mask = ctx.ir.and(req.mask, nonzero);
        ctx.ir.gather_dynamic(buffer, req.instance_index, select_mask)
    };

    Ok(StrategyOutput {
        rv: alloc::vec![result],
        differentiable: alloc::vec![differentiable].into(),
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

fn classify(ctx: &Ctx<'_>, handle: IrHandle) -> AggregateEntry {
    match ctx.ir.state(handle) {
        HandleState::Literal => AggregateEntry::Literal {
            bits: ctx.ir.read_literal(handle),
        },
        _ => AggregateEntry::Evaluated { handle },
    }
}

/// If every callable produced the exact same output — whether that's one
/// literal's bits or one already-evaluated handle — skip the aggregate/gather
/// pair entirely and hand back that single value directly. `IrHandle` is a
/// plain `Copy`/`Eq` id, so comparing `Evaluated` entries for identity costs
/// nothing and needs no device read.
fn shortcut(entries: &[AggregateEntry], ctx: &mut Ctx<'_>, out_ty: VarType) -> Option<IrHandle> {
    let mut iter = entries.iter().skip(1);
    let first = *iter.next()?;
    if !iter.all(|e| *e == first) {
        return None;
    }
    match first {
        AggregateEntry::Literal { bits } => Some(ctx.ir.literal(out_ty, bits)),
        AggregateEntry::Evaluated { handle } => Some(handle),
    }
}

