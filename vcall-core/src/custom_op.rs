//! The AD hook: wraps a recorded/evaluated/gotten call as a single node
//! in the AD graph.

use alloc::string::String;
use alloc::vec::Vec;
use smallvec::SmallVec;
use vcall_backend::{AdEngine, Backend, CustomOp, IrBackend, TraversalFlags, TraversalMode};
use vcall_types::{AdHandle, IrHandle};

use crate::dispatcher::{CallRequest, Dispatcher};
use crate::{BoxedUserFn, Ctx, Result, RvVec, INLINE_RETURNS};

/// A single differentiable indirect call, registered with the AD graph
/// via `AdEngine::ad_custom_op`.
///
/// Owns `user_fn` from the moment [`crate::dispatcher::Dispatcher::call`]
/// constructs it until this struct is dropped — which happens when the
/// AD graph drops the op, the same lifetime a `payload`/`cleanup_fn`
/// pair would have under manual reference counting.
pub struct DispatchOp {
    backend: Backend,
    domain: Option<String>,
    name: String,
    callable_count: u32,
    /// The original call's per-lane callable selector and active mask,
    /// kept so `forward`/`backward` re-enter the dispatcher against the
    /// same lanes and callables as the call this op replaced — re-using
    /// `instance_index`/`mask` rather than re-deriving them is what lets
    /// the re-entrant call dispatch to exactly the callables the forward
    /// pass touched.
    instance_index: IrHandle,
    mask: IrHandle,
    user_fn: BoxedUserFn,
    /// The call's original, non-differentiated arguments, kept so
    /// forward/backward can re-supply them alongside the appended
    /// tangent/cotangent arguments.
    saved_args: SmallVec<[AdHandle; INLINE_RETURNS]>,
    input_ad_ids: SmallVec<[u32; INLINE_RETURNS]>,
    output_ad_ids: SmallVec<[u32; INLINE_RETURNS]>,
}

impl DispatchOp {
    /// Construct a new op. Saved arguments and AD id maps are filled in
    /// by [`Self::bind`] once `AdEngine::ad_custom_op` has assigned
    /// output AD ids, since the op must exist before it can be
    /// registered.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Backend,
        domain: Option<String>,
        name: String,
        callable_count: u32,
        instance_index: IrHandle,
        mask: IrHandle,
        user_fn: BoxedUserFn,
    ) -> Self {
        Self {
            backend,
            domain,
            name,
            callable_count,
            instance_index,
            mask,
            user_fn,
            saved_args: SmallVec::new(),
            input_ad_ids: SmallVec::new(),
            output_ad_ids: SmallVec::new(),
        }
    }

    /// Record the saved arguments and the AD ids this op's inputs/outputs
    /// were assigned, for use by `forward`/`backward`.
    pub fn bind(&mut self, saved_args: &[AdHandle], input_ad_ids: &[u32], output_ad_ids: &[u32]) {
        self.saved_args = saved_args.iter().copied().collect();
        self.input_ad_ids = input_ad_ids.iter().copied().collect();
        self.output_ad_ids = output_ad_ids.iter().copied().collect();
    }
}

impl CustomOp for DispatchOp {
    /// Forward mode: concatenate the saved
    /// arguments with `grad(input_ad_ids)`, re-enter the dispatcher with
    /// a callback that reassigns input AD tags, accumulates incoming
    /// tangents, and emits `grad(rv_j)` as the new return values.
    fn forward(&mut self, ir: &mut dyn IrBackend, ad: &mut dyn AdEngine) {
        let tangents: Vec<AdHandle> = self.input_ad_ids.iter().map(|&id| AdHandle::from_ir(ad.ad_grad(id))).collect();
        let mut args: Vec<AdHandle> = self.saved_args.to_vec();
        args.extend(tangents);

        let req = CallRequest {
            backend: self.backend,
            domain: self.domain.as_deref(),
            callable_count: if self.domain.is_none() { Some(self.callable_count) } else { None },
            name: &self.name,
            is_getter: false,
            instance_index: self.instance_index,
            mask: self.mask,
            args: &args,
            ad_enabled: false,
            symbolic_calls: true,
            symbolic_active: true,
        };
        let mut callback = Reentrant { inner: &mut self.user_fn };

        let mut ctx = Ctx { ir, ad };
        let outcome = Dispatcher::dispatch(&mut ctx, req, &mut callback);
        Self::accumulate(&mut ctx, outcome, &self.output_ad_ids, TraversalMode::Forward);
    }

    /// Backward mode: append `grad(output_ad_ids)`
    /// to the argument list, re-enter the dispatcher, and accumulate the
    /// returned cotangents onto the input AD nodes. An isolation boundary
    /// prevents the nested traversal from escaping into the enclosing
    /// graph.
    fn backward(&mut self, ir: &mut dyn IrBackend, ad: &mut dyn AdEngine) {
        let cotangents: Vec<AdHandle> = self.output_ad_ids.iter().map(|&id| AdHandle::from_ir(ad.ad_grad(id))).collect();
        let mut args: Vec<AdHandle> = self.saved_args.to_vec();
        args.extend(cotangents);

        let req = CallRequest {
            backend: self.backend,
            domain: self.domain.as_deref(),
            callable_count: if self.domain.is_none() { Some(self.callable_count) } else { None },
            name: &self.name,
            is_getter: false,
            instance_index: self.instance_index,
            mask: self.mask,
            args: &args,
            ad_enabled: false,
            symbolic_calls: true,
            symbolic_active: true,
        };
        let mut callback = Reentrant { inner: &mut self.user_fn };

        let guard = ad.isolate();
        let mut ctx = Ctx { ir, ad };
        let outcome = Dispatcher::dispatch(&mut ctx, req, &mut callback);
        guard.release();
        Self::accumulate(&mut ctx, outcome, &self.input_ad_ids, TraversalMode::Backward);
    }
}

impl DispatchOp {
    fn accumulate(ctx: &mut Ctx<'_>, outcome: Result<RvVec>, targets: &[u32], mode: TraversalMode) {
        match outcome {
            Ok(rv) => {
                for (id, handle) in targets.iter().zip(rv.iter()) {
                    if *id != 0 {
                        ctx.ad.ad_accum_grad(*id, handle.ir());
                        ctx.ad.ad_enqueue(*id);
                    }
                }
                ctx.ad.ad_traverse(mode, TraversalFlags::NONE);
            }
            Err(_err) => {
                #[cfg(feature = "std")]
                tracing::error!(error = %_err, mode = ?mode, "AD re-entry failed");
            }
        }
    }
}

/// Adapts a borrowed `&mut BoxedUserFn` so it can be handed to
/// [`Dispatcher::call`], which takes ownership of its callable argument.
/// The adapter forwards to the real `user_fn`, which remains owned by
/// the enclosing [`DispatchOp`] across the AD node's whole lifetime —
/// `forward`/`backward` may each run more than once during a traversal.
struct Reentrant<'a> {
    inner: &'a mut BoxedUserFn,
}

impl<'a> crate::UserFn for Reentrant<'a> {
    fn call(&mut self, ctx: &mut Ctx<'_>, instance: crate::InstancePtr, args: &[AdHandle], rv: &mut RvVec) -> Result<()> {
        self.inner.call(ctx, instance, args, rv)
    }
}
