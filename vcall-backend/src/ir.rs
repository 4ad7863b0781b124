use crate::error::BackendError;
use vcall_types::{Backend, HandleState, InstanceId, IrHandle, Size, VarType};

/// A batched copy that packs per-callable getter outputs into a
/// contiguous, gather-indexable buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateEntry {
    /// Slot `j` is a compile-time literal; `bits` holds its raw
    /// representation reinterpreted as `u64` (narrower types are
    /// zero-extended).
    Literal {
        /// Raw literal bits.
        bits: u64,
    },
    /// Slot `j` is backed by already-evaluated device memory; `handle` must
    /// be kept alive (ref-counted by the caller) until the aggregation
    /// operation that reads it completes.
    Evaluated {
        /// The handle whose device data is copied into the slot.
        handle: IrHandle,
    },
}

/// One bucket produced by [`IrBackend::call_reduce`]: all lanes sharing a
/// callable id, plus the permutation that recovers their original
/// positions.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// The callable id every lane in this bucket shares. Never
    /// [`InstanceId::is_null`].
    pub id: InstanceId,
    /// `permutation[k]` is the original lane index of the bucket's `k`-th
    /// position. `permutation.len()` is the bucket's wavefront size.
    pub permutation: alloc::vec::Vec<u32>,
}

/// The result of [`IrBackend::call_reduce`]: one [`Bucket`] per distinct
/// non-null callable id present in `instance_index`, ordered by id.
pub type CallBuckets = alloc::vec::Vec<Bucket>;

/// A handle returned by [`IrBackend::record_checkpoint`]; opaque to the
/// dispatcher, replayed only via [`IrBackend::record_end`] or rewound via
/// the recording strategy's own checkpoint-and-rewind discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCheckpoint(pub u64);

/// A handle identifying a recording region opened by
/// [`IrBackend::record_begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordScope(pub u64);

/// The IR backend surface the dispatcher is written against. Every method here names one bullet of that list.
///
/// This crate ships no implementation; `vcall-core`'s `test-helpers`
/// feature carries an in-memory reference implementation used only by
/// this workspace's own tests.
pub trait IrBackend {
    // -- variable ops ----------------------------------------------------

    /// Create a literal node from raw bits, with a logical size of 1.
    fn literal(&mut self, ty: VarType, bits: u64) -> IrHandle;

    /// Create a `u32` literal; a convenience over [`Self::literal`] for
    /// the handful of call sites that build index/count constants.
    fn u32(&mut self, value: u32) -> IrHandle;

    /// `lhs != rhs`, element-wise.
    fn neq(&mut self, lhs: IrHandle, rhs: IrHandle) -> IrHandle;

    /// `lhs & rhs`, element-wise, for mask composition.
    fn and(&mut self, lhs: IrHandle, rhs: IrHandle) -> IrHandle;

    /// A literal boolean mask, broadcast over `size`.
    fn bool(&mut self, value: bool, size: Size) -> IrHandle;

    /// Increment the handle's reference count.
    fn inc_ref(&mut self, handle: IrHandle);

    /// Decrement the handle's reference count, freeing the node if it
    /// reaches zero.
    fn dec_ref(&mut self, handle: IrHandle);

    /// The handle's logical size.
    fn size(&self, handle: IrHandle) -> Size;

    /// The handle's value type.
    fn var_type(&self, handle: IrHandle) -> VarType;

    /// The handle's lifecycle state.
    fn state(&self, handle: IrHandle) -> HandleState;

    /// The handle's backend residency (host vs. device).
    fn backend_of(&self, handle: IrHandle) -> Backend;

    /// Read the literal bits of a handle in [`HandleState::Literal`]
    /// state. Backends may assert/panic if called on a non-literal.
    fn read_literal(&self, handle: IrHandle) -> u64;

    /// Map an evaluated handle's device data into host-addressable memory
    /// for the duration the returned guard is held.
    fn mem_map(&self, handle: IrHandle) -> &[u8];

    /// Gather lanes `source[permutation[k]]` for each `k`, applying
    /// `active` as a predicate. `permutation` is a host-known index array —
    /// the shape the evaluated strategy's buckets and the pytree
    /// traversal produce.
    fn gather(&mut self, source: IrHandle, permutation: &[u32], active: IrHandle) -> IrHandle;

    /// Gather lanes `source[index[k]]` for each `k`, where `index` is
    /// itself a per-lane IR value rather than a host-known array —
    /// the getter strategy's final table lookup needs this, since `instance_index`
    /// is a symbolic N-lane variable, not something the dispatcher can
    /// read host-side without forcing an early evaluation.
    fn gather_dynamic(&mut self, source: IrHandle, index: IrHandle, active: IrHandle) -> IrHandle;

    /// Scatter `source[k]` into `dest[permutation[k]]` for each `k`,
    /// applying `active` as a predicate; returns the updated handle.
    fn scatter(
        &mut self,
        dest: IrHandle,
        source: IrHandle,
        permutation: &[u32],
        active: IrHandle,
    ) -> IrHandle;

    /// Mark a handle for evaluation on the next [`Self::eval`].
    fn schedule(&mut self, handle: IrHandle);

    /// Force evaluation of every handle scheduled so far.
    fn eval(&mut self);

    /// `true` if the handle's state is [`HandleState::Dirty`].
    fn is_dirty(&self, handle: IrHandle) -> bool;

    /// `true` if the handle is a literal whose bits are all-zero.
    fn is_zero_literal(&self, handle: IrHandle) -> bool;

    /// Reassign which backend (host/device) new nodes are created on.
    fn set_backend(&mut self, backend: Backend);

    // -- recording ---------------------------------------------------------

    /// Open a new recording region, returning a scope handle.
    fn record_begin(&mut self) -> RecordScope;

    /// Mark the current position within the active recording region.
    fn record_checkpoint(&mut self) -> RecordCheckpoint;

    /// Close the most recently opened recording region. `cleanup = true`
    /// discards everything recorded since [`Self::record_begin`];
    /// `cleanup = false` commits it.
    fn record_end(&mut self, scope: RecordScope, cleanup: bool);

    /// Allocate a fresh scope id without opening a region.
    fn new_scope(&mut self) -> RecordScope;

    /// Make `scope` the active recording destination.
    fn set_scope(&mut self, scope: RecordScope);

    // -- mask stack ----------------------------------------------------

    /// Push a mask frame; it is ANDed into all writes/side effects until
    /// popped.
    fn mask_push(&mut self, mask: IrHandle);

    /// Pop the most recently pushed mask frame.
    fn mask_pop(&mut self);

    /// A literal all-true mask of the given size.
    fn mask_default(&mut self, size: Size) -> IrHandle;

    /// The mask currently in effect for the call being dispatched (before
    /// any strategy-local mask is pushed).
    fn call_mask(&self) -> IrHandle;

    // -- self stack ------------------------------------------------------

    /// The current top of the self stack: `(instance value, per-lane
    /// instance-id variable)`. The second element is `IrHandle::NULL`
    /// when no per-lane variable is in scope.
    fn self_instance(&self) -> (InstanceId, IrHandle);

    /// Push a self frame.
    fn set_self(&mut self, value: InstanceId, per_lane: IrHandle);

    /// Pop the most recently pushed self frame.
    fn pop_self(&mut self);

    // -- call emission -----------------------------------------------------

    /// Wrap `handle` as a call input: an IR sentinel marking that the
    /// value enters the indirect-call region.
    fn call_input(&mut self, handle: IrHandle) -> IrHandle;

    /// Bucketize `instance_index`'s lanes by callable id. `backend`/`domain` select which
    /// registry to validate ids against.
    fn call_reduce(
        &mut self,
        backend: Backend,
        domain: Option<&str>,
        instance_index: IrHandle,
    ) -> Result<CallBuckets, BackendError>;

    /// Emit the single `indirect_call` instruction for the recording
    /// strategy: one fresh output handle per return
    /// slot, in `rv` order.
    #[allow(clippy::too_many_arguments)]
    fn call(
        &mut self,
        name: &str,
        instance_index: IrHandle,
        mask: IrHandle,
        instance_ids: &[InstanceId],
        args: &[IrHandle],
        rv: &[IrHandle],
        checkpoints: &[(RecordCheckpoint, RecordCheckpoint)],
    ) -> alloc::vec::Vec<IrHandle>;

    /// Per-lane select between two instance ids based on a boolean
    /// condition: lane `k` gets `if_true` where `cond[k]` holds, `if_false`
    /// otherwise. The if-statement frontend uses this to build the
    /// synthetic `instance_index` its two-callable recording-strategy
    /// specialization dispatches on.
    fn select_id(&mut self, cond: IrHandle, if_true: u32, if_false: u32) -> IrHandle;

    /// Emit the single loop construct for the symbolic while-loop: one fresh output handle per state leaf, matching
    /// `state_in`'s order, holding the value that leaf carries once the
    /// loop terminates. `checkpoints` bounds the recorded cond and body
    /// regions, in that order.
    fn emit_loop(
        &mut self,
        cond: IrHandle,
        state_in: &[IrHandle],
        body_out: &[IrHandle],
        checkpoints: (RecordCheckpoint, RecordCheckpoint, RecordCheckpoint, RecordCheckpoint),
    ) -> alloc::vec::Vec<IrHandle>;

    // -- memory --------------------------------------------------------

    /// Allocate `bytes` of `kind`-resident memory.
    fn malloc(&mut self, kind: Backend, bytes: usize) -> Result<*mut u8, BackendError>;

    /// Free memory previously returned by [`Self::malloc`].
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior `malloc` on this backend
    /// and not already freed.
    unsafe fn free(&mut self, ptr: *mut u8);

    /// Materialize `entries` into a single contiguous, gather-indexable
    /// buffer handle.
    fn aggregate(&mut self, target: Backend, entries: &[AggregateEntry]) -> IrHandle;

    // -- registry --------------------------------------------------------

    /// Resolve `id` within `domain` to an opaque instance pointer, or
    /// `None` if unregistered.
    fn registry_ptr(&self, backend: Backend, domain: &str, id: InstanceId) -> Option<*const ()>;

    /// The number of ids bound in `domain`'s registry (used when the
    /// caller supplies `domain` instead of an explicit `callable_count`).
    fn registry_id_bound(&self, backend: Backend, domain: &str) -> Result<u32, BackendError>;
}
