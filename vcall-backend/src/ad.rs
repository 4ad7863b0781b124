use crate::ir::IrBackend;
use vcall_types::{AdHandle, IrHandle};

/// Which direction of automatic differentiation a traversal performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraversalMode {
    /// Propagate tangents from inputs to outputs.
    Forward,
    /// Propagate cotangents from outputs to inputs.
    Backward,
}

/// Flags threaded through [`AdEngine::ad_traverse`]; kept opaque to the
/// dispatcher beyond construction, since only the AD engine interprets
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraversalFlags(pub u32);

impl TraversalFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
}

/// A scoped guard preventing a nested backward traversal from escaping
/// into the enclosing AD graph. Dropping the guard lifts the boundary.
pub trait IsolationGuard {
    /// Lift the isolation boundary. Called automatically on drop by
    /// conforming implementations; exposed explicitly so callers can
    /// assert ordering in tests. Takes `self: Box<Self>` rather than
    /// `self` so the method stays callable through the `Box<dyn
    /// IsolationGuard>` [`AdEngine::isolate`] returns — a plain by-value
    /// `self` receiver would make this trait object-unsafe.
    fn release(self: alloc::boxed::Box<Self>);
}

/// A single CustomOp registered with the AD graph. The
/// dispatcher constructs one of these per differentiable indirect call
/// and hands it to [`AdEngine::ad_custom_op`]; the engine owns it from
/// that point and invokes its forward/backward callbacks during
/// traversal.
pub trait CustomOp {
    /// Re-enter the dispatcher to propagate tangents for `input_ad_ids`,
    /// accumulating results onto this op's output AD nodes. Takes both
    /// collaborators explicitly (rather than just the AD engine) because
    /// re-entering the dispatcher needs the IR backend too; there is no
    /// implicit global the op can reach it through.
    fn forward(&mut self, ir: &mut dyn IrBackend, ad: &mut dyn AdEngine);

    /// Re-enter the dispatcher to propagate cotangents for
    /// `output_ad_ids`, accumulating results onto this op's input AD
    /// nodes.
    fn backward(&mut self, ir: &mut dyn IrBackend, ad: &mut dyn AdEngine);
}

/// The AD engine surface the dispatcher is written against.
pub trait AdEngine {
    /// Allocate a fresh AD-graph node for a value of the given IR handle.
    fn ad_var_new(&mut self, ir: IrHandle) -> AdHandle;

    /// Increment an AD node's reference count.
    fn ad_var_inc_ref(&mut self, handle: AdHandle);

    /// Decrement an AD node's reference count.
    fn ad_var_dec_ref(&mut self, handle: AdHandle);

    /// Copy an AD-tracked value, producing an independent node.
    fn ad_var_copy(&mut self, handle: AdHandle) -> AdHandle;

    /// Gather AD-tracked lanes by permutation, mirroring
    /// [`crate::IrBackend::gather`] at the AD-graph level.
    fn ad_var_gather(&mut self, source: AdHandle, permutation: &[u32], active: IrHandle) -> AdHandle;

    /// Scatter AD-tracked lanes by permutation, mirroring
    /// [`crate::IrBackend::scatter`] at the AD-graph level.
    fn ad_var_scatter(
        &mut self,
        dest: AdHandle,
        source: AdHandle,
        permutation: &[u32],
        active: IrHandle,
    ) -> AdHandle;

    /// The gradient (tangent or cotangent, depending on the active
    /// traversal) currently accumulated at `id`, or a zero handle if
    /// none has arrived yet.
    fn ad_grad(&self, id: u32) -> IrHandle;

    /// Accumulate `value` onto the gradient slot at `id`.
    fn ad_accum_grad(&mut self, id: u32, value: IrHandle);

    /// Enqueue `id` for traversal.
    fn ad_enqueue(&mut self, id: u32);

    /// Run a forward or backward pass over the currently enqueued nodes.
    fn ad_traverse(&mut self, mode: TraversalMode, flags: TraversalFlags);

    /// Register `op` as a node in the AD graph, wiring `inputs` and
    /// `outputs`. Returns `true` if the op was attached, `false` if the
    /// engine determined attachment was unnecessary (no differentiable
    /// reachability) — in which case the dispatcher relinquishes
    /// ownership of `op` back to the caller rather than leaking it into
    /// the graph.
    fn ad_custom_op(&mut self, op: alloc::boxed::Box<dyn CustomOp>, inputs: &[AdHandle], outputs: &[AdHandle]) -> bool;

    /// Begin an isolation boundary around a nested traversal.
    fn isolate(&mut self) -> alloc::boxed::Box<dyn IsolationGuard>;

    /// Record that `dependency` was touched as an implicit (side-effect)
    /// dependency of the node currently being recorded.
    fn check_implicit(&mut self, dependency: AdHandle);
}
