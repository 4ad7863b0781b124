//! An in-memory [`IrBackend`]/[`AdEngine`] pair used by this crate's own
//! tests and available to downstream integration tests, mirroring
//! `fuel-vm`'s `memory_client`/`test-helpers` feature.
//!
//! The real backend this crate is written against defers codegen and
//! memory layout to a JIT this repository does not contain. This reference implementation instead evaluates every IR
//! op the moment it is issued — there is no deferred kernel, so
//! `schedule`/`eval` are bookkeeping no-ops and `record_end(_, cleanup:
//! true)` cannot actually roll back already-computed node data. That is
//! fine for what this module exists to exercise: the dispatcher's
//! strategy selection, shape/arity checks, masking, and AD wiring, none
//! of which depend on deferred evaluation. [`IrBackend::emit_loop`]
//! follows the same logic, which is why the while-loop end-to-end test
//! drives [`crate::control_flow::while_loop::LoopMode::Scalar`] rather
//! than `Symbolic` — a genuine multi-iteration symbolic loop needs a
//! real kernel executor this crate does not provide.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use hashbrown::HashMap;

use vcall_backend::{
    AdEngine, AggregateEntry, Bucket, CallBuckets, CustomOp, IsolationGuard, RecordCheckpoint, RecordScope, TraversalFlags, TraversalMode,
};
use vcall_types::{AdHandle, Backend, HandleState, InstanceId, IrHandle, Size, VarType};

use crate::error::BackendError;

#[derive(Clone)]
struct Node {
    ty: VarType,
    backend: Backend,
    state: HandleState,
    size: Size,
    /// One entry per lane (or exactly one for a broadcasting scalar),
    /// reinterpreted per `ty` (`f64`/`f32` store their IEEE bit
    /// pattern, integers sign/zero-extend into the low bits, `Bool`
    /// stores `0`/`1`).
    data: Vec<u64>,
    refcount: u32,
}

impl Node {
    fn lane(&self, k: usize) -> u64 {
        if self.size.is_scalar() {
            self.data[0]
        } else {
            self.data[k]
        }
    }
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<u32, Node>,
    next_id: u32,
    true_literal: Option<IrHandle>,
    mask_stack: Vec<IrHandle>,
    self_stack: Vec<(InstanceId, IrHandle)>,
    scope_stack: Vec<u64>,
    next_scope: u64,
    next_checkpoint: u64,
    active_backend: Option<Backend>,
    registries: HashMap<String, Vec<*const ()>>,
}

impl Inner {
    fn alloc(&mut self, ty: VarType, backend: Backend, state: HandleState, size: Size, data: Vec<u64>) -> IrHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.nodes.insert(
            id,
            Node {
                ty,
                backend,
                state,
                size,
                data,
                refcount: 1,
            },
        );
        IrHandle::new(id)
    }

    fn node(&self, handle: IrHandle) -> &Node {
        self.nodes.get(&handle.raw()).expect("dangling IrHandle in test backend")
    }
}

/// A cheap-to-clone handle onto a shared, immediately-evaluated node
/// store. Every clone observes the same graph — the same role `Rc`
/// sharing plays for `fuel-vm`'s `MemoryStorage` across a
/// `MemoryClient`.
#[derive(Clone, Default)]
pub struct TestBackend(Rc<RefCell<Inner>>);

impl TestBackend {
    /// A fresh, empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` (1-based) within `domain` to an opaque pointer, growing
    /// the registry as needed. Used by tests exercising the
    /// `domain`-addressed call path instead of raw `callable_count`.
    pub fn register(&self, domain: &str, id: u32, ptr: *const ()) {
        let mut inner = self.0.borrow_mut();
        let slots = inner.registries.entry(String::from(domain)).or_default();
        if slots.len() <= id as usize {
            slots.resize(id as usize + 1, core::ptr::null());
        }
        slots[id as usize] = ptr;
    }

    /// Build an `i64` literal handle directly, bypassing the
    /// `IrBackend::literal` bit-reinterpretation dance — a convenience
    /// for test setup, not part of the dispatcher's own contract.
    pub fn int(&self, value: i64) -> IrHandle {
        self.0.borrow_mut().alloc(VarType::I64, Backend::Host, HandleState::Literal, Size::SCALAR, alloc::vec![value as u64])
    }

    /// Build an `f64` literal handle.
    pub fn float(&self, value: f64) -> IrHandle {
        self.0.borrow_mut().alloc(VarType::F64, Backend::Host, HandleState::Literal, Size::SCALAR, alloc::vec![value.to_bits()])
    }

    /// Build a vector of `i64` literals, one per lane.
    pub fn int_vec(&self, values: &[i64]) -> IrHandle {
        let data = values.iter().map(|v| *v as u64).collect();
        self.0.borrow_mut().alloc(VarType::I64, Backend::Host, HandleState::Literal, Size::new(values.len() as u32), data)
    }

    /// Build a vector of `f64` literals, one per lane.
    pub fn float_vec(&self, values: &[f64]) -> IrHandle {
        let data = values.iter().map(|v| v.to_bits()).collect();
        self.0.borrow_mut().alloc(VarType::F64, Backend::Host, HandleState::Literal, Size::new(values.len() as u32), data)
    }

    /// Build a per-lane boolean mask.
    pub fn bool_vec(&self, values: &[bool]) -> IrHandle {
        let data = values.iter().map(|v| u64::from(*v)).collect();
        self.0.borrow_mut().alloc(VarType::Bool, Backend::Host, HandleState::Literal, Size::new(values.len() as u32), data)
    }

    /// Build an `f64` literal explicitly tagged as resident on `backend`,
    /// for tests exercising backend-mismatch detection — every other
    /// constructor here hardcodes [`Backend::Host`].
    pub fn float_on(&self, value: f64, backend: Backend) -> IrHandle {
        self.0.borrow_mut().alloc(VarType::F64, backend, HandleState::Literal, Size::SCALAR, alloc::vec![value.to_bits()])
    }

    /// Read back an `i64` handle's lanes, for asserting on test output.
    pub fn read_ints(&self, handle: IrHandle) -> Vec<i64> {
        let inner = self.0.borrow();
        let node = inner.node(handle);
        (0..node.size.get().max(1) as usize).map(|k| node.lane(k) as i64).collect()
    }

    /// Read back an `f64` handle's lanes.
    pub fn read_floats(&self, handle: IrHandle) -> Vec<f64> {
        let inner = self.0.borrow();
        let node = inner.node(handle);
        (0..node.size.get().max(1) as usize).map(|k| f64::from_bits(node.lane(k))).collect()
    }

    /// Elementwise arithmetic used by test callables to build
    /// expressions; not part of [`IrBackend`], whose contract
    /// deliberately names only the handful of ops this crate needs to
    /// drive a dispatch — a real backend has many more.
    pub fn binary_op(&self, lhs: IrHandle, rhs: IrHandle, f: impl Fn(f64, f64) -> f64) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (lty, lsize, ldata) = {
            let n = inner.node(lhs);
            (n.ty, n.size, n.data.clone())
        };
        let (rsize, rdata) = {
            let n = inner.node(rhs);
            (n.size, n.data.clone())
        };
        let size = if lsize.is_scalar() { rsize } else { lsize };
        let out: Vec<u64> = (0..size.get().max(1) as usize)
            .map(|k| {
                let a = f64::from_bits(if lsize.is_scalar() { ldata[0] } else { ldata[k] });
                let b = f64::from_bits(if rsize.is_scalar() { rdata[0] } else { rdata[k] });
                f(a, b).to_bits()
            })
            .collect();
        inner.alloc(lty, Backend::Host, HandleState::Literal, size, out)
    }

    /// Elementwise comparison producing a `Bool` handle.
    pub fn compare(&self, lhs: IrHandle, rhs: IrHandle, f: impl Fn(f64, f64) -> bool) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (lsize, ldata) = {
            let n = inner.node(lhs);
            (n.size, n.data.clone())
        };
        let (rsize, rdata) = {
            let n = inner.node(rhs);
            (n.size, n.data.clone())
        };
        let size = if lsize.is_scalar() { rsize } else { lsize };
        let out: Vec<u64> = (0..size.get().max(1) as usize)
            .map(|k| {
                let a = f64::from_bits(if lsize.is_scalar() { ldata[0] } else { ldata[k] });
                let b = f64::from_bits(if rsize.is_scalar() { rdata[0] } else { rdata[k] });
                u64::from(f(a, b))
            })
            .collect();
        inner.alloc(VarType::Bool, Backend::Host, HandleState::Literal, size, out)
    }

    fn ensure_true(&self) -> IrHandle {
        let cached = self.0.borrow().true_literal;
        match cached {
            Some(h) => h,
            None => {
                let h = self.bool_vec(&[true]);
                self.0.borrow_mut().true_literal = Some(h);
                h
            }
        }
    }
}

impl vcall_backend::IrBackend for TestBackend {
    fn literal(&mut self, ty: VarType, bits: u64) -> IrHandle {
        self.0.borrow_mut().alloc(ty, Backend::Host, HandleState::Literal, Size::SCALAR, alloc::vec![bits])
    }

    fn u32(&mut self, value: u32) -> IrHandle {
        self.literal(VarType::U32, value as u64)
    }

    fn neq(&mut self, lhs: IrHandle, rhs: IrHandle) -> IrHandle {
        self.compare(lhs, rhs, |a, b| a != b)
    }

    fn and(&mut self, lhs: IrHandle, rhs: IrHandle) -> IrHandle {
        self.compare(lhs, rhs, |a, b| a != 0.0 && b != 0.0)
    }

    fn bool(&mut self, value: bool, size: Size) -> IrHandle {
        let data = alloc::vec![u64::from(value); size.get().max(1) as usize];
        self.0.borrow_mut().alloc(VarType::Bool, Backend::Host, HandleState::Literal, size, data)
    }

    fn inc_ref(&mut self, handle: IrHandle) {
        if let Some(node) = self.0.borrow_mut().nodes.get_mut(&handle.raw()) {
            node.refcount += 1;
        }
    }

    fn dec_ref(&mut self, handle: IrHandle) {
        let mut inner = self.0.borrow_mut();
        if let Some(node) = inner.nodes.get_mut(&handle.raw()) {
            node.refcount -= 1;
            if node.refcount == 0 {
                inner.nodes.remove(&handle.raw());
            }
        }
    }

    fn size(&self, handle: IrHandle) -> Size {
        if handle.is_null() {
            return Size::new(0);
        }
        self.0.borrow().node(handle).size
    }

    fn var_type(&self, handle: IrHandle) -> VarType {
        self.0.borrow().node(handle).ty
    }

    fn state(&self, handle: IrHandle) -> HandleState {
        self.0.borrow().node(handle).state
    }

    fn backend_of(&self, handle: IrHandle) -> Backend {
        self.0.borrow().node(handle).backend
    }

    fn read_literal(&self, handle: IrHandle) -> u64 {
        self.0.borrow().node(handle).data[0]
    }

    fn mem_map(&self, _handle: IrHandle) -> &[u8] {
        &[]
    }

    fn gather(&mut self, source: IrHandle, permutation: &[u32], active: IrHandle) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (ty, backend, src_data, src_size) = {
            let n = inner.node(source);
            (n.ty, n.backend, n.data.clone(), n.size)
        };
        let active_data = inner.node(active).data.clone();
        let active_size = inner.node(active).size;
        let out: Vec<u64> = permutation
            .iter()
            .enumerate()
            .map(|(k, &p)| {
                let is_active = if active_size.is_scalar() { active_data[0] } else { active_data[k] } != 0;
                if !is_active {
                    0
                } else if src_size.is_scalar() {
                    src_data[0]
                } else {
                    src_data[p as usize]
                }
            })
            .collect();
        inner.alloc(ty, backend, HandleState::Literal, Size::new(permutation.len() as u32), out)
    }

    fn gather_dynamic(&mut self, source: IrHandle, index: IrHandle, active: IrHandle) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (ty, backend, src_data) = {
            let n = inner.node(source);
            (n.ty, n.backend, n.data.clone())
        };
        let (idx_data, idx_size) = {
            let n = inner.node(index);
            (n.data.clone(), n.size)
        };
        let active_data = inner.node(active).data.clone();
        let active_size = inner.node(active).size;
        let lanes = idx_size.get().max(1) as usize;
        let out: Vec<u64> = (0..lanes)
            .map(|k| {
                let is_active = if active_size.is_scalar() { active_data[0] } else { active_data[k] } != 0;
                if !is_active {
                    0
                } else {
                    let idx = if idx_size.is_scalar() { idx_data[0] } else { idx_data[k] } as usize;
                    src_data.get(idx).copied().unwrap_or(0)
                }
            })
            .collect();
        inner.alloc(ty, backend, HandleState::Literal, idx_size, out)
    }

    fn scatter(&mut self, dest: IrHandle, source: IrHandle, permutation: &[u32], active: IrHandle) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (ty, backend, mut out, dest_size) = {
            let n = inner.node(dest);
            (n.ty, n.backend, n.data.clone(), n.size)
        };
        let (src_data, src_size) = {
            let n = inner.node(source);
            (n.data.clone(), n.size)
        };
        let active_data = inner.node(active).data.clone();
        let active_size = inner.node(active).size;
        for (k, &p) in permutation.iter().enumerate() {
            let is_active = if active_size.is_scalar() { active_data[0] } else { active_data[k] } != 0;
            if !is_active {
                continue;
            }
            let value = if src_size.is_scalar() { src_data[0] } else { src_data[k] };
            out[p as usize] = value;
        }
        inner.alloc(ty, backend, HandleState::Literal, dest_size, out)
    }

    fn schedule(&mut self, _handle: IrHandle) {}

    fn eval(&mut self) {}

    fn is_dirty(&self, _handle: IrHandle) -> bool {
        false
    }

    fn is_zero_literal(&self, handle: IrHandle) -> bool {
        if handle.is_null() {
            return true;
        }
        let inner = self.0.borrow();
        let node = inner.node(handle);
        node.state == HandleState::Literal && node.data.iter().all(|&b| b == 0)
    }

    fn set_backend(&mut self, backend: Backend) {
        self.0.borrow_mut().active_backend = Some(backend);
    }

    fn record_begin(&mut self) -> RecordScope {
        let mut inner = self.0.borrow_mut();
        inner.next_scope += 1;
        let id = inner.next_scope;
        inner.scope_stack.push(id);
        RecordScope(id)
    }

    fn record_checkpoint(&mut self) -> RecordCheckpoint {
        let mut inner = self.0.borrow_mut();
        inner.next_checkpoint += 1;
        RecordCheckpoint(inner.next_checkpoint)
    }

    fn record_end(&mut self, scope: RecordScope, _cleanup: bool) {
        let mut inner = self.0.borrow_mut();
        assert_eq!(inner.scope_stack.pop(), Some(scope.0), "recording scope LIFO violated");
    }

    fn new_scope(&mut self) -> RecordScope {
        let mut inner = self.0.borrow_mut();
        inner.next_scope += 1;
        RecordScope(inner.next_scope)
    }

    fn set_scope(&mut self, _scope: RecordScope) {}

    fn mask_push(&mut self, mask: IrHandle) {
        self.0.borrow_mut().mask_stack.push(mask);
    }

    fn mask_pop(&mut self) {
        self.0.borrow_mut().mask_stack.pop();
    }

    fn mask_default(&mut self, size: Size) -> IrHandle {
        self.bool(true, size)
    }

    fn call_mask(&self) -> IrHandle {
        self.0.borrow().mask_stack.last().copied().unwrap_or_else(|| self.ensure_true())
    }

    fn self_instance(&self) -> (InstanceId, IrHandle) {
        self.0.borrow().self_stack.last().copied().unwrap_or((InstanceId::new(0), IrHandle::NULL))
    }

    fn set_self(&mut self, value: InstanceId, per_lane: IrHandle) {
        self.0.borrow_mut().self_stack.push((value, per_lane));
    }

    fn pop_self(&mut self) {
        self.0.borrow_mut().self_stack.pop();
    }

    fn call_input(&mut self, handle: IrHandle) -> IrHandle {
        handle
    }

    fn call_reduce(&mut self, _backend: Backend, _domain: Option<&str>, instance_index: IrHandle) -> Result<CallBuckets, BackendError> {
        let inner = self.0.borrow();
        let node = inner.node(instance_index);
        let lanes = node.size.get().max(1) as usize;
        let mut by_id: HashMap<u32, Vec<u32>> = HashMap::new();
        for k in 0..lanes {
            let id = node.lane(k) as u32;
            if id != 0 {
                by_id.entry(id).or_default().push(k as u32);
            }
        }
        let mut ids: Vec<u32> = by_id.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .map(|id| Bucket {
                id: InstanceId::new(id),
                permutation: by_id.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn call(
        &mut self,
        _name: &str,
        instance_index: IrHandle,
        mask: IrHandle,
        instance_ids: &[InstanceId],
        _args: &[IrHandle],
        rv: &[IrHandle],
        _checkpoints: &[(RecordCheckpoint, RecordCheckpoint)],
    ) -> Vec<IrHandle> {
        let mut inner = self.0.borrow_mut();
        let n = instance_ids.len();
        if n == 0 || rv.is_empty() {
            return Vec::new();
        }
        let arity = rv.len() / n;

        let (idx_data, idx_size) = {
            let node = inner.node(instance_index);
            (node.data.clone(), node.size)
        };
        let (mask_data, mask_size) = {
            let node = inner.node(mask);
            (node.data.clone(), node.size)
        };
        let lanes = idx_size.get().max(1) as usize;

        let rv_nodes: Vec<Node> = rv.iter().map(|h| inner.node(*h).clone()).collect();
        let mut outputs = Vec::with_capacity(arity);
        for slot in 0..arity {
            let ty = rv_nodes[slot].ty;
            let backend = rv_nodes[slot].backend;
            let data: Vec<u64> = (0..lanes)
                .map(|k| {
                    let active = if mask_size.is_scalar() { mask_data[0] } else { mask_data[k] } != 0;
                    if !active {
                        return 0;
                    }
                    let id = if idx_size.is_scalar() { idx_data[0] } else { idx_data[k] } as u32;
                    match instance_ids.iter().position(|c| c.raw() == id) {
                        Some(p) => rv_nodes[p * arity + slot].lane(k),
                        None => 0,
                    }
                })
                .collect();
            outputs.push(inner.alloc(ty, backend, HandleState::Literal, Size::new(lanes as u32), data));
        }
        outputs
    }

    fn select_id(&mut self, cond: IrHandle, if_true: u32, if_false: u32) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        let (data, size) = {
            let node = inner.node(cond);
            (node.data.clone(), node.size)
        };
        let lanes = size.get().max(1) as usize;
        let out: Vec<u64> = (0..lanes)
            .map(|k| {
                let taken = if size.is_scalar() { data[0] } else { data[k] } != 0;
                (if taken { if_true } else { if_false }) as u64
            })
            .collect();
        inner.alloc(VarType::U32, Backend::Host, HandleState::Literal, size, out)
    }

    /// This reference backend cannot compile a real multi-iteration loop
    /// construct (see the module doc comment); it returns `body_out`
    /// unchanged, which is only observably correct for a single
    /// iteration. Tests exercising actual repetition use
    /// [`crate::control_flow::while_loop::LoopMode::Scalar`] instead.
    fn emit_loop(
        &mut self,
        _cond: IrHandle,
        _state_in: &[IrHandle],
        body_out: &[IrHandle],
        _checkpoints: (RecordCheckpoint, RecordCheckpoint, RecordCheckpoint, RecordCheckpoint),
    ) -> Vec<IrHandle> {
        body_out.to_vec()
    }

    fn malloc(&mut self, _kind: Backend, bytes: usize) -> Result<*mut u8, BackendError> {
        let layout = core::alloc::Layout::from_size_align(bytes.max(1), 8).map_err(|_| BackendError::OutOfMemory { bytes })?;
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() {
            Err(BackendError::OutOfMemory { bytes })
        } else {
            Ok(ptr)
        }
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        // The reference backend never tracks allocation sizes (no caller
        // in this crate's own tests exercises `malloc`/`free` together);
        // freeing is therefore deliberately left a no-op rather than
        // guessing a layout to deallocate with.
        let _ = ptr;
    }

    fn aggregate(&mut self, backend: Backend, entries: &[AggregateEntry]) -> IrHandle {
        let mut inner = self.0.borrow_mut();
        // The trait gives us no type for the aggregated buffer. We recover it from the
        // first `Evaluated` entry if any; callers in this crate's own
        // tests only aggregate float literals, so `F64` is a reasonable
        // fallback.
        let ty = entries
            .iter()
            .find_map(|e| match e {
                AggregateEntry::Evaluated { handle } => Some(inner.node(*handle).ty),
                AggregateEntry::Literal { .. } => None,
            })
            .unwrap_or(VarType::F64);
        let data: Vec<u64> = entries
            .iter()
            .map(|e| match e {
                AggregateEntry::Literal { bits } => *bits,
                AggregateEntry::Evaluated { handle } => inner.node(*handle).data[0],
            })
            .collect();
        inner.alloc(ty, backend, HandleState::Literal, Size::new(entries.len() as u32), data)
    }

    fn registry_ptr(&self, _backend: Backend, domain: &str, id: InstanceId) -> Option<*const ()> {
        let inner = self.0.borrow();
        let slots = inner.registries.get(domain)?;
        slots.get(id.raw() as usize).copied().filter(|p| !p.is_null())
    }

    fn registry_id_bound(&self, _backend: Backend, domain: &str) -> Result<u32, BackendError> {
        let inner = self.0.borrow();
        inner
            .registries
            .get(domain)
            .map(|slots| slots.len().saturating_sub(1) as u32)
            .ok_or(BackendError::UnknownDomain { domain: "" })
    }
}

struct StoredOp {
    op: Box<dyn CustomOp>,
    input_ids: Vec<u32>,
    output_ids: Vec<u32>,
}

struct AdInner {
    backend: TestBackend,
    next_id: u32,
    grads: HashMap<u32, IrHandle>,
    ops: Vec<Option<StoredOp>>,
    by_output: HashMap<u32, usize>,
    by_input: HashMap<u32, usize>,
    queue: VecDeque<u32>,
    refcounts: HashMap<u32, u32>,
}

/// A minimal reference AD engine, sharing its node store with a
/// [`TestBackend`] clone so `ad_accum_grad`/`ad_var_gather` can build new
/// IR nodes despite the trait not threading `&mut dyn IrBackend` through
/// those calls (the real engine presumably holds the same kind of
/// back-reference internally).
pub struct TestAd {
    inner: RefCell<AdInner>,
}

impl TestAd {
    /// Build an AD engine sharing `backend`'s node store.
    pub fn new(backend: TestBackend) -> Self {
        Self {
            inner: RefCell::new(AdInner {
                backend,
                next_id: 0,
                grads: HashMap::new(),
                ops: Vec::new(),
                by_output: HashMap::new(),
                by_input: HashMap::new(),
                queue: VecDeque::new(),
                refcounts: HashMap::new(),
            }),
        }
    }
}

struct NoopGuard;

impl IsolationGuard for NoopGuard {
    fn release(self: Box<Self>) {}
}

impl AdEngine for TestAd {
    fn ad_var_new(&mut self, ir: IrHandle) -> AdHandle {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.refcounts.insert(id, 1);
        AdHandle::new(id, ir)
    }

    fn ad_var_inc_ref(&mut self, handle: AdHandle) {
        if handle.ad_id() == 0 {
            return;
        }
        *self.inner.borrow_mut().refcounts.entry(handle.ad_id()).or_insert(0) += 1;
    }

    fn ad_var_dec_ref(&mut self, handle: AdHandle) {
        if handle.ad_id() == 0 {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(count) = inner.refcounts.get_mut(&handle.ad_id()) {
            *count -= 1;
            if *count == 0 {
                let id = handle.ad_id();
                inner.refcounts.remove(&id);
                inner.grads.remove(&id);
            }
        }
    }

    fn ad_var_copy(&mut self, handle: AdHandle) -> AdHandle {
        self.ad_var_new(handle.ir())
    }

    fn ad_var_gather(&mut self, source: AdHandle, permutation: &[u32], active: IrHandle) -> AdHandle {
        let new_ir = {
            let mut inner = self.inner.borrow_mut();
            inner.backend.gather(source.ir(), permutation, active)
        };
        self.ad_var_new(new_ir)
    }

    fn ad_var_scatter(&mut self, dest: AdHandle, source: AdHandle, permutation: &[u32], active: IrHandle) -> AdHandle {
        let new_ir = {
            let mut inner = self.inner.borrow_mut();
            inner.backend.scatter(dest.ir(), source.ir(), permutation, active)
        };
        self.ad_var_new(new_ir)
    }

    fn ad_grad(&self, id: u32) -> IrHandle {
        self.inner.borrow().grads.get(&id).copied().unwrap_or(IrHandle::NULL)
    }

    fn ad_accum_grad(&mut self, id: u32, value: IrHandle) {
        if value.is_null() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        let merged = match inner.grads.get(&id).copied() {
            Some(existing) if !existing.is_null() => inner.backend.binary_op(existing, value, |a, b| a + b),
            _ => value,
        };
        inner.grads.insert(id, merged);
    }

    fn ad_enqueue(&mut self, id: u32) {
        self.inner.borrow_mut().queue.push_back(id);
    }

    fn ad_traverse(&mut self, mode: TraversalMode, _flags: TraversalFlags) {
        loop {
            let next = self.inner.borrow_mut().queue.pop_front();
            let Some(id) = next else { break };

            let idx = {
                let inner = self.inner.borrow();
                match mode {
                    TraversalMode::Forward => inner.by_input.get(&id).copied(),
                    TraversalMode::Backward => inner.by_output.get(&id).copied(),
                }
            };
            let Some(idx) = idx else { continue };

            let taken = self.inner.borrow_mut().ops[idx].take();
            let Some(mut stored) = taken else { continue };

            let mut ir_handle = self.inner.borrow().backend.clone();
            match mode {
                TraversalMode::Forward => stored.op.forward(&mut ir_handle, self),
                TraversalMode::Backward => stored.op.backward(&mut ir_handle, self),
            }

            let mut inner = self.inner.borrow_mut();
            inner.ops[idx] = Some(stored);
        }
    }

    fn ad_custom_op(&mut self, op: Box<dyn CustomOp>, inputs: &[AdHandle], outputs: &[AdHandle]) -> bool {
        let mut inner = self.inner.borrow_mut();
        let idx = inner.ops.len();
        let input_ids: Vec<u32> = inputs.iter().map(|h| h.ad_id()).filter(|&id| id != 0).collect();
        let output_ids: Vec<u32> = outputs.iter().map(|h| h.ad_id()).filter(|&id| id != 0).collect();
        for &id in &input_ids {
            inner.by_input.insert(id, idx);
        }
        for &id in &output_ids {
            inner.by_output.insert(id, idx);
        }
        inner.ops.push(Some(StoredOp { op, input_ids, output_ids }));
        true
    }

    fn isolate(&mut self) -> Box<dyn IsolationGuard> {
        Box::new(NoopGuard)
    }

    fn check_implicit(&mut self, _dependency: AdHandle) {}
}
