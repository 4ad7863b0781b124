//! End-to-end coverage of the AD hook: `f_i(x) = c_i * x`
//! dispatched symbolically, then a backward traversal seeded at the
//! result, verifying the accumulated gradient at `x` equals the
//! `c` of whichever callable the call actually selected.

use vcall_backend::{Backend, TraversalFlags, TraversalMode};
use vcall_core::testutil::{TestAd, TestBackend};
use vcall_core::{BoxedUserFn, CallRequest, Ctx, Dispatcher, InstancePtr, Result, RvVec};
use vcall_types::AdHandle;

fn scale_callables(backend: &TestBackend) -> BoxedUserFn {
    let backend = backend.clone();
    Box::new(move |_ctx: &mut Ctx<'_>, inst: InstancePtr, args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        let c = match inst.map(|p| p.as_ptr() as usize) {
            Some(1) => backend.float(2.0),
            Some(2) => backend.float(3.0),
            other => panic!("unexpected instance pointer {other:?}"),
        };
        let out = backend.binary_op(args[0].ir(), c, |a, b| a * b);
        rv.push(AdHandle::from_ir(out));
        Ok(())
    })
}

#[test]
fn backward_pass_selects_gradient_of_chosen_callable() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let x_ir = backend.float(5.0);
    let x = ctx.ad.ad_var_new(x_ir);

    let instance_index = backend.int(2);
    let mask = backend.bool_vec(&[true]);
    let args = [x];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "scale",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: true,
        symbolic_calls: true,
        symbolic_active: true,
    };

    let rv = Dispatcher::call(&mut ctx, req, scale_callables(&backend)).unwrap();
    let y = rv[0];
    assert!(y.is_differentiable(), "output of a differentiable call must carry an AD tag");
    assert_eq!(backend.read_floats(y.ir()), vec![15.0]);

    let seed = backend.float(1.0);
    ctx.ad.ad_accum_grad(y.ad_id(), seed);
    ctx.ad.ad_enqueue(y.ad_id());
    ctx.ad.ad_traverse(TraversalMode::Backward, TraversalFlags::NONE);

    let grad_x = ctx.ad.ad_grad(x.ad_id());
    assert_eq!(backend.read_floats(grad_x), vec![3.0]);
}
