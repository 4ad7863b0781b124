//! End-to-end coverage of the raw two-callable indirect call,
//! once through the evaluated strategy and once through the recording
//! strategy, with a null instance id masking one lane out of the result.

use vcall_backend::Backend;
use vcall_core::testutil::{TestAd, TestBackend};
use vcall_core::{BoxedUserFn, CallRequest, Ctx, Dispatcher, InstancePtr, Result, RvVec};
use vcall_types::AdHandle;

fn two_callables(backend: &TestBackend) -> BoxedUserFn {
    let backend = backend.clone();
    Box::new(move |_ctx: &mut Ctx<'_>, inst: InstancePtr, args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        let literal = match inst.map(|p| p.as_ptr() as usize) {
            Some(1) => backend.float(2.0),
            Some(2) => backend.float(10.0),
            other => panic!("unexpected instance pointer {other:?}"),
        };
        let out = if inst.map(|p| p.as_ptr() as usize) == Some(1) {
            backend.binary_op(args[0].ir(), literal, |a, b| a * b)
        } else {
            backend.binary_op(args[0].ir(), literal, |a, b| a + b)
        };
        rv.push(AdHandle::from_ir(out));
        Ok(())
    })
}

#[test]
fn two_callable_dispatch_evaluated_with_null_instance() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let x = AdHandle::from_ir(backend.float_vec(&[1.0, 2.0, 3.0]));
    let instance_index = backend.int_vec(&[1, 2, 0]);
    let mask = backend.bool_vec(&[true, true, true]);

    let args = [x];
    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "two_callable",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let rv = Dispatcher::call(&mut ctx, req, two_callables(&backend)).unwrap();
    assert_eq!(backend.read_floats(rv[0].ir()), vec![2.0, 12.0, 0.0]);
}

#[test]
fn two_callable_dispatch_recording() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let x = AdHandle::from_ir(backend.float_vec(&[1.0, 2.0, 3.0]));
    let instance_index = backend.int_vec(&[1, 2, 0]);
    let mask = backend.bool_vec(&[true, true, true]);

    let args = [x];
    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "two_callable",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: true,
        symbolic_active: true,
    };

    let rv = Dispatcher::call(&mut ctx, req, two_callables(&backend)).unwrap();
    assert_eq!(backend.read_floats(rv[0].ir()), vec![2.0, 12.0, 0.0]);
}

#[test]
fn evaluated_call_outside_symbolic_region_is_rejected_when_symbolic_active() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let x = AdHandle::from_ir(backend.float(1.0));
    let instance_index = backend.int(1);
    let mask = backend.bool_vec(&[true]);

    let args = [x];
    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "two_callable",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: true,
    };

    let err = Dispatcher::call(&mut ctx, req, two_callables(&backend)).unwrap_err();
    assert!(matches!(err, vcall_core::DispatchError::SymbolicModeRequired));
}
