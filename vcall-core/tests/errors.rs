//! Coverage for the dispatcher's own `DispatchError` variants: a callable
//! disagreeing on return arity must fail with `ReturnArityMismatch` and
//! leave every scoped stack exactly as deep as it was on entry, and the
//! remaining caller-triggerable variants each get their own minimal
//! reproduction.

use vcall_backend::Backend;
use vcall_core::testutil::{TestAd, TestBackend};
use vcall_core::{BoxedUserFn, CallRequest, Ctx, Dispatcher, DispatchError, InstancePtr, Result, RvVec};
use vcall_types::{AdHandle, IrHandle};

fn mismatched_arity(backend: &TestBackend) -> BoxedUserFn {
    let backend = backend.clone();
    Box::new(move |_ctx: &mut Ctx<'_>, inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        match inst.map(|p| p.as_ptr() as usize) {
            Some(1) => {
                rv.push(AdHandle::from_ir(backend.float(1.0)));
            }
            Some(2) => {
                rv.push(AdHandle::from_ir(backend.float(1.0)));
                rv.push(AdHandle::from_ir(backend.float(2.0)));
            }
            other => panic!("unexpected instance pointer {other:?}"),
        }
        Ok(())
    })
}

#[test]
fn arity_mismatch_is_rejected_and_stacks_stay_balanced() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int_vec(&[1, 2]);
    let mask = backend.bool_vec(&[true, true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "mismatched",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: true,
        symbolic_active: true,
    };

    let err = Dispatcher::call(&mut ctx, req, mismatched_arity(&backend)).unwrap_err();
    match err {
        DispatchError::ReturnArityMismatch { callable, expected, found } => {
            assert_eq!(callable, 2);
            assert_eq!(expected, 1);
            assert_eq!(found, 2);
        }
        other => panic!("expected ReturnArityMismatch, got {other:?}"),
    }

    // A second, well-formed call must still succeed: a failed call must
    // leave no mask/self/recording-scope frame behind.
    let instance_index = backend.int_vec(&[1, 2]);
    let mask = backend.bool_vec(&[true, true]);
    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "well_formed",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: true,
        symbolic_active: true,
    };
    let one_per_callable: BoxedUserFn = {
        let backend = backend.clone();
        Box::new(move |_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
            rv.push(AdHandle::from_ir(backend.float(9.0)));
            Ok(())
        })
    };
    Dispatcher::call(&mut ctx, req, one_per_callable).unwrap();
}

#[test]
fn shape_mismatch_on_incompatible_arg_size() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    // instance_index/mask unify to size 3; a size-2 non-broadcast arg can't join that.
    let instance_index = backend.int_vec(&[1, 1, 1]);
    let mask = backend.bool_vec(&[true, true, true]);
    let args = [AdHandle::from_ir(backend.float_vec(&[1.0, 2.0]))];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(1),
        name: "shape_mismatch",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let noop: BoxedUserFn = Box::new(|_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        rv.push(AdHandle::from_ir(IrHandle::NULL));
        Ok(())
    });

    let err = Dispatcher::call(&mut ctx, req, noop).unwrap_err();
    match err {
        DispatchError::ShapeMismatch { expected, found } => {
            assert_eq!(expected.get(), 3);
            assert_eq!(found.get(), 2);
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
}

#[test]
fn mode_conflict_when_domain_and_callable_count_both_absent() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int(1);
    let mask = backend.bool_vec(&[true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: None,
        name: "mode_conflict",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let noop: BoxedUserFn = Box::new(|_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        rv.push(AdHandle::from_ir(IrHandle::NULL));
        Ok(())
    });

    let err = Dispatcher::call(&mut ctx, req, noop).unwrap_err();
    assert!(matches!(err, DispatchError::ModeConflict));
}

#[test]
fn registry_miss_on_unbound_callable_id() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    // Bind only id 1 in the "d" domain; lane 2 below resolves to id 2, never bound.
    backend.register("d", 1, 0x1 as *const ());
    let instance_index = backend.int_vec(&[1, 2]);
    let mask = backend.bool_vec(&[true, true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: Some("d"),
        callable_count: None,
        name: "registry_miss",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let one_per_callable: BoxedUserFn = {
        let backend = backend.clone();
        Box::new(move |_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
            rv.push(AdHandle::from_ir(backend.float(1.0)));
            Ok(())
        })
    };

    let err = Dispatcher::call(&mut ctx, req, one_per_callable).unwrap_err();
    match err {
        DispatchError::RegistryMiss { callable } => assert_eq!(callable, 2),
        other => panic!("expected RegistryMiss, got {other:?}"),
    }
}

#[test]
fn empty_return_on_null_handle() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int(1);
    let mask = backend.bool_vec(&[true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(1),
        name: "empty_return",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let returns_null: BoxedUserFn = Box::new(|_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        rv.push(AdHandle::from_ir(IrHandle::NULL));
        Ok(())
    });

    let err = Dispatcher::call(&mut ctx, req, returns_null).unwrap_err();
    match err {
        DispatchError::EmptyReturn { callable, slot } => {
            assert_eq!(callable, 1);
            assert_eq!(slot, 0);
        }
        other => panic!("expected EmptyReturn, got {other:?}"),
    }
}

fn disagreeing_return_type(backend: &TestBackend) -> BoxedUserFn {
    let backend = backend.clone();
    Box::new(move |_ctx: &mut Ctx<'_>, inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        match inst.map(|p| p.as_ptr() as usize) {
            Some(1) => rv.push(AdHandle::from_ir(backend.float(1.0))),
            Some(2) => rv.push(AdHandle::from_ir(backend.int(1))),
            other => panic!("unexpected instance pointer {other:?}"),
        }
        Ok(())
    })
}

#[test]
fn return_type_mismatch_across_callables() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int_vec(&[1, 2]);
    let mask = backend.bool_vec(&[true, true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "return_type_mismatch",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: true,
        symbolic_active: true,
    };

    let err = Dispatcher::call(&mut ctx, req, disagreeing_return_type(&backend)).unwrap_err();
    match err {
        DispatchError::ReturnTypeMismatch { callable, slot, .. } => {
            assert_eq!(callable, 2);
            assert_eq!(slot, 0);
        }
        other => panic!("expected ReturnTypeMismatch, got {other:?}"),
    }
}

fn disagreeing_return_backend(backend: &TestBackend) -> BoxedUserFn {
    let backend = backend.clone();
    Box::new(move |_ctx: &mut Ctx<'_>, inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
        match inst.map(|p| p.as_ptr() as usize) {
            Some(1) => rv.push(AdHandle::from_ir(backend.float_on(1.0, Backend::Host))),
            Some(2) => rv.push(AdHandle::from_ir(backend.float_on(2.0, Backend::Device))),
            other => panic!("unexpected instance pointer {other:?}"),
        }
        Ok(())
    })
}

#[test]
fn return_backend_mismatch_across_callables() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int_vec(&[1, 2]);
    let mask = backend.bool_vec(&[true, true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(2),
        name: "return_backend_mismatch",
        is_getter: false,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: true,
        symbolic_active: true,
    };

    let err = Dispatcher::call(&mut ctx, req, disagreeing_return_backend(&backend)).unwrap_err();
    match err {
        DispatchError::ReturnBackendMismatch { callable, slot } => {
            assert_eq!(callable, 2);
            assert_eq!(slot, 0);
        }
        other => panic!("expected ReturnBackendMismatch, got {other:?}"),
    }
}

#[test]
fn return_not_scalar_rejected_by_getter_strategy() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let instance_index = backend.int(1);
    let mask = backend.bool_vec(&[true]);
    let args: [AdHandle; 0] = [];

    let req = CallRequest {
        backend: Backend::Host,
        domain: None,
        callable_count: Some(1),
        name: "getter_not_scalar",
        is_getter: true,
        instance_index,
        mask,
        args: &args,
        ad_enabled: false,
        symbolic_calls: false,
        symbolic_active: false,
    };

    let returns_vector: BoxedUserFn = {
        let backend = backend.clone();
        Box::new(move |_ctx: &mut Ctx<'_>, _inst: InstancePtr, _args: &[AdHandle], rv: &mut RvVec| -> Result<()> {
            rv.push(AdHandle::from_ir(backend.float_vec(&[1.0, 2.0])));
            Ok(())
        })
    };

    let err = Dispatcher::call(&mut ctx, req, returns_vector).unwrap_err();
    match err {
        DispatchError::ReturnNotScalar { callable } => assert_eq!(callable, 1),
        other => panic!("expected ReturnNotScalar, got {other:?}"),
    }
}
