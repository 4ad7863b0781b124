//! End-to-end coverage of the while-loop frontend: a real repeated
//! [`LoopMode::Scalar`] loop, plus [`LoopMode::Symbolic`]'s single
//! cond/body recording pass and its `LoopStateChanged`/`LoopSizeConflict`
//! validation (the reference backend evaluates eagerly and has no real
//! code generator, so it can't execute a genuine multi-iteration compiled
//! loop — see `testutil`'s module doc comment).

use vcall_core::control_flow::{while_loop, LoopMode};
use vcall_core::testutil::{TestAd, TestBackend};
use vcall_core::{Ctx, DispatchError, RvVec};
use vcall_types::AdHandle;

#[test]
fn scalar_loop_counts_down_to_zero() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let counter = AdHandle::from_ir(backend.float(3.0));
    let mut state = (counter,);

    let cond_backend = backend.clone();
    let cond_fn = move |_ctx: &mut Ctx<'_>, args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        let zero = cond_backend.float(0.0);
        let cond = cond_backend.compare(args[0].ir(), zero, |a, b| a != b);
        rv.push(AdHandle::from_ir(cond));
        Ok(())
    };

    let body_backend = backend.clone();
    let body_fn = move |_ctx: &mut Ctx<'_>, args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        let one = body_backend.float(1.0);
        let decremented = body_backend.binary_op(args[0].ir(), one, |a, b| a - b);
        rv.push(AdHandle::from_ir(decremented));
        Ok(())
    };

    while_loop(&mut ctx, &mut state, None, LoopMode::Scalar, cond_fn, body_fn).unwrap();

    assert_eq!(backend.read_floats(state.0.ir()), vec![0.0]);
}

/// `LoopMode::Symbolic` records `cond`/`body` exactly once, into their own
/// checkpointed regions, and hands the result to `emit_loop`. The reference
/// backend's `emit_loop` is a single-iteration passthrough (see
/// `testutil`'s module doc comment) — it cannot express the repeated
/// execution a real kernel-generating backend would compile, so this only
/// exercises the recording/validation plumbing `run_symbolic` does around
/// one cond/body pass, not multi-iteration convergence.
#[test]
fn symbolic_loop_records_one_cond_body_pass() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let counter = AdHandle::from_ir(backend.float(3.0));
    let mut state = (counter,);

    let cond_backend = backend.clone();
    let cond_fn = move |_ctx: &mut Ctx<'_>, args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        let zero = cond_backend.float(0.0);
        let cond = cond_backend.compare(args[0].ir(), zero, |a, b| a != b);
        rv.push(AdHandle::from_ir(cond));
        Ok(())
    };

    let body_backend = backend.clone();
    let body_fn = move |_ctx: &mut Ctx<'_>, args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        let one = body_backend.float(1.0);
        let decremented = body_backend.binary_op(args[0].ir(), one, |a, b| a - b);
        rv.push(AdHandle::from_ir(decremented));
        Ok(())
    };

    while_loop(&mut ctx, &mut state, None, LoopMode::Symbolic, cond_fn, body_fn).unwrap();

    assert_eq!(backend.read_floats(state.0.ir()), vec![2.0]);
}

#[test]
fn symbolic_loop_rejects_body_type_change() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let counter = AdHandle::from_ir(backend.float(3.0));
    let mut state = (counter,);

    let cond_backend = backend.clone();
    let cond_fn = move |_ctx: &mut Ctx<'_>, args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        let zero = cond_backend.float(0.0);
        let cond = cond_backend.compare(args[0].ir(), zero, |a, b| a != b);
        rv.push(AdHandle::from_ir(cond));
        Ok(())
    };

    // Returns an `i64` where the state started as `f64`.
    let body_backend = backend.clone();
    let body_fn = move |_ctx: &mut Ctx<'_>, _args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        rv.push(AdHandle::from_ir(body_backend.int(0)));
        Ok(())
    };

    let err = while_loop(&mut ctx, &mut state, None, LoopMode::Symbolic, cond_fn, body_fn).unwrap_err();
    match err {
        DispatchError::LoopStateChanged { path, .. } => assert_eq!(path, "arg0"),
        other => panic!("expected LoopStateChanged, got {other:?}"),
    }
}

#[test]
fn symbolic_loop_rejects_incompatible_size_change() {
    let backend = TestBackend::new();
    let mut ad = TestAd::new(backend.clone());
    let mut ir = backend.clone();
    let mut ctx = Ctx::new(&mut ir, &mut ad);

    let counter = AdHandle::from_ir(backend.float_vec(&[1.0, 2.0, 3.0]));
    let mut state = (counter,);

    let cond_backend = backend.clone();
    let cond_fn = move |_ctx: &mut Ctx<'_>, _args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        rv.push(AdHandle::from_ir(cond_backend.bool_vec(&[true])));
        Ok(())
    };

    // Shrinks a size-3 vector to size-2 — not a 1 -> N growth, so it
    // conflicts rather than being accepted as a broadcast.
    let body_backend = backend.clone();
    let body_fn = move |_ctx: &mut Ctx<'_>, _args: &[AdHandle], rv: &mut RvVec| -> vcall_core::Result<()> {
        rv.push(AdHandle::from_ir(body_backend.float_vec(&[1.0, 2.0])));
        Ok(())
    };

    let err = while_loop(&mut ctx, &mut state, None, LoopMode::Symbolic, cond_fn, body_fn).unwrap_err();
    match err {
        DispatchError::LoopSizeConflict { path, from, to } => {
            assert_eq!(path, "arg0");
            assert_eq!(from.get(), 3);
            assert_eq!(to.get(), 2);
        }
        other => panic!("expected LoopSizeConflict, got {other:?}"),
    }
}
