mod common;

use common::{direct_extension, retained_context, runtime, runtime_with, sample_extension};
use proptest::prelude::*;
use pyni_core::errors::INVALID_HANDLE;
use pyni_runtime::buffer::POISON;
use pyni_runtime::{
    Api, ContextState, ObjectSpace, RuntimeConfig, StorageSite, Universal, ViolationKind,
    HOST_ABI_TAG,
};

type U = Api<Universal>;

#[test]
fn conforming_calls_match_release_mode() {
    for debug in [false, true] {
        let (runtime, heap) = runtime(debug);
        let ext = runtime.load(sample_extension(3)).expect("load");
        assert_eq!(ext.is_checked(), debug);
        let session = runtime.session();

        let n = heap.new_int(4);
        let list = session.call(&ext, "make_list", &[n]).expect("make_list");
        let total = session.call(&ext, "sum_list", &[list]).expect("sum_list");
        assert_eq!(heap.int_value(total), Some(6));

        let bytes = session.call(&ext, "bytes_hello", &[]).expect("bytes");
        let copy = session.call(&ext, "buffer_copy", &[bytes]).expect("copy");
        assert_eq!(heap.bytes_data(copy).as_deref(), Some(&b"hello"[..]));

        assert!(runtime.diagnostics().is_clean(), "debug={debug}");
    }
}

#[test]
fn leaked_handles_are_reported_with_their_call() {
    let (runtime, _heap) = runtime(true);
    let ext = runtime.load(sample_extension(1)).expect("load");
    let session = runtime.session();
    session.call(&ext, "leak_one", &[]).expect("call still succeeds");

    let records = runtime.diagnostics().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ViolationKind::LeakedHandle);
    assert_eq!(records[0].extension.as_deref(), Some("sample"));
    assert_eq!(records[0].function.as_deref(), Some("leak_one"));
}

#[test]
fn double_close_is_reported() {
    let (runtime, _heap) = runtime(true);
    let ext = runtime.load(sample_extension(1)).expect("load");
    let session = runtime.session();
    let err = session
        .call(&ext, "double_close", &[])
        .expect_err("second close fails");
    assert_eq!(err.violation_kind(), Some(ViolationKind::DoubleClose));
    assert_eq!(runtime.diagnostics().count(ViolationKind::DoubleClose), 1);
}

#[test]
fn handles_from_an_exited_frame_are_stale() {
    let (runtime, heap) = runtime(true);
    let ext = runtime.load(sample_extension(1)).expect("load");
    let session = runtime.session();
    let value = heap.new_int(8);
    session.call(&ext, "stash_arg", &[value]).expect("stash");
    let err = session.call(&ext, "use_stash", &[]).expect_err("stale");
    assert_eq!(err.violation_kind(), Some(ViolationKind::StaleHandleUse));
    assert_eq!(runtime.diagnostics().count(ViolationKind::StaleHandleUse), 1);
}

#[test]
fn inherited_contexts_expire_with_their_call() {
    let (runtime, _heap) = runtime(true);
    let ext = runtime.load(sample_extension(1)).expect("load");
    let session = runtime.session();
    session.call(&ext, "retain_ctx", &[]).expect("retain");

    let view = unsafe { runtime.context_view(retained_context()) }.expect("view");
    assert_eq!(view.state, ContextState::Released);

    let err = session
        .call(&ext, "use_retained_ctx", &[])
        .expect_err("expired context");
    assert_eq!(err.violation_kind(), Some(ViolationKind::UseAfterRelease));
    assert_eq!(runtime.diagnostics().count(ViolationKind::UseAfterRelease), 1);
}

#[test]
fn released_buffers_are_poisoned_and_rejected() {
    let (runtime, heap) = runtime(true);
    let ext = runtime.load(sample_extension(3)).expect("load");
    let session = runtime.session();
    let bytes = heap.new_bytes(b"abc");

    let err = session
        .call(&ext, "buffer_after_release", &[bytes])
        .expect_err("released buffer");
    assert_eq!(err.violation_kind(), Some(ViolationKind::UseAfterRelease));

    let first = session
        .call(&ext, "peek_after_release", &[bytes])
        .expect("peek");
    assert_eq!(heap.int_value(first), Some(i64::from(POISON)));
    assert_eq!(heap.bytes_data(bytes).as_deref(), Some(&b"abc"[..]));
}

#[test]
fn buffers_evicted_from_quarantine_are_still_released() {
    let (runtime, heap) = runtime_with(RuntimeConfig {
        buffer_quarantine: 1,
        ..RuntimeConfig::debug()
    });
    let session = runtime.session();
    let bytes = heap.new_bytes(b"abc");

    let ((evicted, unknown), _) = session
        .scoped(|api| {
            let local = api.open_argument(bytes)?;
            let first = api.buffer_acquire(local)?;
            api.buffer_release(first.token)?;
            let second = api.buffer_acquire(local)?;
            api.buffer_release(second.token)?;
            let evicted = api.bytes_from_buffer(first.token).expect_err("released");
            let unknown = api.bytes_from_buffer(second.token + 100).expect_err("never issued");
            api.close(local)?;
            Ok((evicted, unknown))
        })
        .expect("scoped");

    assert_eq!(evicted.violation_kind(), Some(ViolationKind::UseAfterRelease));
    assert_eq!(unknown.violation_kind(), None);
    assert_eq!(unknown.info().code, INVALID_HANDLE);
    assert_eq!(runtime.diagnostics().count(ViolationKind::UseAfterRelease), 1);
    assert_eq!(heap.refcount(bytes), Some(1));
}

#[test]
fn host_promotion_reports_its_own_operation() {
    let (runtime, heap) = runtime(true);
    let session = runtime.session();
    let owner = heap.new_list();

    let (err, _) = session
        .scoped(|api| {
            let local = api.long_from_i64(5)?;
            api.close(local)?;
            Ok(api
                .promote_to_heap(local, StorageSite::Field { owner, slot: 0 })
                .expect_err("closed"))
        })
        .expect("scoped");

    assert_eq!(err.violation_kind(), Some(ViolationKind::UseAfterRelease));
    let records = runtime.diagnostics().snapshot();
    assert_eq!(records.len(), 1);
    assert!(records[0].message.starts_with("PromoteToHeap"), "{}", records[0].message);
    assert_eq!(records[0].function.as_deref(), Some("<scoped>"));
    assert!(runtime.heap().is_empty());
}

#[test]
fn the_diagnostic_channel_keeps_the_newest_records() {
    let (runtime, _heap) = runtime_with(RuntimeConfig {
        diagnostics_limit: 2,
        ..RuntimeConfig::debug()
    });
    let ext = runtime.load(sample_extension(1)).expect("load");
    let session = runtime.session();
    for _ in 0..3 {
        session.call(&ext, "leak_one", &[]).expect("leak");
    }
    let diagnostics = runtime.diagnostics();
    assert_eq!(diagnostics.snapshot().len(), 2);
    assert_eq!(diagnostics.count(ViolationKind::LeakedHandle), 3);
    assert_eq!(diagnostics.dropped(), 1);
}

#[test]
fn calls_newer_than_the_context_version_are_invalid() {
    let (runtime, _heap) = runtime(true);
    let session = runtime.session();
    let ctx = session.create_context(1).expect("context");
    let list_new = runtime
        .vtable(3)
        .and_then(|table| table.list_new)
        .expect("slot");

    let out = unsafe { list_new(ctx) };
    assert!(out.is_null());
    assert_eq!(runtime.diagnostics().count(ViolationKind::InvalidContext), 1);

    let pending = session
        .scoped(|api| Ok(api.take_error()))
        .expect("scoped")
        .0
        .expect("pending error");
    assert_eq!(pending.violation_kind(), Some(ViolationKind::InvalidContext));
    session.close_context(ctx).expect("close");
}

#[test]
fn synthesized_contexts_close_once_and_in_order() {
    let (runtime, _heap) = runtime(true);
    let session = runtime.session();
    let outer = session.create_context(3).expect("outer");
    let inner = session.create_context(3).expect("inner");

    let err = session.close_context(outer).expect_err("outer first");
    assert_eq!(err.violation_kind(), Some(ViolationKind::InvalidContext));

    session.close_context(inner).expect("inner");
    session.close_context(outer).expect("outer");
    let err = session.close_context(outer).expect_err("closed twice");
    assert_eq!(err.violation_kind(), Some(ViolationKind::InvalidContext));
    assert_eq!(runtime.diagnostics().count(ViolationKind::InvalidContext), 2);

    let value = unsafe { U::long_from_i64(outer, 1) };
    assert!(value.is_null());
    assert_eq!(runtime.diagnostics().count(ViolationKind::UseAfterRelease), 1);
}

#[test]
fn unclosed_synthesized_contexts_are_reported_when_the_session_ends() {
    let (runtime, _heap) = runtime(true);
    let session = runtime.session();
    let ctx = session.create_context(2).expect("context");
    drop(session);
    assert_eq!(runtime.diagnostics().count(ViolationKind::InvalidContext), 1);
    let view = unsafe { runtime.context_view(ctx) }.expect("view");
    assert_eq!(view.state, ContextState::Detached);
}

#[test]
fn contexts_are_bound_to_their_thread() {
    let (runtime, _heap) = runtime(true);
    let session = runtime.session();
    let ctx = session.create_context(3).expect("context");
    let raw = ctx as usize;

    let out = std::thread::scope(|scope| {
        scope
            .spawn(move || unsafe { U::long_from_i64(raw as pyni_runtime::ContextPtr, 4) })
            .join()
            .expect("thread")
    });
    assert!(out.is_null());
    assert_eq!(runtime.diagnostics().count(ViolationKind::InvalidContext), 1);
    session.close_context(ctx).expect("close");
}

#[test]
fn version_specific_extensions_run_unchecked() {
    let (runtime, heap) = runtime(true);
    let ext = runtime
        .load(direct_extension(HOST_ABI_TAG))
        .expect("load");
    assert!(!ext.is_checked());
    let session = runtime.session();
    let baseline = heap.live_count();
    session.call(&ext, "leak", &[]).expect("leak");
    assert!(runtime.diagnostics().is_clean());
    assert_eq!(heap.live_count(), baseline);
}

proptest! {
    #[test]
    fn every_unclosed_scope_is_reported_once(
        ops in prop::collection::vec((0u8..3, any::<prop::sample::Index>()), 0..32),
    ) {
        let (runtime, heap) = runtime(true);
        let session = runtime.session();
        let baseline = heap.live_count();
        let (expected, report) = session
            .scoped(|api| {
                let mut open = Vec::new();
                let mut expected = 0usize;
                for (step, (op, pick)) in ops.iter().enumerate() {
                    match op {
                        0 => {
                            open.push(api.long_from_i64(step as i64)?);
                            expected += 1;
                        }
                        1 if !open.is_empty() => {
                            let source = open[pick.index(open.len())];
                            open.push(api.dup(source)?);
                            expected += 1;
                        }
                        2 if !open.is_empty() => {
                            api.close(open.swap_remove(pick.index(open.len())))?;
                            expected -= 1;
                        }
                        _ => {}
                    }
                }
                Ok(expected)
            })
            .expect("scoped");

        prop_assert_eq!(report.leaked.len(), expected);
        prop_assert_eq!(runtime.diagnostics().count(ViolationKind::LeakedHandle), expected);
        prop_assert_eq!(runtime.diagnostics().summary().len(), usize::from(expected > 0));
        prop_assert_eq!(heap.live_count(), baseline);
    }
}
