use proptest::prelude::*;
use pyni_runtime::handles::{HandleTable, Lookup, Origin};
use pyni_runtime::{Handle, HandleKind, ObjectRef, ViolationKind};

fn obj(raw: u64) -> ObjectRef {
    ObjectRef::from_raw(raw)
}

#[test]
fn handles_are_local_and_resolve_while_open() {
    let mut table = HandleTable::new();
    let frame = table.enter_frame();
    let handle = table.open_local(obj(10)).expect("open");
    assert_eq!(handle.kind(), HandleKind::Local);
    assert_eq!(handle.generation(), frame.as_raw());
    assert_eq!(table.lookup(handle), Lookup::Open(obj(10)));
    assert_eq!(table.backing(handle).expect("open"), obj(10));
    assert_eq!(table.open_count(), 1);
}

#[test]
fn duplicates_are_independent_scopes() {
    let mut table = HandleTable::new();
    table.enter_frame();
    let original = table.open_local(obj(3)).expect("open");
    let copy = table.duplicate(original).expect("dup");
    assert_ne!(original, copy);
    assert_eq!(table.close(original).expect("close"), obj(3));
    assert_eq!(table.lookup(copy), Lookup::Open(obj(3)));
    assert_eq!(table.lookup(original), Lookup::Closed(obj(3)));
}

#[test]
fn closing_twice_is_a_double_close() {
    let mut table = HandleTable::new();
    table.enter_frame();
    let handle = table.open_local(obj(4)).expect("open");
    table.close(handle).expect("first close");
    let err = table.close(handle).expect_err("second close");
    assert_eq!(err.violation_kind(), Some(ViolationKind::DoubleClose));
}

#[test]
fn frame_exit_reports_leaks_but_not_arguments() {
    let mut table = HandleTable::new();
    let frame = table.enter_frame();
    table.open_argument(obj(1)).expect("arg");
    let leaked = table.open_local(obj(2)).expect("local");
    let closed = table.open_local(obj(3)).expect("local");
    let result = table.open_local(obj(4)).expect("result");
    table.close(closed).expect("close");
    assert_eq!(table.transfer(result).expect("transfer"), obj(4));

    let report = table.exit_frame(frame).expect("exit");
    assert_eq!(report.released, vec![obj(1), obj(2)]);
    assert_eq!(report.leaked.len(), 1);
    assert_eq!(report.leaked[0].handle, leaked);
    assert_eq!(report.leaked[0].origin, Origin::Opened);
    assert_eq!(table.depth(), 0);
}

#[test]
fn only_the_innermost_frame_can_exit() {
    let mut table = HandleTable::new();
    let outer = table.enter_frame();
    let inner = table.enter_frame();
    let err = table.exit_frame(outer).expect_err("not innermost");
    assert_eq!(err.violation_kind(), Some(ViolationKind::InvalidContext));
    table.exit_frame(inner).expect("inner");
    table.exit_frame(outer).expect("outer");
    assert!(table.exit_frame(outer).is_err());
}

#[test]
fn opening_without_a_frame_fails() {
    let mut table = HandleTable::new();
    assert!(table.open_local(obj(1)).is_err());
}

#[test]
fn heap_and_null_handles_are_not_local() {
    let mut table = HandleTable::new();
    table.enter_frame();
    assert_eq!(table.lookup(Handle::NULL), Lookup::Invalid);
    let heap = Handle::pack(HandleKind::Heap, 1, 0);
    assert_eq!(table.lookup(heap), Lookup::Invalid);
}

#[test]
fn a_handle_from_an_exited_frame_never_aliases_its_successor() {
    let mut table = HandleTable::new();
    let first = table.enter_frame();
    let stale = table.open_local(obj(1)).expect("open");
    table.exit_frame(first).expect("exit");

    table.enter_frame();
    let fresh = table.open_local(obj(2)).expect("open");
    assert_eq!(stale.index(), fresh.index());
    assert_eq!(table.lookup(stale), Lookup::Stale);
    let err = table.backing(stale).expect_err("stale");
    assert_eq!(err.violation_kind(), Some(ViolationKind::StaleHandleUse));
}

proptest! {
    #[test]
    fn exited_frames_leave_only_stale_handles(
        layout in prop::collection::vec(0usize..6, 1..6),
        reopen in 0usize..6,
    ) {
        let mut table = HandleTable::new();
        let mut frames = Vec::new();
        let mut handles = Vec::new();
        let mut next = 1u64;
        for count in &layout {
            frames.push(table.enter_frame());
            for _ in 0..*count {
                handles.push(table.open_local(obj(next)).expect("open"));
                next += 1;
            }
        }
        prop_assert_eq!(table.open_count(), layout.iter().sum::<usize>());

        let mut released = 0;
        while let Some(frame) = frames.pop() {
            released += table.exit_frame(frame).expect("exit").released.len();
        }
        prop_assert_eq!(released, handles.len());
        prop_assert_eq!(table.open_count(), 0);

        table.enter_frame();
        for _ in 0..reopen {
            table.open_local(obj(next)).expect("open");
            next += 1;
        }
        for handle in &handles {
            prop_assert_eq!(table.lookup(*handle), Lookup::Stale);
        }
    }

    #[test]
    fn frame_exit_leaks_exactly_the_unclosed_scopes(
        ops in prop::collection::vec((0u8..3, any::<prop::sample::Index>()), 0..48),
    ) {
        let mut table = HandleTable::new();
        let frame = table.enter_frame();
        let mut open = Vec::new();
        let (mut opens, mut dups, mut closes) = (0usize, 0usize, 0usize);
        for (step, (op, pick)) in ops.iter().enumerate() {
            match op {
                0 => {
                    open.push(table.open_local(obj(step as u64 + 1)).expect("open"));
                    opens += 1;
                }
                1 if !open.is_empty() => {
                    let source = open[pick.index(open.len())];
                    open.push(table.duplicate(source).expect("dup"));
                    dups += 1;
                }
                2 if !open.is_empty() => {
                    let handle = open.swap_remove(pick.index(open.len()));
                    table.close(handle).expect("close");
                    closes += 1;
                }
                _ => {}
            }
        }
        prop_assert_eq!(table.open_count(), opens + dups - closes);

        let report = table.exit_frame(frame).expect("exit");
        prop_assert_eq!(report.leaked.len(), opens + dups - closes);
        prop_assert_eq!(report.released.len(), report.leaked.len());
        let mut leaked: Vec<_> = report.leaked.iter().map(|leak| leak.handle).collect();
        let mut expected = open.clone();
        leaked.sort_by_key(|handle| handle.as_raw());
        expected.sort_by_key(|handle| handle.as_raw());
        prop_assert_eq!(leaked, expected);
    }

    #[test]
    fn open_handles_resolve_to_their_backing(values in prop::collection::vec(1u64..1_000, 1..32)) {
        let mut table = HandleTable::new();
        table.enter_frame();
        let handles: Vec<_> = values
            .iter()
            .map(|v| table.open_local(obj(*v)).expect("open"))
            .collect();
        for (handle, value) in handles.iter().zip(&values) {
            prop_assert_eq!(table.lookup(*handle), Lookup::Open(obj(*value)));
        }
    }
}
