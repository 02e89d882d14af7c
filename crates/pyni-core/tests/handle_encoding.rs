use pyni_core::handle::{next_generation, MAX_GENERATION};
use pyni_core::{Handle, HandleKind, LegacyRef, ObjectRef};

#[test]
fn packs_kind_generation_and_index() {
    let local = Handle::pack(HandleKind::Local, 7, 42);
    assert_eq!(local.kind(), HandleKind::Local);
    assert_eq!(local.generation(), 7);
    assert_eq!(local.index(), 42);
    assert!(!local.is_null());

    let heap = Handle::pack(HandleKind::Heap, MAX_GENERATION, u32::MAX);
    assert_eq!(heap.kind(), HandleKind::Heap);
    assert_eq!(heap.generation(), MAX_GENERATION);
    assert_eq!(heap.index(), u32::MAX);
    assert_eq!(Handle::from_raw(heap.as_raw()), heap);
}

#[test]
fn null_is_never_produced_by_pack() {
    let first = Handle::pack(HandleKind::Local, 1, 0);
    assert_ne!(first, Handle::NULL);
    assert!(Handle::NULL.is_null());
}

#[test]
fn generations_skip_zero_on_wrap() {
    assert_eq!(next_generation(1), 2);
    assert_eq!(next_generation(MAX_GENERATION), 1);
}

#[test]
fn legacy_refs_share_object_bits() {
    let obj = ObjectRef::from_raw(99);
    let legacy = LegacyRef::from_object(obj);
    assert_eq!(legacy.object(), Some(obj));
    assert_eq!(LegacyRef::NULL.object(), None);
}
