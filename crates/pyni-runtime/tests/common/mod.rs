#![allow(dead_code)]

use std::cell::Cell;
use std::sync::Arc;

use pyni_runtime::callconv::{LegacyFn, OptimizedFn, StandardFn};
use pyni_runtime::descriptor::{AbiString, RawFunctionDef, CONVENTION_STANDARD};
use pyni_runtime::{
    Api, Arity, ContextPtr, ExtensionDescriptor, FunctionDef, Handle, LegacyRef, PrimitiveValue,
    RawBuffer, RawDescriptor, RcHeap, Runtime, RuntimeConfig, Universal, VersionSpecific,
    DESCRIPTOR_STRUCT_VERSION, LATEST_VERSION,
};

type U = Api<Universal>;
type V = Api<VersionSpecific>;

thread_local! {
    pub static FAST_CALLS: Cell<usize> = const { Cell::new(0) };
    static STASHED_HANDLE: Cell<Handle> = const { Cell::new(Handle::NULL) };
    static STASHED_HEAP: Cell<Handle> = const { Cell::new(Handle::NULL) };
    static RETAINED_CTX: Cell<ContextPtr> = const { Cell::new(std::ptr::null()) };
}

/// Routes runtime logs to the test output; `RUST_LOG=pyni_runtime=debug` shows lifecycle events.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn runtime_with(config: RuntimeConfig) -> (Runtime, Arc<RcHeap>) {
    init_tracing();
    let heap = Arc::new(RcHeap::new());
    let runtime = Runtime::new(config, heap.clone()).expect("runtime");
    (runtime, heap)
}

pub fn runtime(debug: bool) -> (Runtime, Arc<RcHeap>) {
    let config = if debug {
        RuntimeConfig::debug()
    } else {
        RuntimeConfig::default()
    };
    runtime_with(config)
}

pub fn retained_context() -> ContextPtr {
    RETAINED_CTX.with(Cell::get)
}

unsafe fn argv<'a>(args: *const Handle, nargs: usize) -> &'a [Handle] {
    if args.is_null() || nargs == 0 {
        return &[];
    }
    std::slice::from_raw_parts(args, nargs)
}

pub unsafe extern "C" fn add_ints(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let a = U::long_as_i64(ctx, args[0]);
    let b = U::long_as_i64(ctx, args[1]);
    if U::err_occurred(ctx) {
        return Handle::NULL;
    }
    U::long_from_i64(ctx, a + b)
}

pub unsafe extern "C" fn add_ints_fast(
    _ctx: ContextPtr,
    args: *const PrimitiveValue,
    nargs: usize,
    out: *mut PrimitiveValue,
) -> i32 {
    FAST_CALLS.with(|calls| calls.set(calls.get() + 1));
    let args = std::slice::from_raw_parts(args, nargs);
    *out = PrimitiveValue::int(args[0].i + args[1].i);
    0
}

pub unsafe extern "C" fn scale(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let factor = U::long_as_i64(ctx, args[0]);
    let value = U::float_as_f64(ctx, args[1]);
    if U::err_occurred(ctx) {
        return Handle::NULL;
    }
    U::float_from_f64(ctx, factor as f64 * value)
}

pub unsafe extern "C" fn scale_fast(
    _ctx: ContextPtr,
    args: *const PrimitiveValue,
    nargs: usize,
    out: *mut PrimitiveValue,
) -> i32 {
    FAST_CALLS.with(|calls| calls.set(calls.get() + 1));
    let args = std::slice::from_raw_parts(args, nargs);
    *out = PrimitiveValue::float(args[0].i as f64 * args[1].d);
    0
}

pub unsafe extern "C" fn make_list(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let n = U::long_as_i64(ctx, args[0]);
    if U::err_occurred(ctx) {
        return Handle::NULL;
    }
    let list = U::list_new(ctx);
    let Some(list) = U::as_list(ctx, list) else {
        return Handle::NULL;
    };
    for i in 0..n {
        let item = U::long_from_i64(ctx, i);
        if U::list_append(ctx, list, item) != 0 {
            return Handle::NULL;
        }
        U::close(ctx, item);
    }
    list.handle()
}

pub unsafe extern "C" fn sum_list(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let Some(list) = U::as_list(ctx, args[0]) else {
        if !U::err_occurred(ctx) {
            U::err_set_message(ctx, "sum_list expects a list");
        }
        return Handle::NULL;
    };
    let len = U::list_len(ctx, list);
    let mut total = 0;
    for i in 0..len {
        let item = U::list_get_item(ctx, list, i);
        total += U::long_as_i64(ctx, item);
        U::close(ctx, item);
    }
    if U::err_occurred(ctx) {
        return Handle::NULL;
    }
    U::long_from_i64(ctx, total)
}

pub unsafe extern "C" fn get_item(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let index = U::long_as_i64(ctx, args[1]);
    match U::as_list(ctx, args[0]) {
        Some(list) => U::list_get_item(ctx, list, index as isize),
        None => Handle::NULL,
    }
}

pub unsafe extern "C" fn leak_one(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    U::long_from_i64(ctx, 7);
    U::none(ctx)
}

pub unsafe extern "C" fn double_close(
    ctx: ContextPtr,
    _args: *const Handle,
    _nargs: usize,
) -> Handle {
    let value = U::long_from_i64(ctx, 1);
    U::close(ctx, value);
    if U::close(ctx, value) != 0 {
        return Handle::NULL;
    }
    U::none(ctx)
}

pub unsafe extern "C" fn dup_and_close(
    ctx: ContextPtr,
    args: *const Handle,
    nargs: usize,
) -> Handle {
    let args = argv(args, nargs);
    let copy = U::dup(ctx, args[0]);
    U::close(ctx, args[0]);
    copy
}

pub unsafe extern "C" fn stash_arg(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    STASHED_HANDLE.with(|stash| stash.set(args[0]));
    U::none(ctx)
}

pub unsafe extern "C" fn use_stash(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    let stale = STASHED_HANDLE.with(Cell::get);
    let value = U::long_as_i64(ctx, stale);
    if U::err_occurred(ctx) {
        return Handle::NULL;
    }
    U::long_from_i64(ctx, value)
}

pub unsafe extern "C" fn retain_ctx(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    RETAINED_CTX.with(|retained| retained.set(ctx));
    U::none(ctx)
}

pub unsafe extern "C" fn use_retained_ctx(
    _ctx: ContextPtr,
    _args: *const Handle,
    _nargs: usize,
) -> Handle {
    let retained = RETAINED_CTX.with(Cell::get);
    U::long_from_i64(retained, 5)
}

pub unsafe extern "C" fn store_field(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let heap = U::field_store(ctx, args[0], 0, args[1]);
    if heap.is_null() {
        return Handle::NULL;
    }
    STASHED_HEAP.with(|stash| stash.set(heap));
    U::none(ctx)
}

pub unsafe extern "C" fn load_field(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    let heap = STASHED_HEAP.with(Cell::get);
    U::field_load(ctx, heap)
}

pub unsafe extern "C" fn buffer_len(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let Some(mut buffer) = U::buffer_acquire(ctx, args[0]) else {
        return Handle::NULL;
    };
    let len = buffer.as_slice().len();
    U::buffer_release(ctx, &mut buffer);
    U::long_from_i64(ctx, len as i64)
}

pub unsafe extern "C" fn buffer_copy(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let Some(mut buffer) = U::buffer_acquire(ctx, args[0]) else {
        return Handle::NULL;
    };
    let copy = U::bytes_from_buffer(ctx, &buffer);
    U::buffer_release(ctx, &mut buffer);
    copy
}

pub unsafe extern "C" fn buffer_after_release(
    ctx: ContextPtr,
    args: *const Handle,
    nargs: usize,
) -> Handle {
    let args = argv(args, nargs);
    let Some(mut buffer) = U::buffer_acquire(ctx, args[0]) else {
        return Handle::NULL;
    };
    let kept: RawBuffer = buffer;
    U::buffer_release(ctx, &mut buffer);
    U::bytes_from_buffer(ctx, &kept)
}

/// Reads the first byte of a buffer after releasing it; only meaningful under debug shadowing.
pub unsafe extern "C" fn peek_after_release(
    ctx: ContextPtr,
    args: *const Handle,
    nargs: usize,
) -> Handle {
    let args = argv(args, nargs);
    let Some(mut buffer) = U::buffer_acquire(ctx, args[0]) else {
        return Handle::NULL;
    };
    let kept: RawBuffer = buffer;
    U::buffer_release(ctx, &mut buffer);
    let first = kept.as_slice().first().copied().unwrap_or(0);
    U::long_from_i64(ctx, i64::from(first))
}

pub unsafe extern "C" fn bytes_hello(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    U::bytes_from_slice(ctx, b"hello")
}

pub unsafe extern "C" fn fail_with_message(
    ctx: ContextPtr,
    _args: *const Handle,
    _nargs: usize,
) -> Handle {
    U::err_set_message(ctx, "boom");
    Handle::NULL
}

pub unsafe extern "C" fn clear_and_return(
    ctx: ContextPtr,
    _args: *const Handle,
    _nargs: usize,
) -> Handle {
    U::err_set_message(ctx, "transient");
    U::err_clear(ctx);
    U::none(ctx)
}

pub unsafe extern "C" fn null_without_error(
    _ctx: ContextPtr,
    _args: *const Handle,
    _nargs: usize,
) -> Handle {
    Handle::NULL
}

pub unsafe extern "C" fn count_args(ctx: ContextPtr, _args: *const Handle, nargs: usize) -> Handle {
    U::long_from_i64(ctx, nargs as i64)
}

pub unsafe extern "C" fn legacy_first(args: *const LegacyRef, nargs: usize) -> LegacyRef {
    if args.is_null() || nargs == 0 {
        return LegacyRef::NULL;
    }
    *args
}

pub unsafe extern "C" fn legacy_round_trip(
    ctx: ContextPtr,
    args: *const Handle,
    nargs: usize,
) -> Handle {
    let args = argv(args, nargs);
    let reference = U::as_legacy(ctx, args[0]);
    U::from_legacy(ctx, reference)
}

pub unsafe extern "C" fn direct_add(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = argv(args, nargs);
    let a = V::long_as_i64(ctx, args[0]);
    let b = V::long_as_i64(ctx, args[1]);
    if V::err_occurred(ctx) {
        return Handle::NULL;
    }
    V::long_from_i64(ctx, a + b)
}

pub unsafe extern "C" fn direct_leak(ctx: ContextPtr, _args: *const Handle, _nargs: usize) -> Handle {
    V::long_from_i64(ctx, 11);
    V::none(ctx)
}

fn standard(name: &str, arity: usize, func: StandardFn) -> FunctionDef {
    FunctionDef::standard(name, Arity::Fixed(arity), func)
}

/// Universal extension exporting every sample function.
pub fn sample_extension(requested: u32) -> ExtensionDescriptor {
    ExtensionDescriptor::universal("sample", requested)
        .with_function(
            standard("add", 2, add_ints).with_optimized("ii->i", add_ints_fast as OptimizedFn),
        )
        .with_function(standard("scale", 2, scale).with_optimized("id->d", scale_fast))
        .with_function(standard("make_list", 1, make_list))
        .with_function(standard("sum_list", 1, sum_list))
        .with_function(standard("get_item", 2, get_item))
        .with_function(standard("leak_one", 0, leak_one))
        .with_function(standard("double_close", 0, double_close))
        .with_function(standard("dup_and_close", 1, dup_and_close))
        .with_function(standard("stash_arg", 1, stash_arg))
        .with_function(standard("use_stash", 0, use_stash))
        .with_function(standard("retain_ctx", 0, retain_ctx))
        .with_function(standard("use_retained_ctx", 0, use_retained_ctx))
        .with_function(standard("store_field", 2, store_field))
        .with_function(standard("load_field", 0, load_field))
        .with_function(standard("buffer_len", 1, buffer_len))
        .with_function(standard("buffer_copy", 1, buffer_copy))
        .with_function(standard("buffer_after_release", 1, buffer_after_release))
        .with_function(standard("peek_after_release", 1, peek_after_release))
        .with_function(standard("bytes_hello", 0, bytes_hello))
        .with_function(standard("fail", 0, fail_with_message))
        .with_function(standard("clear_and_return", 0, clear_and_return))
        .with_function(standard("null_without_error", 0, null_without_error))
        .with_function(FunctionDef::standard(
            "count_args",
            Arity::Variadic,
            count_args,
        ))
        .with_function(FunctionDef::legacy(
            "legacy_first",
            Arity::Fixed(1),
            legacy_first as LegacyFn,
        ))
        .with_function(standard("legacy_round_trip", 1, legacy_round_trip))
}

/// Extension bound to this host build.
pub fn direct_extension(host_tag: u64) -> ExtensionDescriptor {
    ExtensionDescriptor::version_specific("direct", LATEST_VERSION, host_tag)
        .with_function(standard("add", 2, direct_add))
        .with_function(standard("leak", 0, direct_leak))
}

static RAW_FUNCTIONS: [RawFunctionDef; 1] = [RawFunctionDef {
    name: AbiString::from_static("add"),
    convention: CONVENTION_STANDARD,
    arity: 2,
    standard: Some(add_ints as StandardFn),
    legacy: None,
    optimized: Some(add_ints_fast as OptimizedFn),
    signature: AbiString::from_static("ii->i"),
}];

static RAW_DESCRIPTOR: RawDescriptor = RawDescriptor {
    struct_version: DESCRIPTOR_STRUCT_VERSION,
    abi_major: 0,
    abi_minor: 1,
    requested_vtable_version: 1,
    layout: 0,
    host_tag: 0,
    name: AbiString::from_static("raw_sample"),
    functions: &RAW_FUNCTIONS as *const [RawFunctionDef; 1] as *const RawFunctionDef,
    function_count: 1,
};

pub unsafe extern "C" fn raw_entry() -> *const RawDescriptor {
    &RAW_DESCRIPTOR
}
