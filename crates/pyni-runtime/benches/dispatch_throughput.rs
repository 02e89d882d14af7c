use std::slice;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use pyni_runtime::{
    Api, Arity, CallSiteInfo, ContextPtr, ExtensionDescriptor, FunctionDef, Handle, ObjectSpace,
    PrimitiveKind, PrimitiveValue, RcHeap, Runtime, RuntimeConfig, Universal,
};

type U = Api<Universal>;

unsafe extern "C" fn add(ctx: ContextPtr, args: *const Handle, nargs: usize) -> Handle {
    let args = slice::from_raw_parts(args, nargs);
    let sum = U::long_as_i64(ctx, args[0]) + U::long_as_i64(ctx, args[1]);
    U::long_from_i64(ctx, sum)
}

unsafe extern "C" fn add_fast(
    _ctx: ContextPtr,
    args: *const PrimitiveValue,
    _nargs: usize,
    out: *mut PrimitiveValue,
) -> i32 {
    let args = slice::from_raw_parts(args, 2);
    *out = PrimitiveValue::int(args[0].i + args[1].i);
    0
}

fn extension() -> ExtensionDescriptor {
    ExtensionDescriptor::universal("bench", 1).with_function(
        FunctionDef::standard("add", Arity::Fixed(2), add).with_optimized("ii->i", add_fast),
    )
}

fn bench_dispatch(c: &mut Criterion) {
    for (label, config) in [
        ("release", RuntimeConfig::default()),
        ("debug", RuntimeConfig::debug()),
    ] {
        let heap = Arc::new(RcHeap::new());
        let runtime = Runtime::new(config, heap.clone()).expect("runtime");
        let ext = runtime.load(extension()).expect("load");
        let session = runtime.session();
        let args = [heap.new_int(20), heap.new_int(22)];
        let generic = CallSiteInfo::unknown(2);
        let typed = CallSiteInfo::declared(&[PrimitiveKind::Int, PrimitiveKind::Int]);

        c.bench_function(&format!("dispatch_generic_{label}"), |b| {
            b.iter(|| {
                let out = session
                    .call_with(&ext, "add", &args, &generic)
                    .expect("call");
                heap.release(out);
            });
        });
        c.bench_function(&format!("dispatch_optimized_{label}"), |b| {
            b.iter(|| {
                let out = session.call_with(&ext, "add", &args, &typed).expect("call");
                heap.release(out);
            });
        });
    }
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
