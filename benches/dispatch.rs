//! Dispatch-path benchmarks on the CPU simulator.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use accel_runtime::{
    Context, HybridDispatcher, LayoutHint, ReduceOp, Shape, Strategy,
};

fn bench_dispatch(c: &mut Criterion) {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let dispatcher = HybridDispatcher::new(accel.clone());

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let n = 1 << 16;
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let a = accel
        .alloc::<f32>(Shape::d1(n), LayoutHint::GpuOptimized)
        .unwrap();
    let b = accel
        .alloc::<f32>(Shape::d1(n), LayoutHint::GpuOptimized)
        .unwrap();
    let out = accel
        .alloc::<f32>(Shape::d1(n), LayoutHint::GpuOptimized)
        .unwrap();
    a.copy_from_host(&data, None).unwrap();
    b.copy_from_host(&data, None).unwrap();

    let mut group = c.benchmark_group("dispatch");
    group.bench_function("add_cpu_simd_64k", |bench| {
        bench.iter(|| {
            dispatcher
                .add(black_box(&a), black_box(&b), &out, Strategy::CpuSimd)
                .unwrap()
        })
    });
    group.bench_function("add_device_64k", |bench| {
        bench.iter(|| {
            dispatcher
                .add(black_box(&a), black_box(&b), &out, Strategy::GpuGeneral)
                .unwrap()
        })
    });
    group.bench_function("reduce_sum_64k", |bench| {
        bench.iter(|| {
            dispatcher
                .reduce(black_box(&a), ReduceOp::Sum, Strategy::CpuSimd)
                .unwrap()
        })
    });
    group.finish();

    let m = 128;
    let mat: Vec<f32> = (0..m * m).map(|i| (i % 17) as f32).collect();
    let ma = accel
        .alloc::<f32>(Shape::d2(m, m), LayoutHint::GpuOptimized)
        .unwrap();
    let mb = accel
        .alloc::<f32>(Shape::d2(m, m), LayoutHint::GpuOptimized)
        .unwrap();
    let mout = accel
        .alloc::<f32>(Shape::d2(m, m), LayoutHint::GpuOptimized)
        .unwrap();
    ma.copy_from_host(&mat, None).unwrap();
    mb.copy_from_host(&mat, None).unwrap();

    c.bench_function("matmul_128_cpu_simd", |bench| {
        bench.iter(|| {
            dispatcher
                .matmul(&ma, &mb, &mout, m, m, m, Strategy::CpuSimd)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
