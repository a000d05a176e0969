//! End-to-end scenarios on the CPU simulator backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accel_runtime::{
    BackendKind, CancelToken, Context, ElemType, ErrorKind, GpuResult, KernelArtifact,
    KernelSignature, LaunchArg, LaunchDims, LaunchStatus, LayoutHint, MigrateTo, OptLevel,
    ParamSpec, RuntimeConfig, Shape,
};

fn iota_signature() -> (KernelSignature, Vec<ParamSpec>) {
    let specs = vec![
        ParamSpec::view(ElemType::I32),
        ParamSpec::scalar(ElemType::U64),
    ];
    (
        KernelSignature::new("test.iota", specs.clone(), BackendKind::Cpu, OptLevel::Default),
        specs,
    )
}

fn register_iota(accel: &accel_runtime::Accelerator) {
    accel
        .register_host_kernel("test.iota", |args, _dims| {
            let out = args.view_mut::<i32>(0)?;
            let len = (args.scalar::<u64>(1)? as usize).min(out.len());
            for (i, slot) in out.iter_mut().enumerate().take(len) {
                *slot = i as i32;
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn basic_launch_writes_indices() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    register_iota(&accel);

    let (signature, specs) = iota_signature();
    let launcher = accel
        .load_kernel_cached(signature, "1.0.0", || {
            Ok(KernelArtifact::host_fn("test.iota", &specs))
        })
        .unwrap();

    let buf = accel
        .alloc::<i32>(Shape::d1(1000), LayoutHint::GpuOptimized)
        .unwrap();
    launcher
        .launch_blocking(
            LaunchDims::linear(1000, 256),
            vec![buf.arg().unwrap(), LaunchArg::U64(1000)],
            accel.default_stream(),
        )
        .unwrap();

    let mut result = vec![0i32; 1000];
    buf.copy_to_host(&mut result).unwrap();
    for (i, &v) in result.iter().enumerate() {
        assert_eq!(v, i as i32);
    }
}

#[test]
fn host_round_trip_is_bitwise() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();

    let xs: Vec<f32> = (0..257).map(|i| (i as f32).sin()).collect();
    let buf = accel
        .alloc::<f32>(Shape::d1(xs.len()), LayoutHint::GpuOptimized)
        .unwrap();
    buf.copy_from_host(&xs, None).unwrap();
    let mut back = vec![0f32; xs.len()];
    buf.copy_to_host(&mut back).unwrap();
    assert_eq!(
        xs.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        back.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    );

    let ys: Vec<half::f16> = (0..100).map(|i| half::f16::from_f32(i as f32)).collect();
    let hbuf = accel
        .alloc::<half::f16>(Shape::d1(ys.len()), LayoutHint::CpuOptimized)
        .unwrap();
    hbuf.copy_from_host(&ys, None).unwrap();
    let mut hback = vec![half::f16::ZERO; ys.len()];
    hbuf.copy_to_host(&mut hback).unwrap();
    assert_eq!(ys, hback);
}

#[test]
fn disposed_buffer_rejects_everything() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let mut buf = accel
        .alloc::<f32>(Shape::d1(64), LayoutHint::GpuOptimized)
        .unwrap();
    buf.dispose().unwrap();

    assert_eq!(
        buf.copy_from_host(&[0.0; 64], None).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    let mut out = [0f32; 64];
    assert_eq!(
        buf.copy_to_host(&mut out).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        buf.fill_zero(None).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(buf.view().unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(buf.arg().unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(buf.dispose().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn pool_reuse_returns_the_same_buffer() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();

    let a = accel.rent::<i32>(1000).unwrap();
    let id = a.id();
    accel.pool().give_back(a, false).unwrap();
    let a2 = accel.rent::<i32>(1000).unwrap();
    assert_eq!(a2.id(), id);
    assert!(a2.len() >= 1000);
    assert_eq!(accel.pool().stats().hits, 1);
}

#[test]
fn unified_coherence_across_migrations() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    accel
        .register_host_kernel("test.increment", |args, _dims| {
            let data = args.view_mut::<i32>(0)?;
            for v in data.iter_mut() {
                *v += 1;
            }
            Ok(())
        })
        .unwrap();

    let u = accel.alloc_unified::<i32>(100).unwrap();
    u.write_host(|h| h[5] = 42).unwrap();
    assert!(!u.device_valid());

    u.ensure_device().unwrap();
    assert!(u.device_valid() && u.host_valid());

    let specs = vec![ParamSpec::view(ElemType::I32)];
    let signature =
        KernelSignature::new("test.increment", specs.clone(), BackendKind::Cpu, OptLevel::Default);
    let launcher = accel
        .load_kernel_cached(signature, "1", || {
            Ok(KernelArtifact::host_fn("test.increment", &specs))
        })
        .unwrap();
    launcher
        .launch_blocking(
            LaunchDims::linear(100, 128),
            vec![u.device_arg_mut().unwrap()],
            accel.default_stream(),
        )
        .unwrap();
    assert!(!u.host_valid(), "device mutation invalidates the host side");

    u.ensure_host().unwrap();
    assert_eq!(u.read_host(|h| h[5]).unwrap(), 43);
}

#[test]
fn unified_async_migration_on_a_stream() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let u = accel.alloc_unified::<f32>(16).unwrap();
    u.write_host(|h| h[0] = 7.0).unwrap();

    let stream = accel.create_stream().unwrap();
    u.migrate_async(MigrateTo::Device, &stream)
        .unwrap()
        .wait()
        .unwrap();
    assert!(u.device_valid());
}

#[test]
fn oom_surfaces_after_one_trim_retry() {
    let mut config = RuntimeConfig::default();
    config.cpu_device_memory = 64 * 1024;
    let ctx = Context::builder().config(config).build().unwrap();
    let accel = ctx.default_accelerator().unwrap();

    // Exhaust the device with held (not returned) rentals.
    let mut held = Vec::new();
    loop {
        match accel.rent::<u8>(16 * 1024) {
            Ok(buf) => held.push(buf),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::OutOfMemory);
                assert!(
                    e.suggestions().iter().any(|s| s.contains("pool.trim")),
                    "OOM carries the trim suggestion"
                );
                break;
            }
        }
        assert!(held.len() < 64, "capacity should bound the rentals");
    }
    let stats = accel.pool().stats();
    assert_eq!(stats.in_use, held.len());
    assert_eq!(stats.total_buffers, 0);

    // Return one rental to the pool (it stays resident under Adaptive
    // retention), then ask for the same bytes under a different element
    // type: the fresh allocation only fits after recovery trims the
    // pool's residency.
    accel.pool().give_back(held.pop().unwrap(), false).unwrap();
    assert_eq!(accel.pool().stats().total_buffers, 1);
    let recovered = accel.rent::<i32>(4 * 1024);
    assert!(recovered.is_ok(), "trim during recovery frees pool residency");
    assert_eq!(accel.pool().stats().total_buffers, 0);
}

#[test]
fn concurrent_cached_loads_compile_once() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    register_iota(&accel);

    let compiles = Arc::new(AtomicU32::new(0));
    let rendezvous = Arc::new(std::sync::Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let accel = accel.clone();
        let compiles = Arc::clone(&compiles);
        let rendezvous = Arc::clone(&rendezvous);
        handles.push(std::thread::spawn(move || -> GpuResult<()> {
            rendezvous.wait();
            let (signature, specs) = iota_signature();
            accel.load_kernel_cached(signature, "7.7.7", || {
                compiles.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(25));
                Ok(KernelArtifact::host_fn("test.iota", &specs))
            })?;
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(compiles.load(Ordering::SeqCst), 1, "source_fn ran once");
}

#[test]
fn concurrent_failed_compiles_share_the_error() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();

    let compiles = Arc::new(AtomicU32::new(0));
    let rendezvous = Arc::new(std::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let accel = accel.clone();
        let compiles = Arc::clone(&compiles);
        let rendezvous = Arc::clone(&rendezvous);
        handles.push(std::thread::spawn(move || {
            rendezvous.wait();
            let specs = vec![ParamSpec::view(ElemType::F32)];
            let signature = KernelSignature::new(
                "test.broken",
                specs,
                BackendKind::Cpu,
                OptLevel::Default,
            );
            accel.load_kernel_cached(signature, "1", || {
                compiles.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(25));
                Err(accel_runtime::GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    "synthetic failure",
                ))
            })
        }));
    }
    let mut failures = 0;
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KernelCompilationFailed);
        failures += 1;
    }
    assert_eq!(failures, 4);
    // The barrier admits one compile per concurrent group; losers share
    // the winner's error instead of recompiling.
    assert!(compiles.load(Ordering::SeqCst) <= 2);
}

#[test]
fn launch_async_reports_elapsed_and_cancellation() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    register_iota(&accel);

    let (signature, specs) = iota_signature();
    let launcher = accel
        .load_kernel_cached(signature, "1", || {
            Ok(KernelArtifact::host_fn("test.iota", &specs))
        })
        .unwrap();
    let buf = accel
        .alloc::<i32>(Shape::d1(256), LayoutHint::GpuOptimized)
        .unwrap();

    let done = launcher
        .launch_async(
            LaunchDims::linear(256, 128),
            vec![buf.arg().unwrap(), LaunchArg::U64(256)],
            accel.default_stream(),
            CancelToken::new(),
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(done.status, LaunchStatus::Completed);

    // A token cancelled before the command reaches the device skips it.
    let token = CancelToken::new();
    token.cancel();
    let err = launcher
        .launch_async(
            LaunchDims::linear(256, 128),
            vec![buf.arg().unwrap(), LaunchArg::U64(256)],
            accel.default_stream(),
            token,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn mismatched_launch_arguments_are_rejected() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    register_iota(&accel);

    let (signature, specs) = iota_signature();
    let launcher = accel
        .load_kernel_cached(signature, "1", || {
            Ok(KernelArtifact::host_fn("test.iota", &specs))
        })
        .unwrap();
    let buf = accel
        .alloc::<i32>(Shape::d1(8), LayoutHint::GpuOptimized)
        .unwrap();
    let fbuf = accel
        .alloc::<f32>(Shape::d1(8), LayoutHint::GpuOptimized)
        .unwrap();

    // Arity.
    let err = launcher
        .launch(
            LaunchDims::linear(8, 8),
            vec![buf.arg().unwrap()],
            accel.default_stream(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKernelParameters);

    // Scalar type.
    let err = launcher
        .launch(
            LaunchDims::linear(8, 8),
            vec![buf.arg().unwrap(), LaunchArg::F32(1.0)],
            accel.default_stream(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKernelParameters);

    // View element type.
    let err = launcher
        .launch(
            LaunchDims::linear(8, 8),
            vec![fbuf.arg().unwrap(), LaunchArg::U64(8)],
            accel.default_stream(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKernelParameters);
}

#[test]
fn kernel_cache_version_change_recompiles() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    register_iota(&accel);

    let compiles = Arc::new(AtomicU32::new(0));
    for version in ["1.0.0", "1.0.0", "2.0.0"] {
        let (signature, specs) = iota_signature();
        let compiles = Arc::clone(&compiles);
        accel
            .load_kernel_cached(signature, version, move || {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(KernelArtifact::host_fn("test.iota", &specs))
            })
            .unwrap();
    }
    // Versions 1.0.0 (hit on the second call) and 2.0.0.
    assert_eq!(compiles.load(Ordering::SeqCst), 2);
}

#[test]
fn subview_boundaries_on_buffers() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let buf = accel
        .alloc::<f32>(Shape::d1(10), LayoutHint::GpuOptimized)
        .unwrap();
    buf.copy_from_host(&[1.0; 10], None).unwrap();

    assert_eq!(buf.subview(10, 0).unwrap().len(), 0);
    assert_eq!(
        buf.subview(10, 1).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(buf.subview(2, 5).unwrap().len(), 5);
}

#[test]
fn shutdown_then_use_fails_cleanly() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let buf = accel
        .alloc::<f32>(Shape::d1(16), LayoutHint::GpuOptimized)
        .unwrap();
    accel.shutdown(Duration::from_secs(2));

    assert_eq!(
        accel
            .alloc::<f32>(Shape::d1(16), LayoutHint::GpuOptimized)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
    // Buffers registered with the accelerator were freed at teardown.
    let mut out = [0f32; 16];
    assert_eq!(
        buf.copy_to_host(&mut out).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}
