//! Property tests for the kernel cache and the memory pool, plus the
//! persistent-cache round trip.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use accel_runtime::{
    BackendKind, CacheConfig, Context, ElemType, KernelArtifact, KernelCache, KernelMetadata,
    KernelSignature, OptLevel, ParamSpec, RuntimeConfig,
};

fn artifact(name: &str) -> KernelArtifact {
    KernelArtifact::host_fn(name, &[ParamSpec::view(ElemType::F32)])
}

proptest! {
    /// Entries stored under one version never answer lookups for another.
    #[test]
    fn version_mismatch_is_always_a_miss(
        keys in proptest::collection::vec(0u64..32, 1..64),
        v1 in "[a-z]{1,6}",
        v2 in "[a-z]{1,6}",
    ) {
        prop_assume!(v1 != v2);
        let cache = KernelCache::new(CacheConfig::default());
        for &key in &keys {
            cache.put(key, artifact("k"), v1.clone(), KernelMetadata::new());
        }
        for &key in &keys {
            prop_assert!(cache.try_get(key, &v2).is_none());
            prop_assert!(cache.try_get(key, &v1).is_some());
        }
    }

    /// Occupancy never exceeds max_size, whatever the operation mix.
    #[test]
    fn size_bound_holds_under_arbitrary_ops(
        ops in proptest::collection::vec((0u64..64, 0u8..4), 1..256),
        max_size in 1usize..12,
        threshold in 0.3f64..1.0,
    ) {
        let cache = KernelCache::new(CacheConfig {
            max_size,
            eviction_threshold: threshold,
            ..CacheConfig::default()
        });
        for (key, op) in ops {
            match op {
                0..=1 => {
                    cache.put(key, artifact("k"), "v", KernelMetadata::new());
                }
                2 => {
                    let _ = cache.try_get(key, "v");
                }
                _ => {
                    cache.invalidate_version("v");
                }
            }
            prop_assert!(cache.len() <= max_size);
        }
    }

}

proptest! {
    // Each case spins up a full context; keep the count modest.
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// A rent after a return always satisfies the requested length, and
    /// reuses the returned buffer inside the retention window.
    #[test]
    fn pool_rent_after_return_reuses(len in 1usize..4096) {
        let ctx = Context::new().unwrap();
        let accel = ctx.default_accelerator().unwrap();
        let buf = accel.rent::<f32>(len).unwrap();
        let id = buf.id();
        accel.pool().give_back(buf, false).unwrap();
        let again = accel.rent::<f32>(len).unwrap();
        prop_assert!(again.len() >= len);
        prop_assert_eq!(again.id(), id);
    }
}

#[test]
fn repeated_identical_rents_count_as_hits() {
    let ctx = Context::new().unwrap();
    let accel = ctx.default_accelerator().unwrap();
    let before = accel.pool().stats();
    for _ in 0..5 {
        let buf = accel.rent::<f32>(512).unwrap();
        accel.pool().give_back(buf, false).unwrap();
    }
    let after = accel.pool().stats();
    // First rent misses, the remaining four hit.
    assert_eq!(after.misses, before.misses + 1);
    assert_eq!(after.hits, before.hits + 4);
}

#[test]
fn persistent_cache_survives_context_recreation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.cache.persistent = true;
    config.cache.directory = Some(dir.path().to_path_buf());

    let specs = vec![ParamSpec::view(ElemType::F32)];
    let signature = || {
        KernelSignature::new(
            "persisted.kernel",
            vec![ParamSpec::view(ElemType::F32)],
            BackendKind::Cpu,
            OptLevel::Default,
        )
    };

    {
        let ctx = Context::builder().config(config.clone()).build().unwrap();
        let accel = ctx.default_accelerator().unwrap();
        accel
            .register_host_kernel("persisted.kernel", |_args, _dims| Ok(()))
            .unwrap();
        accel
            .load_kernel_cached(signature(), "3.1.4", || {
                Ok(KernelArtifact::host_fn("persisted.kernel", &specs))
            })
            .unwrap();
        // Dropping the context persists the cache at teardown.
    }

    let compiles = Arc::new(AtomicU32::new(0));
    {
        let ctx = Context::builder().config(config).build().unwrap();
        let accel = ctx.default_accelerator().unwrap();
        accel
            .register_host_kernel("persisted.kernel", |_args, _dims| Ok(()))
            .unwrap();
        let compiles = Arc::clone(&compiles);
        accel
            .load_kernel_cached(signature(), "3.1.4", move || {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(KernelArtifact::host_fn("persisted.kernel", &[]))
            })
            .unwrap();
    }
    assert_eq!(
        compiles.load(Ordering::SeqCst),
        0,
        "the preloaded entry answers without recompiling"
    );
}

#[test]
fn persist_async_and_preload_async_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KernelCache::new(CacheConfig {
        persistent: true,
        directory: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    });
    cache.put(11, artifact("a"), "v1", KernelMetadata::new());
    cache.put(22, artifact("b"), "v1", KernelMetadata::new());
    cache.persist_async().wait().unwrap();

    let fresh = KernelCache::new(CacheConfig {
        persistent: true,
        directory: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    });
    let loaded = fresh.preload_async().wait().unwrap();
    assert_eq!(loaded, 2);
    assert!(fresh.try_get(11, "v1").is_some());
    assert!(fresh.try_get(22, "v1").is_some());
    assert!(fresh.try_get(11, "v2").is_none());
}
