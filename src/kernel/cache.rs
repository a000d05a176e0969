//! Versioned kernel cache.
//!
//! Keyed by signature fingerprint; a lookup hits only when the stored
//! version string matches and the entry has not expired. Expiry is
//! half-open: an entry whose `created_at + ttl` equals "now" is already
//! expired. When occupancy crosses the eviction threshold, expired
//! entries go first, then ascending (last access, access count) order
//! until occupancy drops back under the threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::bounded;

use crate::config::CacheConfig;
use crate::error::{GpuError, GpuResult};
use crate::kernel::persist::DiskEntry;
use crate::kernel::{load_directory, persist_directory, KernelArtifact, KernelMetadata};
use crate::stream::AsyncHandle;

/// One cached compiled kernel.
pub struct CachedKernel {
    artifact: Arc<KernelArtifact>,
    version: String,
    ttl: Duration,
    created_at: Instant,
    created_unix: u64,
    last_access: RwLock<Instant>,
    access_count: AtomicU64,
    metadata: KernelMetadata,
}

impl CachedKernel {
    fn new(
        artifact: Arc<KernelArtifact>,
        version: String,
        ttl: Duration,
        metadata: KernelMetadata,
    ) -> Self {
        let now = Instant::now();
        Self {
            artifact,
            version,
            ttl,
            created_at: now,
            created_unix: unix_now(),
            last_access: RwLock::new(now),
            access_count: AtomicU64::new(0),
            metadata,
        }
    }

    pub fn artifact(&self) -> &Arc<KernelArtifact> {
        &self.artifact
    }

    /// The version string is immutable for the life of the entry.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &KernelMetadata {
        &self.metadata
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.read().unwrap()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn touch(&self) {
        *self.last_access.write().unwrap() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Half-open expiry: exactly-at-deadline counts as expired.
    fn is_expired(&self, now: Instant) -> bool {
        match self.created_at.checked_add(self.ttl) {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Cache effectiveness counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheShared {
    config: CacheConfig,
    entries: RwLock<HashMap<u64, Arc<CachedKernel>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    /// Serializes persist/preload against each other.
    disk_lock: Mutex<()>,
}

/// Accelerator-scoped kernel cache.
#[derive(Clone)]
pub struct KernelCache {
    shared: Arc<CacheShared>,
}

impl KernelCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                config,
                entries: RwLock::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
                disk_lock: Mutex::new(()),
            }),
        }
    }

    /// Hit iff the key is present, the version matches, and the entry
    /// has not expired.
    pub fn try_get(&self, key: u64, version: &str) -> Option<Arc<CachedKernel>> {
        let entries = self.shared.entries.read().unwrap();
        let hit = entries
            .get(&key)
            .filter(|e| e.version == version && !e.is_expired(Instant::now()))
            .cloned();
        drop(entries);
        match hit {
            Some(entry) => {
                entry.touch();
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace. Runs the eviction pipeline first when
    /// occupancy has reached the threshold.
    pub fn put(
        &self,
        key: u64,
        artifact: KernelArtifact,
        version: impl Into<String>,
        metadata: KernelMetadata,
    ) -> Arc<CachedKernel> {
        let entry = Arc::new(CachedKernel::new(
            Arc::new(artifact),
            version.into(),
            self.shared.config.default_ttl,
            metadata,
        ));
        let mut entries = self.shared.entries.write().unwrap();
        self.sweep_if_needed(&mut entries);
        entries.insert(key, Arc::clone(&entry));
        // Hard bound: size never exceeds max_size.
        while entries.len() > self.shared.config.max_size {
            self.evict_one(&mut entries);
        }
        entry
    }

    fn threshold_size(&self) -> f64 {
        self.shared.config.eviction_threshold * self.shared.config.max_size as f64
    }

    fn sweep_if_needed(&self, entries: &mut HashMap<u64, Arc<CachedKernel>>) {
        if (entries.len() as f64) < self.threshold_size() {
            return;
        }
        // Stage 1: drop everything expired.
        let now = Instant::now();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(&k, _)| k)
            .collect();
        for key in expired {
            entries.remove(&key);
            self.shared.expirations.fetch_add(1, Ordering::Relaxed);
        }
        // Stage 2: LRU until back under the threshold.
        while entries.len() as f64 >= self.threshold_size() && !entries.is_empty() {
            self.evict_one(entries);
        }
    }

    fn evict_one(&self, entries: &mut HashMap<u64, Arc<CachedKernel>>) {
        let victim = entries
            .iter()
            .min_by_key(|(_, e)| (e.last_access(), e.access_count()))
            .map(|(&k, _)| k);
        if let Some(key) = victim {
            entries.remove(&key);
            self.shared.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every entry carrying `version`.
    pub fn invalidate_version(&self, version: &str) -> usize {
        let mut entries = self.shared.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.version != version);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.shared.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            expirations: self.shared.expirations.load(Ordering::Relaxed),
        }
    }

    /// Write a point-in-time snapshot to the configured directory.
    /// Idempotent; a no-op when persistence is disabled.
    pub fn persist(&self) -> GpuResult<()> {
        if !self.shared.config.persistent {
            return Ok(());
        }
        let Some(dir) = self.shared.config.directory.clone() else {
            return Err(GpuError::unsupported(
                "cache.persistent is set without cache.directory",
            ));
        };
        // Snapshot under the read lock, write without it.
        let snapshot: Vec<DiskEntry> = {
            let entries = self.shared.entries.read().unwrap();
            let now = Instant::now();
            entries
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(&key, e)| DiskEntry {
                    key,
                    version: e.version.clone(),
                    ttl: e.ttl,
                    created_unix: e.created_unix,
                    access_count: e.access_count(),
                    artifact: (*e.artifact).clone(),
                    metadata: e.metadata.clone(),
                })
                .collect()
        };
        let _disk = self.shared.disk_lock.lock().unwrap();
        persist_directory(&dir, &snapshot)
    }

    /// Load persisted entries. Idempotent; a no-op when persistence is
    /// disabled. Unknown manifest schemas and corrupt files are skipped,
    /// never fatal.
    pub fn preload(&self) -> GpuResult<usize> {
        if !self.shared.config.persistent {
            return Ok(0);
        }
        let Some(dir) = self.shared.config.directory.clone() else {
            return Err(GpuError::unsupported(
                "cache.persistent is set without cache.directory",
            ));
        };
        let loaded = {
            let _disk = self.shared.disk_lock.lock().unwrap();
            load_directory(&dir)
        };
        let now_unix = unix_now();
        let mut inserted = 0;
        let mut entries = self.shared.entries.write().unwrap();
        for disk in loaded {
            let elapsed = Duration::from_secs(now_unix.saturating_sub(disk.created_unix));
            if elapsed >= disk.ttl {
                continue; // expired on disk
            }
            if entries.len() >= self.shared.config.max_size {
                break;
            }
            let created_at = Instant::now()
                .checked_sub(elapsed)
                .unwrap_or_else(Instant::now);
            let entry = Arc::new(CachedKernel {
                artifact: Arc::new(disk.artifact),
                version: disk.version,
                ttl: disk.ttl,
                created_at,
                created_unix: disk.created_unix,
                last_access: RwLock::new(created_at),
                access_count: AtomicU64::new(disk.access_count),
                metadata: disk.metadata,
            });
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(disk.key) {
                slot.insert(entry);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn persist_async(&self) -> AsyncHandle<()> {
        let cache = self.clone();
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(cache.persist());
        });
        AsyncHandle::new(rx)
    }

    pub fn preload_async(&self) -> AsyncHandle<usize> {
        let cache = self.clone();
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(cache.preload());
        });
        AsyncHandle::new(rx)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElemType;
    use crate::kernel::ParamSpec;

    fn artifact(name: &str) -> KernelArtifact {
        KernelArtifact::host_fn(name, &[ParamSpec::view(ElemType::F32)])
    }

    fn cache(max_size: usize, threshold: f64) -> KernelCache {
        KernelCache::new(CacheConfig {
            max_size,
            eviction_threshold: threshold,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn version_mismatch_is_a_miss() {
        let c = cache(16, 0.9);
        c.put(1, artifact("k"), "1.0.0", KernelMetadata::new());
        assert!(c.try_get(1, "1.0.0").is_some());
        assert!(c.try_get(1, "2.0.0").is_none());
        assert_eq!(c.invalidate_version("1.0.0"), 1);
        assert!(c.try_get(1, "1.0.0").is_none());
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn lru_eviction_spares_recently_used() {
        // MaxSize=3, threshold=0.8: the sweep triggers at 3 entries.
        let c = cache(3, 0.8);
        c.put(1, artifact("k1"), "v", KernelMetadata::new());
        std::thread::sleep(Duration::from_millis(2));
        c.put(2, artifact("k2"), "v", KernelMetadata::new());
        std::thread::sleep(Duration::from_millis(2));
        assert!(c.try_get(1, "v").is_some()); // refresh k1
        c.put(3, artifact("k3"), "v", KernelMetadata::new());
        c.put(4, artifact("k4"), "v", KernelMetadata::new());
        assert!(c.try_get(1, "v").is_some());
        assert!(c.try_get(2, "v").is_none(), "k2 was least recently used");
        assert!(c.try_get(3, "v").is_some());
        assert!(c.try_get(4, "v").is_some());
    }

    #[test]
    fn sweep_brings_occupancy_under_threshold() {
        let c = cache(4, 0.5);
        c.put(1, artifact("k1"), "v", KernelMetadata::new());
        std::thread::sleep(Duration::from_millis(2));
        c.put(2, artifact("k2"), "v", KernelMetadata::new());
        // 2/4 == 0.5 >= threshold: the next put sweeps down to 1 entry
        // before inserting.
        c.put(3, artifact("k3"), "v", KernelMetadata::new());
        assert_eq!(c.len(), 2);
        assert!(c.try_get(1, "v").is_none(), "oldest entry evicted");
        assert!(c.stats().evictions >= 1);
    }

    #[test]
    fn size_never_exceeds_max() {
        let c = cache(4, 1.0);
        for key in 0..32u64 {
            c.put(key, artifact("k"), "v", KernelMetadata::new());
            assert!(c.len() <= 4);
        }
    }

    #[test]
    fn ttl_boundary_is_half_open() {
        let c = KernelCache::new(CacheConfig {
            max_size: 4,
            default_ttl: Duration::ZERO,
            ..CacheConfig::default()
        });
        c.put(1, artifact("k"), "v", KernelMetadata::new());
        // created_at + 0 == now: already expired.
        assert!(c.try_get(1, "v").is_none());
    }

    #[test]
    fn clear_empties_everything() {
        let c = cache(8, 0.9);
        c.put(1, artifact("a"), "v", KernelMetadata::new());
        c.put(2, artifact("b"), "v", KernelMetadata::new());
        c.clear();
        assert!(c.is_empty());
    }
}
