//! Per-accelerator memory pool.
//!
//! Buffers are bucketed by element type. `rent` hands ownership out,
//! returning (via `give_back` or buffer dispose) hands it back; a buffer
//! sitting in the pool is referenced by nobody else. Retention follows
//! the configured policy and a periodic maintenance tick; `trim` flushes
//! everything on demand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use crate::backend::{Allocation, DeviceBackend, QueueHandle};
use crate::buffer::{BufState, BufferInner, Location, MemoryBuffer, Shape};
use crate::config::{PoolConfig, RetentionPolicy};
use crate::device::DeviceId;
use crate::element::{Element, ElemType};
use crate::error::{GpuError, GpuResult};
use crate::stream::AsyncHandle;

/// Adaptive retention holds buffers younger than this.
const ADAPTIVE_MAX_AGE: Duration = Duration::from_secs(120);
/// Adaptive retention holds everything while the hit ratio beats this.
const ADAPTIVE_HIT_RATIO: f64 = 0.7;

/// Pool occupancy and effectiveness counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    /// Buffers currently held by the pool (not rented).
    pub total_buffers: usize,
    /// Buffers rented out and not yet returned.
    pub in_use: usize,
    pub resident_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Retained {
    alloc: Allocation,
    capacity_elems: usize,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<ElemType, Vec<Retained>>,
    resident_bytes: usize,
    rented: HashSet<u64>,
}

pub(crate) struct PoolShared {
    backend: Arc<dyn DeviceBackend>,
    sync_queue: Arc<QueueHandle>,
    device: DeviceId,
    accel_id: u64,
    enabled: bool,
    config: PoolConfig,
    state: Mutex<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl PoolShared {
    fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    /// Take a returned allocation back into the pool (or free it,
    /// depending on policy and bounds). Called from buffer dispose.
    pub(crate) fn retain(&self, elem: ElemType, alloc: Allocation, capacity_elems: usize) {
        let mut state = self.state.lock().unwrap();
        state.rented.remove(&alloc.id);
        if !self.enabled
            || self.config.retention == RetentionPolicy::Immediate
            || alloc.bytes > self.config.max_buffer_bytes
            || alloc.bytes > self.config.max_pool_bytes
        {
            drop(state);
            self.backend.free(&alloc);
            return;
        }
        // Stay under the residency cap by evicting the stalest entries.
        while state.resident_bytes + alloc.bytes > self.config.max_pool_bytes {
            let Some(freed) = evict_oldest(&mut state) else {
                break;
            };
            self.backend.free(&freed);
        }
        state.resident_bytes += alloc.bytes;
        state.buckets.entry(elem).or_default().push(Retained {
            alloc,
            capacity_elems,
            returned_at: Instant::now(),
        });
    }

    /// Free everything currently held.
    fn flush(&self) {
        let drained: Vec<Allocation> = {
            let mut state = self.state.lock().unwrap();
            state.resident_bytes = 0;
            state
                .buckets
                .drain()
                .flat_map(|(_, bucket)| bucket.into_iter().map(|r| r.alloc))
                .collect()
        };
        for alloc in &drained {
            self.backend.free(alloc);
        }
    }

    /// One maintenance tick, applying the retention policy.
    fn maintain(&self) {
        let hit_ratio = self.hit_ratio();
        let now = Instant::now();
        let freed: Vec<Allocation> = {
            let mut state = self.state.lock().unwrap();
            let mut freed = Vec::new();
            let keep = |returned_at: Instant| -> bool {
                let age = now.duration_since(returned_at);
                match self.config.retention {
                    RetentionPolicy::Immediate => false,
                    RetentionPolicy::Fixed => age < self.config.trim_interval,
                    RetentionPolicy::Adaptive => {
                        age < ADAPTIVE_MAX_AGE || hit_ratio > ADAPTIVE_HIT_RATIO
                    }
                }
            };
            for bucket in state.buckets.values_mut() {
                bucket.retain(|r| {
                    if keep(r.returned_at) {
                        true
                    } else {
                        freed.push(r.alloc.clone());
                        false
                    }
                });
            }
            for alloc in &freed {
                state.resident_bytes = state.resident_bytes.saturating_sub(alloc.bytes);
            }
            freed
        };
        if !freed.is_empty() {
            log::debug!(
                "pool maintenance freed {} buffers on {}",
                freed.len(),
                self.device
            );
        }
        for alloc in &freed {
            self.backend.free(alloc);
        }
    }
}

fn evict_oldest(state: &mut PoolState) -> Option<Allocation> {
    let (&elem, index) = state
        .buckets
        .iter()
        .flat_map(|(elem, bucket)| {
            bucket
                .iter()
                .enumerate()
                .map(move |(i, r)| ((elem, i), r.returned_at))
        })
        .min_by_key(|(_, at)| *at)
        .map(|((elem, i), _)| (elem, i))?;
    let bucket = state.buckets.get_mut(&elem)?;
    let retained = bucket.swap_remove(index);
    state.resident_bytes = state.resident_bytes.saturating_sub(retained.alloc.bytes);
    Some(retained.alloc)
}

/// Handle to one accelerator's pool.
#[derive(Clone)]
pub struct MemoryPool {
    pub(crate) shared: Arc<PoolShared>,
    maintenance: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryPool {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        sync_queue: Arc<QueueHandle>,
        device: DeviceId,
        accel_id: u64,
        enabled: bool,
        config: PoolConfig,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            backend,
            sync_queue,
            device,
            accel_id,
            enabled,
            config,
            state: Mutex::new(PoolState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        });
        let maintenance = if enabled && !shared.config.trim_interval.is_zero() {
            let weak = Arc::downgrade(&shared);
            let stop = Arc::clone(&shared.stop);
            let interval = shared.config.trim_interval;
            std::thread::Builder::new()
                .name("accel-pool-maint".into())
                .spawn(move || maintenance_loop(weak, stop, interval))
                .ok()
        } else {
            None
        };
        Self {
            shared,
            maintenance: Arc::new(Mutex::new(maintenance)),
        }
    }

    /// Rent a buffer with `length >= min_len`.
    ///
    /// The smallest retained buffer that satisfies the request wins; on a
    /// size tie the most recently returned one does. With nothing
    /// suitable retained, a fresh allocation is made.
    pub fn rent<E: Element>(&self, min_len: usize) -> GpuResult<MemoryBuffer<E>> {
        let shared = &self.shared;
        let elem = E::ELEM;
        let bytes = min_len * elem.size_bytes();
        let bypass = !shared.enabled || bytes > shared.config.max_buffer_bytes;

        let reused: Option<Retained> = if bypass {
            None
        } else {
            let mut state = shared.state.lock().unwrap();
            let bucket = state.buckets.entry(elem).or_default();
            let best = bucket
                .iter()
                .enumerate()
                .filter(|(_, r)| r.capacity_elems >= min_len)
                .min_by(|(_, a), (_, b)| {
                    a.capacity_elems
                        .cmp(&b.capacity_elems)
                        .then(b.returned_at.cmp(&a.returned_at))
                })
                .map(|(i, _)| i);
            match best {
                Some(i) => {
                    let retained = bucket.swap_remove(i);
                    state.resident_bytes =
                        state.resident_bytes.saturating_sub(retained.alloc.bytes);
                    state.rented.insert(retained.alloc.id);
                    Some(retained)
                }
                None => None,
            }
        };

        let (alloc, capacity_elems) = match reused {
            Some(retained) => {
                shared.hits.fetch_add(1, Ordering::Relaxed);
                (retained.alloc, retained.capacity_elems)
            }
            None => {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                let alloc = shared.backend.alloc(bytes, Location::Device)?;
                if !bypass {
                    shared.state.lock().unwrap().rented.insert(alloc.id);
                }
                (alloc, min_len)
            }
        };

        let inner = Arc::new(BufferInner {
            id: crate::backend::next_resource_id(),
            accel_id: shared.accel_id,
            backend: Arc::clone(&shared.backend),
            sync_queue: Arc::clone(&shared.sync_queue),
            device: shared.device,
            elem,
            location: Location::Device,
            strides: Shape::d1(min_len).contiguous_strides(),
            state: Mutex::new(BufState {
                alloc: Some(alloc),
                disposed: false,
                shape: Shape::d1(min_len),
                capacity_elems,
                pool: if bypass {
                    None
                } else {
                    Some(Arc::downgrade(shared))
                },
            }),
        });
        Ok(MemoryBuffer::from_inner(inner))
    }

    /// Immediate-completion async variant of `rent`.
    pub fn rent_async<E: Element>(&self, min_len: usize) -> AsyncHandle<MemoryBuffer<E>> {
        let (tx, rx) = bounded(1);
        let _ = tx.send(self.rent::<E>(min_len));
        AsyncHandle::new(rx)
    }

    /// Return a buffer to the pool, optionally clearing its contents.
    ///
    /// Returning a disposed buffer, or a buffer owned by a different
    /// accelerator, is a fatal `InvalidArgument`.
    pub fn give_back<E: Element>(&self, buffer: MemoryBuffer<E>, clear: bool) -> GpuResult<()> {
        let shared = &self.shared;
        if buffer.inner.accel_id != shared.accel_id {
            return Err(GpuError::invalid_argument(
                "buffer belongs to a different accelerator",
            )
            .with_device(shared.device));
        }
        if buffer.is_disposed() {
            return Err(buffer.inner.disposed_error());
        }
        if clear {
            let alloc = buffer.inner.checked_alloc()?;
            shared
                .backend
                .fill_zero(&alloc, 0, alloc.bytes, &shared.sync_queue)?;
            shared.backend.queue_sync(&shared.sync_queue)?;
        }
        // Route through the pool regardless of how the buffer was
        // allocated: ownership transfers in here.
        buffer
            .inner
            .state
            .lock()
            .unwrap()
            .pool
            .get_or_insert_with(|| Arc::downgrade(shared));
        buffer.inner.dispose_inner()
    }

    /// Free every retained buffer now.
    pub fn trim(&self) {
        self.shared.flush();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().unwrap();
        PoolStats {
            total_buffers: state.buckets.values().map(Vec::len).sum(),
            in_use: state.rented.len(),
            resident_bytes: state.resident_bytes,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    /// Stop the maintenance thread and flush. Called at accelerator
    /// teardown.
    pub(crate) fn shutdown(&self) {
        {
            let (lock, cv) = &*self.shared.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.flush();
    }
}

fn maintenance_loop(
    pool: Weak<PoolShared>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    interval: Duration,
) {
    let (lock, cv) = &*stop;
    loop {
        let guard = lock.lock().unwrap();
        let (guard, _) = cv
            .wait_timeout_while(guard, interval, |stopped| !*stopped)
            .unwrap();
        if *guard {
            return;
        }
        drop(guard);
        match pool.upgrade() {
            Some(pool) => pool.maintain(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::config::RuntimeConfig;

    fn pool_with(config: PoolConfig) -> MemoryPool {
        let backend = CpuBackend::new(&RuntimeConfig::default());
        let device = backend.device_id();
        let queue = Arc::new(backend.create_queue().unwrap());
        let accel_id = crate::backend::next_resource_id();
        MemoryPool::new(backend, queue, device, accel_id, true, config)
    }

    fn pool() -> MemoryPool {
        pool_with(PoolConfig::default())
    }

    #[test]
    fn rent_return_rent_reuses_the_buffer() {
        let p = pool();
        let a = p.rent::<f32>(1000).unwrap();
        let id = a.id();
        p.give_back(a, false).unwrap();
        let a2 = p.rent::<f32>(1000).unwrap();
        assert_eq!(a2.id(), id);
        let stats = p.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient() {
        let p = pool();
        let small = p.rent::<f32>(100).unwrap();
        let big = p.rent::<f32>(10_000).unwrap();
        let (small_id, big_id) = (small.id(), big.id());
        p.give_back(big, false).unwrap();
        p.give_back(small, false).unwrap();
        let hit = p.rent::<f32>(50).unwrap();
        assert_eq!(hit.id(), small_id);
        let hit2 = p.rent::<f32>(5_000).unwrap();
        assert_eq!(hit2.id(), big_id);
    }

    #[test]
    fn buckets_are_per_element_type() {
        let p = pool();
        let a = p.rent::<f32>(256).unwrap();
        let a_id = a.id();
        p.give_back(a, false).unwrap();
        // Same byte size, different element type: no reuse.
        let b = p.rent::<i32>(256).unwrap();
        assert_ne!(b.id(), a_id);
        assert_eq!(p.stats().hits, 0);
    }

    #[test]
    fn oversized_buffers_bypass_the_pool() {
        let mut config = PoolConfig::default();
        config.max_buffer_bytes = 1024;
        let p = pool_with(config);
        let big = p.rent::<f32>(1024).unwrap(); // 4 KiB > 1 KiB cap
        let big_id = big.id();
        p.give_back(big, false).unwrap();
        assert_eq!(p.stats().total_buffers, 0);
        let again = p.rent::<f32>(1024).unwrap();
        assert_ne!(again.id(), big_id);
    }

    #[test]
    fn alien_and_disposed_returns_are_fatal() {
        let p = pool();
        let other = pool();
        let buf = other.rent::<f32>(16).unwrap();
        let err = p.give_back(buf, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        let mut mine = p.rent::<f32>(16).unwrap();
        mine.dispose().unwrap();
        let err = p.give_back(mine, false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn trim_flushes_residency() {
        let p = pool();
        let a = p.rent::<f32>(512).unwrap();
        p.give_back(a, false).unwrap();
        assert!(p.stats().resident_bytes > 0);
        p.trim();
        let stats = p.stats();
        assert_eq!(stats.total_buffers, 0);
        assert_eq!(stats.resident_bytes, 0);
    }

    #[test]
    fn residency_cap_is_respected() {
        let mut config = PoolConfig::default();
        config.max_pool_bytes = 8 * 1024;
        let p = pool_with(config);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let b = p.rent::<f32>(1024).unwrap(); // 4 KiB each
            ids.push(b.id());
            p.give_back(b, false).unwrap();
        }
        assert!(p.stats().resident_bytes <= 8 * 1024);
    }

    #[test]
    fn cleared_return_zeroes_contents() {
        let p = pool();
        let buf = p.rent::<f32>(8).unwrap();
        buf.copy_from_host(&[1.0; 8], None).unwrap();
        let id = buf.id();
        p.give_back(buf, true).unwrap();
        let again = p.rent::<f32>(8).unwrap();
        assert_eq!(again.id(), id);
        let mut out = [9.0f32; 8];
        again.copy_to_host(&mut out).unwrap();
        assert_eq!(out, [0.0; 8]);
    }
}
