//! Per-device runtime façade.
//!
//! One `Accelerator` binds one device: it allocates buffers, creates
//! streams, owns the memory pool and the kernel cache, and is the single
//! integration point for compile-once kernel loading. Teardown stops
//! admission, cancels streams, drains with a bound, frees registered
//! buffers, and disposes the cache, in that order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::backend::{cpu::HostKernel, DeviceBackend, QueueHandle};
use crate::buffer::{
    BufState, BufferInner, LayoutHint, Location, MemoryBuffer, Shape, UnifiedBuffer,
};
use crate::config::RuntimeConfig;
use crate::device::{Capabilities, Device, DeviceId, Feature, MemoryInfo, TensorPrecision};
use crate::element::Element;
use crate::error::{GpuError, GpuResult};
use crate::kernel::{
    CachedKernel, KernelArtifact, KernelCache, KernelMetadata, KernelSignature, Launcher,
};
use crate::pool::MemoryPool;
use crate::recovery::RecoveryDispatcher;
use crate::stream::Stream;

/// Auto layout: below this element count, host-side placement wins.
const AUTO_HOST_LIMIT: usize = 1024;
/// Auto layout: above this element count, unified placement wins when
/// the device supports it.
const AUTO_UNIFIED_LIMIT: usize = 1 << 20;

struct CompileSlot {
    done: Mutex<Option<GpuResult<Arc<CachedKernel>>>>,
    cv: Condvar,
}

pub(crate) struct AcceleratorShared {
    pub id: u64,
    pub device: Device,
    pub backend: Arc<dyn DeviceBackend>,
    pub sync_queue: Arc<QueueHandle>,
    /// Diagnostics label, e.g. "accel-runtime/CPU:1a2b3c4d".
    pub label: String,
    pub config: Arc<RuntimeConfig>,
    pub pool: MemoryPool,
    pub cache: KernelCache,
    pub recovery: RecoveryDispatcher,
    default_stream: Stream,
    streams: Mutex<Vec<Stream>>,
    buffers: Mutex<Vec<Weak<BufferInner>>>,
    inflight: Mutex<HashMap<u64, Arc<CompileSlot>>>,
    admitting: AtomicBool,
    torn_down: AtomicBool,
}

/// Bound runtime for one device.
#[derive(Clone)]
pub struct Accelerator {
    pub(crate) shared: Arc<AcceleratorShared>,
}

impl Accelerator {
    pub(crate) fn bind(
        device: Device,
        backend: Arc<dyn DeviceBackend>,
        config: Arc<RuntimeConfig>,
        recovery: RecoveryDispatcher,
    ) -> GpuResult<Self> {
        let id = crate::backend::next_resource_id();
        let sync_queue = Arc::new(backend.create_queue()?);
        let default_stream = Stream::spawn(Arc::clone(&backend), device.id())?;
        let pool = MemoryPool::new(
            Arc::clone(&backend),
            Arc::clone(&sync_queue),
            device.id(),
            id,
            config.enable_memory_pool && device.supports(Feature::MemoryPools),
            config.pool.clone(),
        );
        let cache = KernelCache::new(config.cache.clone());
        if config.cache.persistent {
            match cache.preload() {
                Ok(n) if n > 0 => log::info!("preloaded {n} kernels for {}", device.id()),
                Ok(_) => {}
                Err(e) => log::warn!("kernel cache preload failed: {e}"),
            }
        }
        let label = format!("accel-runtime/{}", device.id());
        Ok(Self {
            shared: Arc::new(AcceleratorShared {
                id,
                device,
                backend,
                sync_queue,
                label,
                config,
                pool,
                cache,
                recovery,
                default_stream,
                streams: Mutex::new(Vec::new()),
                buffers: Mutex::new(Vec::new()),
                inflight: Mutex::new(HashMap::new()),
                admitting: AtomicBool::new(true),
                torn_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.shared.device.id()
    }

    /// Diagnostics name for logs and error reports.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.shared.device.capabilities()
    }

    /// Re-reads occupancy from the driver.
    pub fn memory_info(&self) -> MemoryInfo {
        self.shared.backend.memory_info()
    }

    pub fn supports_tensor_cores(&self) -> bool {
        !self.capabilities().tensor_cores.is_empty()
    }

    pub fn supported_precisions(&self) -> &[TensorPrecision] {
        &self.capabilities().tensor_cores
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.shared.pool
    }

    pub fn cache(&self) -> &KernelCache {
        &self.shared.cache
    }

    pub fn default_stream(&self) -> &Stream {
        &self.shared.default_stream
    }

    pub fn create_stream(&self) -> GpuResult<Stream> {
        self.admission_check()?;
        let stream = Stream::spawn(Arc::clone(&self.shared.backend), self.device_id())?;
        self.shared.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    fn admission_check(&self) -> GpuResult<()> {
        if !self.shared.admitting.load(Ordering::SeqCst) {
            return Err(
                GpuError::invalid_argument("accelerator is shutting down")
                    .with_device(self.device_id()),
            );
        }
        Ok(())
    }

    fn resolve_hint(&self, len: usize, hint: LayoutHint) -> GpuResult<Location> {
        let caps = self.capabilities();
        Ok(match hint {
            LayoutHint::Auto => {
                if len < AUTO_HOST_LIMIT {
                    Location::Host
                } else if caps.unified_memory && len > AUTO_UNIFIED_LIMIT {
                    Location::Unified
                } else {
                    Location::Device
                }
            }
            LayoutHint::CpuOptimized => Location::Host,
            LayoutHint::GpuOptimized => Location::Device,
            LayoutHint::Unified => {
                if !caps.unified_memory {
                    return Err(GpuError::unsupported(
                        "device does not support unified memory",
                    )
                    .with_device(self.device_id()));
                }
                Location::Unified
            }
            LayoutHint::Pinned => Location::Pinned,
        })
    }

    fn make_buffer<E: Element>(
        &self,
        shape: Shape,
        strides: [usize; 3],
        capacity_elems: usize,
        location: Location,
    ) -> GpuResult<MemoryBuffer<E>> {
        let shared = &self.shared;
        let bytes = capacity_elems * E::ELEM.size_bytes();
        let backend = &shared.backend;
        let pool = &shared.pool;
        let alloc = shared.recovery.run(
            "allocate",
            Some(self.device_id()),
            Some(&|| pool.trim()),
            || backend.alloc(bytes, location),
        )?;
        let inner = Arc::new(BufferInner {
            id: crate::backend::next_resource_id(),
            accel_id: shared.id,
            backend: Arc::clone(backend),
            sync_queue: Arc::clone(&shared.sync_queue),
            device: self.device_id(),
            elem: E::ELEM,
            location,
            strides,
            state: Mutex::new(BufState {
                alloc: Some(alloc),
                disposed: false,
                shape,
                capacity_elems,
                pool: None,
            }),
        });
        shared.buffers.lock().unwrap().push(Arc::downgrade(&inner));
        Ok(MemoryBuffer::from_inner(inner))
    }

    /// Allocate a dense buffer.
    pub fn alloc<E: Element>(&self, shape: Shape, hint: LayoutHint) -> GpuResult<MemoryBuffer<E>> {
        self.admission_check()?;
        let location = self.resolve_hint(shape.len(), hint)?;
        self.make_buffer(shape, shape.contiguous_strides(), shape.len(), location)
    }

    /// Allocate with explicit per-dimension strides (in elements). Each
    /// stride must be at least as large as the dense stride.
    pub fn alloc_strided<E: Element>(
        &self,
        shape: Shape,
        strides: [usize; 3],
        hint: LayoutHint,
    ) -> GpuResult<MemoryBuffer<E>> {
        self.admission_check()?;
        let dense = shape.contiguous_strides();
        let rank = shape.rank();
        for d in 0..rank {
            if strides[d] < dense[d] {
                return Err(GpuError::invalid_argument(format!(
                    "stride {} for dimension {d} underruns the dense stride {}",
                    strides[d], dense[d]
                )));
            }
        }
        let physical = if shape.is_empty() {
            0
        } else {
            1 + shape
                .dims()
                .iter()
                .zip(strides)
                .map(|(&dim, stride)| (dim - 1) * stride)
                .sum::<usize>()
        };
        let location = self.resolve_hint(physical, hint)?;
        self.make_buffer(shape, strides, physical, location)
    }

    /// Allocate a zero-filled unified buffer.
    pub fn alloc_unified<E: Element>(&self, len: usize) -> GpuResult<UnifiedBuffer<E>> {
        self.admission_check()?;
        if !self.capabilities().unified_memory {
            return Err(
                GpuError::unsupported("device does not support unified memory")
                    .with_device(self.device_id()),
            );
        }
        let buffer =
            self.make_buffer::<E>(Shape::d1(len), [1, 0, 0], len, Location::Unified)?;
        UnifiedBuffer::from_device_buffer(buffer)
    }

    /// Rent from the pool, with out-of-memory recovery (one trim, one
    /// retry) applied.
    pub fn rent<E: Element>(&self, min_len: usize) -> GpuResult<MemoryBuffer<E>> {
        self.admission_check()?;
        let pool = &self.shared.pool;
        self.shared.recovery.run(
            "pool_rent",
            Some(self.device_id()),
            Some(&|| pool.trim()),
            || pool.rent::<E>(min_len),
        )
    }

    /// Register a host function with the CPU simulator's kernel
    /// registry. Fails with `Unsupported` on real devices.
    pub fn register_host_kernel(
        &self,
        name: &str,
        kernel: impl Fn(
                &crate::backend::cpu::HostArgs<'_>,
                &crate::kernel::LaunchDims,
            ) -> GpuResult<()>
            + Send
            + Sync
            + 'static,
    ) -> GpuResult<()> {
        let kernel: HostKernel = Arc::new(kernel);
        self.shared.backend.register_host_kernel(name, kernel)
    }

    /// Load a pre-compiled artifact without touching the cache.
    pub fn load_kernel(
        &self,
        signature: KernelSignature,
        artifact: KernelArtifact,
    ) -> GpuResult<Launcher> {
        self.admission_check()?;
        artifact.layout().matches(&signature)?;
        let module = self.shared.backend.load_module(&artifact)?;
        Ok(Launcher::new(
            Arc::new(signature),
            Arc::new(artifact),
            module,
            Arc::clone(&self.shared.backend),
            self.device_id(),
        ))
    }

    /// Cache-aware kernel loading: fingerprint the signature, consult
    /// the cache under `version`, and compile through `source_fn` on a
    /// miss. At most one concurrent compile runs per fingerprint;
    /// concurrent callers share the winner's result, success or error.
    pub fn load_kernel_cached(
        &self,
        signature: KernelSignature,
        version: &str,
        source_fn: impl FnOnce() -> GpuResult<KernelArtifact>,
    ) -> GpuResult<Launcher> {
        self.load_kernel_cached_timeout(signature, version, source_fn, None)
    }

    /// `load_kernel_cached` with a bound on the wait for a concurrent
    /// compile of the same fingerprint.
    pub fn load_kernel_cached_timeout(
        &self,
        signature: KernelSignature,
        version: &str,
        source_fn: impl FnOnce() -> GpuResult<KernelArtifact>,
        barrier_timeout: Option<Duration>,
    ) -> GpuResult<Launcher> {
        self.admission_check()?;
        let signature = Arc::new(signature);
        let key = signature.fingerprint();

        if let Some(entry) = self.shared.cache.try_get(key, version) {
            return self.instantiate(&signature, &entry);
        }

        enum Role {
            Winner(Arc<CompileSlot>),
            Waiter(Arc<CompileSlot>),
        }
        let role = {
            let mut inflight = self.shared.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(slot) => Role::Waiter(Arc::clone(slot)),
                None => {
                    let slot = Arc::new(CompileSlot {
                        done: Mutex::new(None),
                        cv: Condvar::new(),
                    });
                    inflight.insert(key, Arc::clone(&slot));
                    Role::Winner(slot)
                }
            }
        };

        let entry = match role {
            Role::Winner(slot) => {
                // A prior winner may have finished between our miss and
                // taking the slot.
                let result = match self.shared.cache.try_get(key, version) {
                    Some(entry) => Ok(entry),
                    None => self.compile(&signature, version, source_fn),
                };
                *slot.done.lock().unwrap() = Some(result.clone());
                slot.cv.notify_all();
                self.shared.inflight.lock().unwrap().remove(&key);
                result
            }
            Role::Waiter(slot) => {
                let deadline = barrier_timeout.map(|t| Instant::now() + t);
                let mut done = slot.done.lock().unwrap();
                loop {
                    if let Some(result) = done.as_ref() {
                        break result.clone();
                    }
                    match deadline {
                        None => done = slot.cv.wait(done).unwrap(),
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(GpuError::timeout(
                                    "kernel compile barrier",
                                    barrier_timeout.unwrap_or_default().as_millis(),
                                )
                                .with_device(self.device_id())
                                .with_kernel(signature.name()));
                            }
                            let (guard, _) = slot.cv.wait_timeout(done, deadline - now).unwrap();
                            done = guard;
                        }
                    }
                }
            }
        }?;
        self.instantiate(&signature, &entry)
    }

    fn compile(
        &self,
        signature: &Arc<KernelSignature>,
        version: &str,
        source_fn: impl FnOnce() -> GpuResult<KernelArtifact>,
    ) -> GpuResult<Arc<CachedKernel>> {
        let started = Instant::now();
        let artifact = source_fn().map_err(|e| {
            let e = e.with_device(self.device_id()).with_kernel(signature.name());
            self.shared
                .recovery
                .report("kernel_compile", Some(self.device_id()), &e);
            e
        })?;
        artifact.layout().matches(signature)?;
        let mut metadata = KernelMetadata::new();
        metadata.insert("entry".into(), artifact.entry_point().to_string());
        metadata.insert(
            "compile_ms".into(),
            started.elapsed().as_millis().to_string(),
        );
        log::debug!(
            "compiled kernel {} for {} in {:?}",
            signature.name(),
            self.device_id(),
            started.elapsed()
        );
        Ok(self
            .shared
            .cache
            .put(signature.fingerprint(), artifact, version, metadata))
    }

    fn instantiate(
        &self,
        signature: &Arc<KernelSignature>,
        entry: &Arc<CachedKernel>,
    ) -> GpuResult<Launcher> {
        let module = self.shared.backend.load_module(entry.artifact())?;
        Ok(Launcher::new(
            Arc::clone(signature),
            Arc::clone(entry.artifact()),
            module,
            Arc::clone(&self.shared.backend),
            self.device_id(),
        ))
    }

    /// Ordered teardown. Idempotent; also runs on drop.
    pub fn shutdown(&self, timeout: Duration) {
        self.shared.shutdown(timeout);
    }
}

impl AcceleratorShared {
    fn shutdown(&self, timeout: Duration) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.admitting.store(false, Ordering::SeqCst);

        // Cancel, then drain with whatever budget remains.
        let streams: Vec<Stream> = {
            let mut streams = self.streams.lock().unwrap();
            let mut all = std::mem::take(&mut *streams);
            all.push(self.default_stream.clone());
            all
        };
        for stream in &streams {
            stream.cancel();
        }
        let deadline = Instant::now() + timeout;
        for stream in &streams {
            let budget = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = stream.shutdown(budget.max(Duration::from_millis(1))) {
                let abandoned = GpuError::invariant(format!(
                    "stream {} did not drain within {timeout:?}; pending commands abandoned ({e})",
                    stream.id()
                ))
                .with_device(self.device.id());
                self.recovery
                    .report("accelerator_shutdown", Some(self.device.id()), &abandoned);
            }
        }

        // Free buffers still registered.
        let buffers = std::mem::take(&mut *self.buffers.lock().unwrap());
        let mut freed = 0usize;
        for weak in buffers {
            if let Some(inner) = weak.upgrade() {
                if inner.dispose_inner().is_ok() {
                    freed += 1;
                }
            }
        }
        if freed > 0 {
            log::debug!("freed {freed} leaked buffers at teardown of {}", self.label);
        }
        self.pool.shutdown();

        // Dispose the cache last, persisting when configured.
        if let Err(e) = self.cache.persist() {
            log::warn!("kernel cache persist at teardown failed: {e}");
        }
        self.cache.clear();
    }
}

impl Drop for AcceleratorShared {
    fn drop(&mut self) {
        let timeout = self.config.shutdown_timeout;
        self.shutdown(timeout);
    }
}
