//! Process-level runtime root.
//!
//! The `Context` owns the device catalog and every accelerator created
//! through it; disposal drains and frees in reverse creation order.
//! Re-creating a context inside one process is allowed but serialized
//! through a process-wide gate, so two live contexts never race over
//! driver state.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::accelerator::Accelerator;
use crate::catalog::{DeviceCatalog, DeviceFilter};
use crate::config::{PoolConfig, CacheConfig, HybridConfig, OptLevel, PreferredBackend, RuntimeConfig};
use crate::device::{Device, DeviceId, DeviceStatus};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::recovery::{ErrorLogger, FacadeLogger, RecoveryDispatcher};

fn gate() -> &'static (Mutex<bool>, Condvar) {
    static GATE: OnceLock<(Mutex<bool>, Condvar)> = OnceLock::new();
    GATE.get_or_init(|| (Mutex::new(false), Condvar::new()))
}

/// Held for the context's lifetime; releasing lets the next context in.
struct ContextGate;

impl ContextGate {
    fn acquire() -> Self {
        let (lock, cv) = gate();
        let mut held = lock.lock().unwrap();
        while *held {
            held = cv.wait(held).unwrap();
        }
        *held = true;
        Self
    }
}

impl Drop for ContextGate {
    fn drop(&mut self) {
        let (lock, cv) = gate();
        *lock.lock().unwrap() = false;
        cv.notify_one();
    }
}

/// Builder applying the closed configuration set.
pub struct ContextBuilder {
    config: RuntimeConfig,
    logger: Option<Arc<dyn ErrorLogger>>,
}

impl ContextBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            logger: None,
        }
    }

    /// Replace the whole configuration at once.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn preferred_backend(mut self, preferred: PreferredBackend) -> Self {
        self.config.preferred_backend = preferred;
        self
    }

    pub fn enable_memory_pool(mut self, enabled: bool) -> Self {
        self.config.enable_memory_pool = enabled;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn hybrid(mut self, hybrid: HybridConfig) -> Self {
        self.config.hybrid = hybrid;
        self
    }

    pub fn kernel_optimization(mut self, opt: OptLevel) -> Self {
        self.config.kernel_optimization = opt;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn sync_retries(mut self, retries: u32) -> Self {
        self.config.sync_retries = retries;
        self
    }

    /// Capacity of the simulator's "device" memory.
    pub fn cpu_device_memory(mut self, bytes: usize) -> Self {
        self.config.cpu_device_memory = bytes;
        self
    }

    /// Install a structured error sink; defaults to the `log` facade.
    pub fn logger(mut self, logger: Arc<dyn ErrorLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validate the configuration, enumerate backends, and hand over the
    /// process root. Blocks while a previous context is still alive.
    pub fn build(self) -> GpuResult<Context> {
        self.config
            .validate()
            .map_err(|reason| GpuError::new(ErrorKind::Unsupported, reason))?;
        let gate = ContextGate::acquire();
        let config = Arc::new(self.config);
        let logger = self.logger.unwrap_or_else(|| Arc::new(FacadeLogger));
        let recovery = RecoveryDispatcher::new(logger, config.sync_retries);
        let catalog = DeviceCatalog::discover(&config);
        log::info!(
            "context up with {} device(s): {}",
            catalog.devices().len(),
            catalog
                .devices()
                .iter()
                .map(|d| d.id().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Context {
            config,
            catalog,
            recovery,
            accelerators: Mutex::new(Vec::new()),
            by_id: Mutex::new(HashMap::new()),
            _gate: gate,
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish()
    }
}

/// Process-wide runtime root.
pub struct Context {
    config: Arc<RuntimeConfig>,
    catalog: DeviceCatalog,
    recovery: RecoveryDispatcher,
    /// Creation order, for reverse-order teardown.
    accelerators: Mutex<Vec<Accelerator>>,
    by_id: Mutex<HashMap<DeviceId, Accelerator>>,
    _gate: ContextGate,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Build with defaults.
    pub fn new() -> GpuResult<Self> {
        Self::builder().build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Every enumerated device, in discovery order.
    pub fn devices(&self) -> &[Device] {
        self.catalog.devices()
    }

    /// The immutable discovery result.
    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    /// Filtered discovery view; repeated calls return identical lists.
    pub fn discover(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.catalog.filter(filter)
    }

    /// First available device under the configured preference.
    pub fn default_device(&self) -> GpuResult<Device> {
        self.catalog
            .devices()
            .iter()
            .find(|d| d.status() == DeviceStatus::Available)
            .cloned()
            .ok_or_else(|| {
                GpuError::new(ErrorKind::DeviceUnavailable, "no available devices")
            })
    }

    /// Get (or create) the accelerator bound to `id`. One accelerator
    /// exists per device per context.
    pub fn accelerator(&self, id: DeviceId) -> GpuResult<Accelerator> {
        if let Some(existing) = self.by_id.lock().unwrap().get(&id) {
            return Ok(existing.clone());
        }
        let device = self
            .catalog
            .get(id)
            .cloned()
            .ok_or_else(|| {
                GpuError::new(ErrorKind::DeviceUnavailable, format!("unknown device {id}"))
                    .with_device(id)
            })?;
        if device.status() != DeviceStatus::Available {
            return Err(GpuError::new(
                ErrorKind::DeviceUnavailable,
                format!(
                    "device {id} is unavailable: {}",
                    device.init_error().unwrap_or("unknown reason")
                ),
            )
            .with_device(id));
        }
        let backend = self.catalog.backend_for(id)?;
        let accelerator = Accelerator::bind(
            device,
            backend,
            Arc::clone(&self.config),
            self.recovery.clone(),
        )?;
        self.accelerators.lock().unwrap().push(accelerator.clone());
        self.by_id.lock().unwrap().insert(id, accelerator.clone());
        Ok(accelerator)
    }

    /// Accelerator for the default device.
    pub fn default_accelerator(&self) -> GpuResult<Accelerator> {
        let device = self.default_device()?;
        self.accelerator(device.id())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Reverse creation order: newest accelerators drain first, the
        // catalog (and driver bindings) go last, then the gate opens.
        self.by_id.lock().unwrap().clear();
        let mut accelerators = std::mem::take(&mut *self.accelerators.lock().unwrap());
        while let Some(accelerator) = accelerators.pop() {
            accelerator.shutdown(self.config.shutdown_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_recreation_is_serialized() {
        let first = Context::new().unwrap();
        let cpu = first.default_device().unwrap().id();
        drop(first);
        // The gate has been released; a second context comes up cleanly
        // and sees the same device ordering.
        let second = Context::new().unwrap();
        assert_eq!(second.default_device().unwrap().id(), cpu);
    }

    #[test]
    fn accelerator_is_memoized_per_device() {
        let ctx = Context::new().unwrap();
        let id = ctx.default_device().unwrap().id();
        let a = ctx.accelerator(id).unwrap();
        let b = ctx.accelerator(id).unwrap();
        assert_eq!(a.device_id(), b.device_id());
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
    }

    #[test]
    fn invalid_config_is_rejected_before_discovery() {
        let mut config = RuntimeConfig::default();
        config.cache.eviction_threshold = 2.0;
        let err = Context::builder().config(config).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
