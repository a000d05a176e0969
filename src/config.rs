//! Runtime configuration.
//!
//! A closed option set consumed by `Context::builder()`. No environment
//! variables and no CLI surface; everything is explicit.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::BackendKind;

/// Discovery ordering bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferredBackend {
    #[default]
    Auto,
    Cuda,
    OpenCl,
    Cpu,
}

impl PreferredBackend {
    pub(crate) fn matches(&self, kind: BackendKind) -> bool {
        match self {
            Self::Auto => false,
            Self::Cuda => kind == BackendKind::Cuda,
            Self::OpenCl => kind == BackendKind::OpenCl,
            Self::Cpu => kind == BackendKind::Cpu,
        }
    }
}

/// What the pool does with a returned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Returned buffers are freed to the driver immediately.
    Immediate,
    /// Hold for `trim_interval`, free during the next maintenance tick.
    Fixed,
    /// Hold while `age < 2 min` or the pool hit ratio exceeds 0.7.
    #[default]
    Adaptive,
}

/// Memory-pool options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on bytes resident in the pool.
    pub max_pool_bytes: usize,
    /// Buffers above this size bypass the pool entirely.
    pub max_buffer_bytes: usize,
    pub retention: RetentionPolicy,
    /// Maintenance tick period.
    pub trim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_bytes: 256 * 1024 * 1024,
            max_buffer_bytes: 64 * 1024 * 1024,
            retention: RetentionPolicy::Adaptive,
            trim_interval: Duration::from_secs(30),
        }
    }
}

/// Kernel-cache options.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached kernels.
    pub max_size: usize,
    /// Entries expire this long after creation (half-open boundary).
    pub default_ttl: Duration,
    /// Fraction of `max_size` at which the eviction sweep runs.
    pub eviction_threshold: f64,
    /// Persist compiled artifacts to `directory` across runs.
    pub persistent: bool,
    /// Required when `persistent` is set.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            default_ttl: Duration::from_secs(3600),
            eviction_threshold: 0.9,
            persistent: false,
            directory: None,
        }
    }
}

/// Optimization level forwarded to artifact sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum OptLevel {
    #[default]
    Default,
    Speed,
    Size,
    Debug,
}

impl OptLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Speed => "speed",
            Self::Size => "size",
            Self::Debug => "debug",
        }
    }
}

/// Hybrid-dispatch options.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Element count below which the CPU-SIMD path always wins.
    pub small_threshold: usize,
    /// CPU share of the outermost dimension under the Hybrid strategy.
    pub cpu_gpu_ratio: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            small_threshold: 1024,
            cpu_gpu_ratio: 0.3,
        }
    }
}

/// Full runtime configuration (closed set).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub preferred_backend: PreferredBackend,
    pub enable_memory_pool: bool,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub kernel_optimization: OptLevel,
    pub hybrid: HybridConfig,
    /// Max wait for stream drain at accelerator/context teardown.
    pub shutdown_timeout: Duration,
    /// Retries for Timeout on synchronize, with backoff.
    pub sync_retries: u32,
    /// Simulator device-memory capacity (the CPU backend's "VRAM").
    pub cpu_device_memory: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preferred_backend: PreferredBackend::Auto,
            enable_memory_pool: true,
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            kernel_optimization: OptLevel::Default,
            hybrid: HybridConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            sync_retries: 3,
            cpu_device_memory: 1024 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Rejects option combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.persistent && self.cache.directory.is_none() {
            return Err("cache.persistent requires cache.directory".into());
        }
        if !(0.0 < self.cache.eviction_threshold && self.cache.eviction_threshold <= 1.0) {
            return Err("cache.eviction_threshold must be in (0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.hybrid.cpu_gpu_ratio) {
            return Err("hybrid.cpu_gpu_ratio must be in [0, 1]".into());
        }
        if self.cache.max_size == 0 {
            return Err("cache.max_size must be nonzero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn persistent_cache_requires_directory() {
        let mut cfg = RuntimeConfig::default();
        cfg.cache.persistent = true;
        assert!(cfg.validate().is_err());
        cfg.cache.directory = Some(std::env::temp_dir());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn threshold_bounds() {
        let mut cfg = RuntimeConfig::default();
        cfg.cache.eviction_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.cache.eviction_threshold = 1.0;
        assert!(cfg.validate().is_ok());
    }
}
