//! Device discovery.
//!
//! Enumeration is idempotent and side-effect-free: repeated calls see the
//! same physical devices in the same order (backend tag, then native
//! index), with the configured backend preference applied as a stable
//! bias. A missing driver library silently omits its backend (logged at
//! Info); a driver that is present but fails to initialize yields a
//! device with `Unavailable` status and the reason attached.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{cpu::CpuBackend, DeviceBackend};
use crate::config::RuntimeConfig;
use crate::device::{BackendKind, Device, DeviceId, DeviceStatus, Feature, MemoryInfo, MemoryProbe};
use crate::error::{ErrorKind, GpuError, GpuResult};

/// Capability/backend predicate for `discover`.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    backends: Option<Vec<BackendKind>>,
    required: Vec<Feature>,
    include_unavailable: bool,
}

impl DeviceFilter {
    /// Matches every available device.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn backends(mut self, backends: impl Into<Vec<BackendKind>>) -> Self {
        self.backends = Some(backends.into());
        self
    }

    pub fn require(mut self, feature: Feature) -> Self {
        self.required.push(feature);
        self
    }

    /// Also report devices whose driver failed to initialize.
    pub fn include_unavailable(mut self) -> Self {
        self.include_unavailable = true;
        self
    }

    fn matches(&self, device: &Device) -> bool {
        if let Some(backends) = &self.backends {
            if !backends.contains(&device.id().kind()) {
                return false;
            }
        }
        if device.status() != DeviceStatus::Available && !self.include_unavailable {
            return false;
        }
        self.required.iter().all(|&f| device.supports(f))
    }
}

/// Adapter exposing a backend's driver occupancy as a device probe.
struct BackendProbe(Arc<dyn DeviceBackend>);

impl MemoryProbe for BackendProbe {
    fn memory_info(&self) -> MemoryInfo {
        self.0.memory_info()
    }
}

/// Immutable result of backend enumeration.
pub struct DeviceCatalog {
    devices: Vec<Device>,
    backends: HashMap<DeviceId, Arc<dyn DeviceBackend>>,
}

impl DeviceCatalog {
    /// Enumerate every enabled backend once. Never panics: broken
    /// drivers downgrade to absent or unavailable devices.
    pub(crate) fn discover(config: &RuntimeConfig) -> Self {
        let mut devices = Vec::new();
        let mut backends: HashMap<DeviceId, Arc<dyn DeviceBackend>> = HashMap::new();

        // CPU simulator: always present.
        let cpu = CpuBackend::new(config);
        let cpu_probe: Arc<dyn MemoryProbe> = Arc::new(BackendProbe(cpu.clone()));
        let cpu_device = CpuBackend::describe(config, cpu_probe);
        backends.insert(cpu_device.id(), cpu);
        devices.push(cpu_device);

        #[cfg(feature = "cuda")]
        for found in crate::backend::cuda::enumerate() {
            match found {
                Ok((device, backend)) => {
                    backends.insert(device.id(), backend);
                    devices.push(device);
                }
                Err(device) => devices.push(device),
            }
        }
        #[cfg(not(feature = "cuda"))]
        log::info!("CUDA backend not compiled in; skipping");

        #[cfg(feature = "opencl")]
        for found in crate::backend::opencl::enumerate() {
            match found {
                Ok((device, backend)) => {
                    backends.insert(device.id(), backend);
                    devices.push(device);
                }
                Err(device) => devices.push(device),
            }
        }
        #[cfg(not(feature = "opencl"))]
        log::info!("OpenCL backend not compiled in; skipping");

        // Stable order: preferred backend first, then (tag, payload).
        devices.sort_by_key(|d| d.id());
        devices.sort_by_key(|d| !config.preferred_backend.matches(d.id().kind()));

        Self { devices, backends }
    }

    /// Every enumerated device, including unavailable ones.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Filtered, ordered view. Idempotent.
    pub fn filter(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub(crate) fn backend_for(&self, id: DeviceId) -> GpuResult<Arc<dyn DeviceBackend>> {
        match self.backends.get(&id) {
            Some(backend) => Ok(Arc::clone(backend)),
            None => {
                let reason = self
                    .get(id)
                    .and_then(|d| d.init_error())
                    .unwrap_or("device was not enumerated");
                Err(GpuError::new(
                    ErrorKind::DeviceUnavailable,
                    format!("no usable backend for {id}: {reason}"),
                )
                .with_device(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_always_finds_the_simulator() {
        let config = RuntimeConfig::default();
        let catalog = DeviceCatalog::discover(&config);
        let cpus = catalog.filter(&DeviceFilter::all().backends(vec![BackendKind::Cpu]));
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].status(), DeviceStatus::Available);
        assert!(cpus[0].supports(Feature::UnifiedMemory));
    }

    #[test]
    fn discovery_is_idempotent_and_ordered() {
        let config = RuntimeConfig::default();
        let a = DeviceCatalog::discover(&config);
        let b = DeviceCatalog::discover(&config);
        let ids_a: Vec<_> = a.devices().iter().map(|d| d.id()).collect();
        let ids_b: Vec<_> = b.devices().iter().map(|d| d.id()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn feature_filter_excludes_nonmatching() {
        let config = RuntimeConfig::default();
        let catalog = DeviceCatalog::discover(&config);
        let with_tc = catalog.filter(&DeviceFilter::all().require(Feature::TensorCores(
            crate::device::TensorPrecision::F16,
        )));
        // The simulator has no matrix hardware.
        assert!(with_tc.iter().all(|d| d.id().kind() != BackendKind::Cpu));
    }

    #[test]
    fn unknown_device_has_no_backend() {
        let config = RuntimeConfig::default();
        let catalog = DeviceCatalog::discover(&config);
        let err = catalog.backend_for(DeviceId::cuda(99)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }
}
