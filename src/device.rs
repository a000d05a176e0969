//! Device identity and descriptors.
//!
//! A `DeviceId` is a small value type identifying one physical (or
//! simulated) accelerator; a `Device` is the read-mostly descriptor the
//! catalog hands out. Memory occupancy is re-read from the driver on every
//! `memory_info()` call, everything else is fixed at discovery time.

use std::fmt;
use std::sync::Arc;

use crate::element::ElemType;

/// Backend family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Cuda,
    OpenCl,
    Cpu,
    /// The vectorized host path the hybrid dispatcher may route to.
    /// Never enumerated as a standalone device; appears in diagnostics.
    SimdCpu,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::OpenCl => "OpenCL",
            Self::Cpu => "CPU",
            Self::SimdCpu => "SIMD-CPU",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend-specific identity payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DevicePayload {
    /// CUDA device ordinal.
    Ordinal(i32),
    /// OpenCL (platform index, device index).
    PlatformDevice(u32, u32),
    /// Hash of the host configuration the simulator was built with.
    ConfigHash(u64),
}

/// Opaque typed device identifier.
///
/// Value type; equatable and ordered by (backend tag, payload) so that
/// repeated discovery yields a stable ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    kind: BackendKind,
    payload: DevicePayload,
}

impl DeviceId {
    pub const fn new(kind: BackendKind, payload: DevicePayload) -> Self {
        Self { kind, payload }
    }

    pub const fn cuda(ordinal: i32) -> Self {
        Self::new(BackendKind::Cuda, DevicePayload::Ordinal(ordinal))
    }

    pub const fn opencl(platform: u32, device: u32) -> Self {
        Self::new(
            BackendKind::OpenCl,
            DevicePayload::PlatformDevice(platform, device),
        )
    }

    pub const fn cpu(config_hash: u64) -> Self {
        Self::new(BackendKind::Cpu, DevicePayload::ConfigHash(config_hash))
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn payload(&self) -> DevicePayload {
        self.payload
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            DevicePayload::Ordinal(n) => write!(f, "{}:{n}", self.kind),
            DevicePayload::PlatformDevice(p, d) => write!(f, "{}:{p}.{d}", self.kind),
            DevicePayload::ConfigHash(h) => write!(f, "{}:{h:08x}", self.kind),
        }
    }
}

/// Operational status, re-polled on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Available,
    Busy,
    Unavailable,
    Error,
}

/// Precisions a device's matrix units accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorPrecision {
    F16,
    BF16,
    Tf32,
    I8,
}

/// Capability probe argument for `Device::supports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    UnifiedMemory,
    MemoryPools,
    TensorCores(TensorPrecision),
    AsyncCopy,
}

/// Static capability set collected at discovery.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// CUDA compute capability, when applicable.
    pub compute_capability: Option<(u32, u32)>,
    /// Maximum work-group / block size.
    pub max_work_group: usize,
    pub unified_memory: bool,
    pub memory_pools: bool,
    pub tensor_cores: Vec<TensorPrecision>,
    pub async_copy: bool,
}

impl Capabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::UnifiedMemory => self.unified_memory,
            Feature::MemoryPools => self.memory_pools,
            Feature::TensorCores(p) => self.tensor_cores.contains(&p),
            Feature::AsyncCopy => self.async_copy,
        }
    }

    /// Whether a matmul/convolve over `elem` can use dedicated matrix
    /// hardware here (dims are checked separately by the dispatcher).
    pub fn tensor_core_eligible(&self, elem: ElemType) -> bool {
        match elem {
            ElemType::F16 => self.tensor_cores.contains(&TensorPrecision::F16),
            ElemType::BF16 => self.tensor_cores.contains(&TensorPrecision::BF16),
            ElemType::I8 => self.tensor_cores.contains(&TensorPrecision::I8),
            _ => false,
        }
    }
}

/// Point-in-time memory occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl MemoryInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}M used / {}M total",
            self.used_bytes() / (1024 * 1024),
            self.total_bytes / (1024 * 1024)
        )
    }
}

/// Driver-level occupancy probe, re-queried on each `memory_info` call.
pub(crate) trait MemoryProbe: Send + Sync {
    fn memory_info(&self) -> MemoryInfo;
}

/// Fixed-value probe for devices that failed initialization.
pub(crate) struct StaticProbe(pub MemoryInfo);

impl MemoryProbe for StaticProbe {
    fn memory_info(&self) -> MemoryInfo {
        self.0
    }
}

/// Descriptor for one discovered device.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    name: String,
    capabilities: Capabilities,
    status: DeviceStatus,
    /// Attached when the driver was present but init failed.
    init_error: Option<String>,
    probe: Arc<dyn MemoryProbe>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        name: impl Into<String>,
        capabilities: Capabilities,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            status: DeviceStatus::Available,
            init_error: None,
            probe,
        }
    }

    /// Device present but unusable: the driver was found and failed init.
    pub(crate) fn unavailable(id: DeviceId, name: impl Into<String>, reason: String) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities: Capabilities::default(),
            status: DeviceStatus::Unavailable,
            init_error: Some(reason),
            probe: Arc::new(StaticProbe(MemoryInfo {
                total_bytes: 0,
                free_bytes: 0,
            })),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Why the device is `Unavailable`, if it is.
    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.capabilities.supports(feature)
    }

    /// Re-reads occupancy from the driver on every call.
    pub fn memory_info(&self) -> MemoryInfo {
        self.probe.memory_info()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_ordering_is_tag_then_payload() {
        let a = DeviceId::cuda(0);
        let b = DeviceId::cuda(1);
        let c = DeviceId::opencl(0, 0);
        let d = DeviceId::cpu(42);
        let mut ids = vec![d, c, b, a];
        ids.sort();
        assert_eq!(ids, vec![a, b, c, d]);
    }

    #[test]
    fn tensor_core_eligibility_requires_matching_precision() {
        let caps = Capabilities {
            tensor_cores: vec![TensorPrecision::F16],
            ..Default::default()
        };
        assert!(caps.tensor_core_eligible(ElemType::F16));
        assert!(!caps.tensor_core_eligible(ElemType::BF16));
        assert!(!caps.tensor_core_eligible(ElemType::F32));
    }
}
