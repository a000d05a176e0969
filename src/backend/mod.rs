//! Device backend abstraction.
//!
//! A `DeviceBackend` wraps one driver-level device behind byte-level
//! primitives: allocate/free, host↔device copies, module loading, and
//! kernel launch on an ordered queue. Concrete implementations live in
//! submodules; the CPU simulator is always compiled, the CUDA and OpenCL
//! backends sit behind features and degrade to absent devices when their
//! driver library is missing.

pub(crate) mod cpu;

#[cfg(feature = "cuda")]
pub(crate) mod cuda;

#[cfg(feature = "opencl")]
pub(crate) mod opencl;

use std::any::Any;

use crate::buffer::Location;
use crate::device::{BackendKind, DeviceId, MemoryInfo};
use crate::element::ElemType;
use crate::error::GpuResult;
use crate::kernel::{KernelArtifact, LaunchDims, ParamKind};

/// One raw device allocation.
///
/// The native pointer is only meaningful to the backend that produced it;
/// `id` is process-unique and used for pool identity and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub id: u64,
    pub ptr: u64,
    pub bytes: usize,
    pub location: Location,
}

/// Opaque per-backend command-queue state.
pub(crate) struct QueueHandle {
    pub raw: Box<dyn Any + Send + Sync>,
}

/// Opaque per-backend loaded-module state.
pub(crate) struct ModuleHandle {
    pub entry: String,
    pub raw: Box<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("entry", &self.entry)
            .finish()
    }
}

/// A buffer argument resolved for launch.
#[derive(Debug, Clone)]
pub(crate) struct ViewRef {
    pub alloc_id: u64,
    pub ptr: u64,
    pub len_elems: usize,
    pub elem: ElemType,
}

/// One marshalled parameter slot.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedSlot {
    pub kind: ParamKind,
    pub offset: usize,
    pub size: usize,
    pub view: Option<ViewRef>,
}

/// Parameters packed per the artifact's layout descriptor.
///
/// `bytes` is the ABI-aligned parameter buffer (device pointers written
/// in place for view slots); `slots` carries the per-slot breakdown the
/// CPU simulator uses to hand host ranges to registered kernels.
#[derive(Debug, Clone, Default)]
pub(crate) struct PackedParams {
    pub bytes: Vec<u8>,
    pub slots: Vec<ResolvedSlot>,
}

/// Byte-level device primitives, implemented per backend.
///
/// All methods are safe to call from any thread; ordering is the
/// caller's business (streams serialize their own command execution).
pub(crate) trait DeviceBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;
    fn device_id(&self) -> DeviceId;

    /// Re-reads occupancy from the driver.
    fn memory_info(&self) -> MemoryInfo;

    fn alloc(&self, bytes: usize, location: Location) -> GpuResult<Allocation>;
    fn free(&self, alloc: &Allocation);

    fn create_queue(&self) -> GpuResult<QueueHandle>;
    fn destroy_queue(&self, queue: &QueueHandle);

    /// Host → device, `src.len()` bytes at `dst_offset`.
    fn copy_in(
        &self,
        dst: &Allocation,
        dst_offset: usize,
        src: &[u8],
        queue: &QueueHandle,
    ) -> GpuResult<()>;

    /// Device → host, `dst.len()` bytes from `src_offset`.
    fn copy_out(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &mut [u8],
        queue: &QueueHandle,
    ) -> GpuResult<()>;

    /// Device → device on the same device.
    fn copy_within(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &Allocation,
        dst_offset: usize,
        bytes: usize,
        queue: &QueueHandle,
    ) -> GpuResult<()>;

    fn fill_zero(
        &self,
        dst: &Allocation,
        offset: usize,
        bytes: usize,
        queue: &QueueHandle,
    ) -> GpuResult<()>;

    /// Takes an opaque artifact and prepares it for launch. The backend
    /// rejects payload kinds it cannot execute.
    fn load_module(&self, artifact: &KernelArtifact) -> GpuResult<ModuleHandle>;

    fn launch(
        &self,
        module: &ModuleHandle,
        dims: &LaunchDims,
        params: &PackedParams,
        queue: &QueueHandle,
    ) -> GpuResult<()>;

    /// Blocks until all work submitted to `queue` has finished.
    fn queue_sync(&self, queue: &QueueHandle) -> GpuResult<()>;

    /// Host-visible address of an allocation, when the backend's memory
    /// is mapped into the process (the simulator, pinned and unified
    /// allocations). `None` means access requires an explicit copy.
    fn host_ptr(&self, alloc: &Allocation) -> Option<*mut u8>;

    /// Register a host function as a launchable kernel. Only the CPU
    /// simulator accepts registrations.
    fn register_host_kernel(&self, name: &str, kernel: cpu::HostKernel) -> GpuResult<()> {
        let _ = (name, kernel);
        Err(crate::error::GpuError::unsupported(format!(
            "host kernel registration is not available on {}",
            self.kind()
        )))
    }
}

/// Process-unique allocation/queue id source shared by all backends.
pub(crate) fn next_resource_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
