//! CUDA driver backend through cudarc.
//!
//! The driver library is loaded at runtime; a machine without CUDA
//! simply reports no CUDA devices. Artifacts must be PTX text or cubin
//! machine code; modules are loaded with the driver API and launched
//! with raw parameter buffers packed by the launcher.

use std::sync::Arc;

use cudarc::driver::{result, sys, CudaContext, CudaStream};

use crate::backend::{
    next_resource_id, Allocation, DeviceBackend, ModuleHandle, PackedParams, QueueHandle,
};
use crate::buffer::Location;
use crate::device::{
    BackendKind, Capabilities, Device, DeviceId, MemoryInfo, MemoryProbe, TensorPrecision,
};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{ArtifactPayload, KernelArtifact, LaunchDims};

fn driver_error(operation: &str, e: impl std::fmt::Display, device: DeviceId) -> GpuError {
    GpuError::new(
        ErrorKind::DriverError { transient: false },
        format!("{operation}: {e}"),
    )
    .with_device(device)
}

struct CudaQueue {
    stream: Arc<CudaStream>,
}

struct CudaModuleBox {
    module: sys::CUmodule,
    func: sys::CUfunction,
    ctx: Arc<CudaContext>,
}

// Safety: CUmodule/CUfunction are plain driver handles; the driver API
// is thread-safe and the owning context outlives the module.
unsafe impl Send for CudaModuleBox {}
unsafe impl Sync for CudaModuleBox {}

impl Drop for CudaModuleBox {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        unsafe {
            let _ = result::module::unload(self.module);
        }
    }
}

/// One CUDA device, addressed by driver ordinal.
pub(crate) struct CudaBackend {
    ctx: Arc<CudaContext>,
    id: DeviceId,
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend").field("id", &self.id).finish()
    }
}

impl CudaBackend {
    fn queue<'a>(&self, queue: &'a QueueHandle) -> GpuResult<&'a CudaQueue> {
        queue
            .raw
            .downcast_ref::<CudaQueue>()
            .ok_or_else(|| GpuError::invariant("foreign queue handle passed to CUDA backend"))
    }

    fn bind(&self) -> GpuResult<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| driver_error("cuCtxSetCurrent", e, self.id))
    }
}

impl MemoryProbe for CudaBackend {
    fn memory_info(&self) -> MemoryInfo {
        if self.ctx.bind_to_thread().is_err() {
            return MemoryInfo {
                total_bytes: 0,
                free_bytes: 0,
            };
        }
        match result::mem_get_info() {
            Ok((free, total)) => MemoryInfo {
                total_bytes: total as u64,
                free_bytes: free as u64,
            },
            Err(_) => MemoryInfo {
                total_bytes: 0,
                free_bytes: 0,
            },
        }
    }
}

impl DeviceBackend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryProbe::memory_info(self)
    }

    fn alloc(&self, bytes: usize, location: Location) -> GpuResult<Allocation> {
        self.bind()?;
        let ptr = unsafe { result::malloc_sync(bytes.max(1)) }.map_err(|e| {
            let info = MemoryProbe::memory_info(self);
            GpuError::out_of_memory(bytes, info.free_bytes)
                .with_device(self.id)
                .with_context("driver", e.to_string())
        })?;
        Ok(Allocation {
            id: next_resource_id(),
            ptr,
            bytes,
            location,
        })
    }

    fn free(&self, alloc: &Allocation) {
        if self.ctx.bind_to_thread().is_ok() {
            unsafe {
                let _ = result::free_sync(alloc.ptr);
            }
        }
    }

    fn create_queue(&self) -> GpuResult<QueueHandle> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(|e| driver_error("cuStreamCreate", e, self.id))?;
        Ok(QueueHandle {
            raw: Box::new(CudaQueue { stream }),
        })
    }

    fn destroy_queue(&self, _queue: &QueueHandle) {
        // Streams are destroyed when the Arc drops with the handle.
    }

    fn copy_in(
        &self,
        dst: &Allocation,
        dst_offset: usize,
        src: &[u8],
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        self.bind()?;
        let q = self.queue(queue)?;
        unsafe {
            result::memcpy_htod_async(dst.ptr + dst_offset as u64, src, q.stream.cu_stream())
        }
        .map_err(|e| driver_error("cuMemcpyHtoDAsync", e, self.id))
    }

    fn copy_out(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &mut [u8],
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        self.bind()?;
        // Synchronous: callers read `dst` as soon as this returns; the
        // stream ordering is preserved because prior work on the queue
        // is ordered before this blocking copy.
        let q = self.queue(queue)?;
        unsafe {
            result::stream::synchronize(q.stream.cu_stream())
                .map_err(|e| driver_error("cuStreamSynchronize", e, self.id))?;
            result::memcpy_dtoh_sync(dst, src.ptr + src_offset as u64)
                .map_err(|e| driver_error("cuMemcpyDtoH", e, self.id))
        }
    }

    fn copy_within(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &Allocation,
        dst_offset: usize,
        bytes: usize,
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        self.bind()?;
        let q = self.queue(queue)?;
        unsafe {
            result::memcpy_dtod_async(
                dst.ptr + dst_offset as u64,
                src.ptr + src_offset as u64,
                bytes,
                q.stream.cu_stream(),
            )
        }
        .map_err(|e| driver_error("cuMemcpyDtoDAsync", e, self.id))
    }

    fn fill_zero(
        &self,
        dst: &Allocation,
        offset: usize,
        bytes: usize,
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        self.bind()?;
        let q = self.queue(queue)?;
        unsafe {
            result::memset_d8_async(dst.ptr + offset as u64, 0, bytes, q.stream.cu_stream())
        }
        .map_err(|e| driver_error("cuMemsetD8Async", e, self.id))
    }

    fn load_module(&self, artifact: &KernelArtifact) -> GpuResult<ModuleHandle> {
        self.bind()?;
        // The driver wants a NUL-terminated image for PTX text.
        let image: Vec<u8> = match artifact.payload() {
            ArtifactPayload::Ptx(text) => {
                let mut bytes = text.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            ArtifactPayload::MachineCode(cubin) => cubin.clone(),
            other => {
                return Err(GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    format!("CUDA backend expects PTX or cubin, got {}", other.tag()),
                )
                .with_device(self.id)
                .with_kernel(artifact.entry_point()))
            }
        };
        let module = unsafe { result::module::load_data(image.as_ptr() as *const _) }
            .map_err(|e| {
                GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    format!("cuModuleLoadData: {e}"),
                )
                .with_device(self.id)
                .with_kernel(artifact.entry_point())
            })?;
        let entry = std::ffi::CString::new(artifact.entry_point()).map_err(|_| {
            GpuError::invalid_argument("kernel entry point contains a NUL byte")
        })?;
        let func = unsafe { result::module::get_function(module, entry) }.map_err(|e| {
            unsafe {
                let _ = result::module::unload(module);
            }
            GpuError::new(
                ErrorKind::KernelCompilationFailed,
                format!("cuModuleGetFunction: {e}"),
            )
            .with_device(self.id)
            .with_kernel(artifact.entry_point())
        })?;
        Ok(ModuleHandle {
            entry: artifact.entry_point().to_string(),
            raw: Box::new(CudaModuleBox {
                module,
                func,
                ctx: Arc::clone(&self.ctx),
            }),
        })
    }

    fn launch(
        &self,
        module: &ModuleHandle,
        dims: &LaunchDims,
        params: &PackedParams,
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        self.bind()?;
        let q = self.queue(queue)?;
        let cuda_module = module
            .raw
            .downcast_ref::<CudaModuleBox>()
            .ok_or_else(|| GpuError::invariant("foreign module handle passed to CUDA backend"))?;
        // Every slot (scalars, structs, and view pointers alike) already
        // sits in the packed buffer at its ABI offset.
        let mut args: Vec<*mut std::ffi::c_void> = params
            .slots
            .iter()
            .map(|slot| params.bytes[slot.offset..].as_ptr() as *mut std::ffi::c_void)
            .collect();
        unsafe {
            result::launch_kernel(
                cuda_module.func,
                (dims.grid[0], dims.grid[1], dims.grid[2]),
                (dims.block[0], dims.block[1], dims.block[2]),
                0,
                q.stream.cu_stream(),
                &mut args,
            )
        }
        .map_err(|e| {
            GpuError::new(ErrorKind::LaunchFailed, format!("cuLaunchKernel: {e}"))
                .with_device(self.id)
                .with_kernel(module.entry.clone())
        })
    }

    fn queue_sync(&self, queue: &QueueHandle) -> GpuResult<()> {
        self.bind()?;
        let q = self.queue(queue)?;
        unsafe { result::stream::synchronize(q.stream.cu_stream()) }
            .map_err(|e| driver_error("cuStreamSynchronize", e, self.id))
    }

    fn host_ptr(&self, _alloc: &Allocation) -> Option<*mut u8> {
        None
    }
}

fn tensor_cores_for(sm: u32) -> Vec<TensorPrecision> {
    let mut set = Vec::new();
    if sm >= 70 {
        set.push(TensorPrecision::F16);
    }
    if sm >= 75 {
        set.push(TensorPrecision::I8);
    }
    if sm >= 80 {
        set.push(TensorPrecision::BF16);
        set.push(TensorPrecision::Tf32);
    }
    set
}

type Enumerated = Result<(Device, Arc<dyn DeviceBackend>), Device>;

/// Enumerate CUDA devices. A missing driver library yields an empty
/// list (logged at Info); a device whose context cannot be created is
/// reported as unavailable with the driver's reason.
pub(crate) fn enumerate() -> Vec<Enumerated> {
    if let Err(e) = result::init() {
        log::info!("CUDA unavailable: {e}");
        return Vec::new();
    }
    let count = match result::device::get_count() {
        Ok(count) => count,
        Err(e) => {
            log::info!("CUDA device enumeration failed: {e}");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for ordinal in 0..count {
        let id = DeviceId::cuda(ordinal);
        match CudaContext::new(ordinal as usize) {
            Ok(ctx) => {
                let major = ctx
                    .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
                    .unwrap_or(0) as u32;
                let minor = ctx
                    .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
                    .unwrap_or(0) as u32;
                let max_threads = ctx
                    .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
                    .unwrap_or(1024) as usize;
                let managed = ctx
                    .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY)
                    .unwrap_or(0)
                    != 0;
                let name = ctx
                    .name()
                    .unwrap_or_else(|_| format!("CUDA device {ordinal}"));
                let sm = major * 10 + minor;
                let caps = Capabilities {
                    compute_capability: Some((major, minor)),
                    max_work_group: max_threads,
                    unified_memory: managed,
                    memory_pools: true,
                    tensor_cores: tensor_cores_for(sm),
                    async_copy: true,
                };
                let backend = Arc::new(CudaBackend { ctx, id });
                let probe: Arc<dyn MemoryProbe> = backend.clone();
                out.push(Ok((
                    Device::new(id, name, caps, probe),
                    backend as Arc<dyn DeviceBackend>,
                )));
            }
            Err(e) => {
                log::warn!("CUDA device {ordinal} failed to initialize: {e}");
                out.push(Err(Device::unavailable(
                    id,
                    format!("CUDA device {ordinal}"),
                    e.to_string(),
                )));
            }
        }
    }
    out
}
