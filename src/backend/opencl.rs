//! OpenCL backend through a dynamically loaded ICD loader.
//!
//! The loader library is dlopen'd once per process; on systems without
//! OpenCL installed the code still compiles and discovery simply omits
//! the backend. Artifacts must be SPIR-V (`clCreateProgramWithIL`); the
//! runtime never parses them.

use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use libloading::Library;

use crate::backend::{
    next_resource_id, Allocation, DeviceBackend, ModuleHandle, PackedParams, QueueHandle,
};
use crate::buffer::Location;
use crate::device::{
    BackendKind, Capabilities, Device, DeviceId, MemoryInfo, MemoryProbe,
};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{ArtifactPayload, KernelArtifact, LaunchDims, ParamKind};

// OpenCL type definitions
pub type ClInt = i32;
pub type ClUint = u32;
pub type ClUlong = u64;
pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClCommandQueue = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClProgram = *mut c_void;
pub type ClKernel = *mut c_void;

pub const CL_SUCCESS: ClInt = 0;
const CL_MEM_OBJECT_ALLOCATION_FAILURE: ClInt = -4;
const CL_OUT_OF_RESOURCES: ClInt = -5;
const CL_OUT_OF_HOST_MEMORY: ClInt = -6;

const CL_DEVICE_TYPE_ALL: ClUlong = 0xFFFF_FFFF;
const CL_MEM_READ_WRITE: ClUlong = 1 << 0;
const CL_TRUE: ClUint = 1;

const CL_PLATFORM_NAME: ClUint = 0x0902;
const CL_DEVICE_NAME: ClUint = 0x102B;
const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
const CL_DEVICE_MAX_WORK_GROUP_SIZE: ClUint = 0x1004;
const CL_DEVICE_HOST_UNIFIED_MEMORY: ClUint = 0x1035;
const CL_PROGRAM_BUILD_LOG: ClUint = 0x1183;

// Function pointer types
type GetPlatformIDsFn = unsafe extern "C" fn(ClUint, *mut ClPlatformId, *mut ClUint) -> ClInt;
type GetPlatformInfoFn =
    unsafe extern "C" fn(ClPlatformId, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type GetDeviceIDsFn =
    unsafe extern "C" fn(ClPlatformId, ClUlong, ClUint, *mut ClDeviceId, *mut ClUint) -> ClInt;
type GetDeviceInfoFn =
    unsafe extern "C" fn(ClDeviceId, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type CreateContextFn = unsafe extern "C" fn(
    *const isize,
    ClUint,
    *const ClDeviceId,
    Option<unsafe extern "C" fn(*const c_char, *const c_void, usize, *mut c_void)>,
    *mut c_void,
    *mut ClInt,
) -> ClContext;
type ReleaseContextFn = unsafe extern "C" fn(ClContext) -> ClInt;
type CreateCommandQueueFn =
    unsafe extern "C" fn(ClContext, ClDeviceId, ClUlong, *mut ClInt) -> ClCommandQueue;
type ReleaseCommandQueueFn = unsafe extern "C" fn(ClCommandQueue) -> ClInt;
type CreateBufferFn =
    unsafe extern "C" fn(ClContext, ClUlong, usize, *mut c_void, *mut ClInt) -> ClMem;
type ReleaseMemObjectFn = unsafe extern "C" fn(ClMem) -> ClInt;
type EnqueueWriteBufferFn = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClUint,
    usize,
    usize,
    *const c_void,
    ClUint,
    *const c_void,
    *mut c_void,
) -> ClInt;
type EnqueueReadBufferFn = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClUint,
    usize,
    usize,
    *mut c_void,
    ClUint,
    *const c_void,
    *mut c_void,
) -> ClInt;
type EnqueueCopyBufferFn = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClMem,
    usize,
    usize,
    usize,
    ClUint,
    *const c_void,
    *mut c_void,
) -> ClInt;
type EnqueueFillBufferFn = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    *const c_void,
    usize,
    usize,
    usize,
    ClUint,
    *const c_void,
    *mut c_void,
) -> ClInt;
type FinishFn = unsafe extern "C" fn(ClCommandQueue) -> ClInt;
type CreateProgramWithIlFn =
    unsafe extern "C" fn(ClContext, *const c_void, usize, *mut ClInt) -> ClProgram;
type BuildProgramFn = unsafe extern "C" fn(
    ClProgram,
    ClUint,
    *const ClDeviceId,
    *const c_char,
    Option<unsafe extern "C" fn(ClProgram, *mut c_void)>,
    *mut c_void,
) -> ClInt;
type GetProgramBuildInfoFn = unsafe extern "C" fn(
    ClProgram,
    ClDeviceId,
    ClUint,
    usize,
    *mut c_void,
    *mut usize,
) -> ClInt;
type CreateKernelFn = unsafe extern "C" fn(ClProgram, *const c_char, *mut ClInt) -> ClKernel;
type SetKernelArgFn = unsafe extern "C" fn(ClKernel, ClUint, usize, *const c_void) -> ClInt;
type EnqueueNdRangeKernelFn = unsafe extern "C" fn(
    ClCommandQueue,
    ClKernel,
    ClUint,
    *const usize,
    *const usize,
    *const usize,
    ClUint,
    *const c_void,
    *mut c_void,
) -> ClInt;
type ReleaseKernelFn = unsafe extern "C" fn(ClKernel) -> ClInt;
type ReleaseProgramFn = unsafe extern "C" fn(ClProgram) -> ClInt;

/// OpenCL loader function table.
pub struct ClLib {
    #[allow(dead_code)]
    lib: Library,

    get_platform_ids: GetPlatformIDsFn,
    get_platform_info: GetPlatformInfoFn,
    get_device_ids: GetDeviceIDsFn,
    get_device_info: GetDeviceInfoFn,
    create_context: CreateContextFn,
    release_context: ReleaseContextFn,
    create_command_queue: CreateCommandQueueFn,
    release_command_queue: ReleaseCommandQueueFn,
    create_buffer: CreateBufferFn,
    release_mem_object: ReleaseMemObjectFn,
    enqueue_write_buffer: EnqueueWriteBufferFn,
    enqueue_read_buffer: EnqueueReadBufferFn,
    enqueue_copy_buffer: EnqueueCopyBufferFn,
    enqueue_fill_buffer: EnqueueFillBufferFn,
    finish: FinishFn,
    create_program_with_il: CreateProgramWithIlFn,
    build_program: BuildProgramFn,
    get_program_build_info: GetProgramBuildInfoFn,
    create_kernel: CreateKernelFn,
    set_kernel_arg: SetKernelArgFn,
    enqueue_nd_range_kernel: EnqueueNdRangeKernelFn,
    release_kernel: ReleaseKernelFn,
    release_program: ReleaseProgramFn,
}

// Safety: function pointers from a library that lives for the whole
// process; OpenCL entry points are thread-safe per the spec.
unsafe impl Send for ClLib {}
unsafe impl Sync for ClLib {}

macro_rules! cl_symbol {
    ($lib:expr, $ty:ty, $name:literal) => {
        unsafe {
            *$lib
                .get::<$ty>(concat!($name, "\0").as_bytes())
                .map_err(|e| format!("{}: {e}", $name))?
        }
    };
}

impl ClLib {
    fn load() -> Result<Self, String> {
        let lib_names = [
            "libOpenCL.so.1",
            "libOpenCL.so",
            "OpenCL.dll",
            "/System/Library/Frameworks/OpenCL.framework/OpenCL",
        ];
        let lib = lib_names
            .iter()
            .find_map(|name| unsafe { Library::new(name).ok() })
            .ok_or_else(|| "failed to load the OpenCL ICD loader".to_string())?;

        let get_platform_ids = cl_symbol!(lib, GetPlatformIDsFn, "clGetPlatformIDs");
        let get_platform_info = cl_symbol!(lib, GetPlatformInfoFn, "clGetPlatformInfo");
        let get_device_ids = cl_symbol!(lib, GetDeviceIDsFn, "clGetDeviceIDs");
        let get_device_info = cl_symbol!(lib, GetDeviceInfoFn, "clGetDeviceInfo");
        let create_context = cl_symbol!(lib, CreateContextFn, "clCreateContext");
        let release_context = cl_symbol!(lib, ReleaseContextFn, "clReleaseContext");
        let create_command_queue =
            cl_symbol!(lib, CreateCommandQueueFn, "clCreateCommandQueue");
        let release_command_queue =
            cl_symbol!(lib, ReleaseCommandQueueFn, "clReleaseCommandQueue");
        let create_buffer = cl_symbol!(lib, CreateBufferFn, "clCreateBuffer");
        let release_mem_object = cl_symbol!(lib, ReleaseMemObjectFn, "clReleaseMemObject");
        let enqueue_write_buffer =
            cl_symbol!(lib, EnqueueWriteBufferFn, "clEnqueueWriteBuffer");
        let enqueue_read_buffer = cl_symbol!(lib, EnqueueReadBufferFn, "clEnqueueReadBuffer");
        let enqueue_copy_buffer = cl_symbol!(lib, EnqueueCopyBufferFn, "clEnqueueCopyBuffer");
        let enqueue_fill_buffer = cl_symbol!(lib, EnqueueFillBufferFn, "clEnqueueFillBuffer");
        let finish = cl_symbol!(lib, FinishFn, "clFinish");
        let create_program_with_il =
            cl_symbol!(lib, CreateProgramWithIlFn, "clCreateProgramWithIL");
        let build_program = cl_symbol!(lib, BuildProgramFn, "clBuildProgram");
        let get_program_build_info =
            cl_symbol!(lib, GetProgramBuildInfoFn, "clGetProgramBuildInfo");
        let create_kernel = cl_symbol!(lib, CreateKernelFn, "clCreateKernel");
        let set_kernel_arg = cl_symbol!(lib, SetKernelArgFn, "clSetKernelArg");
        let enqueue_nd_range_kernel =
            cl_symbol!(lib, EnqueueNdRangeKernelFn, "clEnqueueNDRangeKernel");
        let release_kernel = cl_symbol!(lib, ReleaseKernelFn, "clReleaseKernel");
        let release_program = cl_symbol!(lib, ReleaseProgramFn, "clReleaseProgram");

        Ok(Self {
            lib,
            get_platform_ids,
            get_platform_info,
            get_device_ids,
            get_device_info,
            create_context,
            release_context,
            create_command_queue,
            release_command_queue,
            create_buffer,
            release_mem_object,
            enqueue_write_buffer,
            enqueue_read_buffer,
            enqueue_copy_buffer,
            enqueue_fill_buffer,
            finish,
            create_program_with_il,
            build_program,
            get_program_build_info,
            create_kernel,
            set_kernel_arg,
            enqueue_nd_range_kernel,
            release_kernel,
            release_program,
        })
    }

    /// Loader handle, attempted once per process.
    pub fn get() -> Option<&'static Arc<ClLib>> {
        static LIB: OnceLock<Option<Arc<ClLib>>> = OnceLock::new();
        LIB.get_or_init(|| match ClLib::load() {
            Ok(lib) => Some(Arc::new(lib)),
            Err(e) => {
                log::info!("OpenCL unavailable: {e}");
                None
            }
        })
        .as_ref()
    }
}

fn status_name(code: ClInt) -> &'static str {
    match code {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -30 => "CL_INVALID_VALUE",
        -34 => "CL_INVALID_CONTEXT",
        -38 => "CL_INVALID_MEM_OBJECT",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -48 => "CL_INVALID_KERNEL",
        -51 => "CL_INVALID_ARG_SIZE",
        -54 => "CL_INVALID_WORK_GROUP_SIZE",
        _ => "CL_UNKNOWN_ERROR",
    }
}

/// Translate a driver status into the typed taxonomy.
fn check(code: ClInt, operation: &str, device: DeviceId) -> GpuResult<()> {
    if code == CL_SUCCESS {
        return Ok(());
    }
    let err = match code {
        CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_HOST_MEMORY => {
            GpuError::new(ErrorKind::OutOfMemory, format!("{operation}: {}", status_name(code)))
                .with_suggestion("Reduce working set or call pool.trim()")
        }
        // The runtime may recover resources once in-flight work drains.
        CL_OUT_OF_RESOURCES => GpuError::new(
            ErrorKind::DriverError { transient: true },
            format!("{operation}: {}", status_name(code)),
        ),
        _ => GpuError::new(
            ErrorKind::DriverError { transient: false },
            format!("{operation}: {} ({code})", status_name(code)),
        ),
    };
    Err(err.with_device(device).with_context("cl_status", code.to_string()))
}

struct ClQueue {
    queue: ClCommandQueue,
}
unsafe impl Send for ClQueue {}
unsafe impl Sync for ClQueue {}

struct ClModule {
    program: ClProgram,
    /// Kernel objects carry arg state; serialize launches per module.
    kernel: Mutex<KernelPtr>,
}
struct KernelPtr(ClKernel);
unsafe impl Send for ClModule {}
unsafe impl Sync for ClModule {}

/// One OpenCL device.
pub(crate) struct OpenClBackend {
    lib: Arc<ClLib>,
    id: DeviceId,
    device: ClDeviceId,
    context: ClContext,
    total_memory: u64,
    allocated: AtomicUsize,
}

unsafe impl Send for OpenClBackend {}
unsafe impl Sync for OpenClBackend {}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend").field("id", &self.id).finish()
    }
}

impl OpenClBackend {
    fn init(
        lib: Arc<ClLib>,
        id: DeviceId,
        device: ClDeviceId,
        total_memory: u64,
    ) -> GpuResult<Arc<Self>> {
        let mut status: ClInt = 0;
        let context = unsafe {
            (lib.create_context)(
                std::ptr::null(),
                1,
                &device,
                None,
                std::ptr::null_mut(),
                &mut status,
            )
        };
        check(status, "clCreateContext", id)?;
        Ok(Arc::new(Self {
            lib,
            id,
            device,
            context,
            total_memory,
            allocated: AtomicUsize::new(0),
        }))
    }

    fn mem(&self, alloc: &Allocation) -> ClMem {
        alloc.ptr as ClMem
    }

    fn cl_queue<'a>(&self, queue: &'a QueueHandle) -> GpuResult<&'a ClQueue> {
        queue
            .raw
            .downcast_ref::<ClQueue>()
            .ok_or_else(|| GpuError::invariant("foreign queue handle passed to OpenCL backend"))
    }

    fn build_log(&self, program: ClProgram) -> String {
        let mut len = 0usize;
        let status = unsafe {
            (self.lib.get_program_build_info)(
                program,
                self.device,
                CL_PROGRAM_BUILD_LOG,
                0,
                std::ptr::null_mut(),
                &mut len,
            )
        };
        if status != CL_SUCCESS || len == 0 {
            return String::new();
        }
        let mut buf = vec![0u8; len];
        let status = unsafe {
            (self.lib.get_program_build_info)(
                program,
                self.device,
                CL_PROGRAM_BUILD_LOG,
                len,
                buf.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        if status != CL_SUCCESS {
            return String::new();
        }
        String::from_utf8_lossy(&buf)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }
}

impl Drop for OpenClBackend {
    fn drop(&mut self) {
        unsafe {
            (self.lib.release_context)(self.context);
        }
    }
}

impl MemoryProbe for OpenClBackend {
    fn memory_info(&self) -> MemoryInfo {
        // Core OpenCL exposes no free-memory query; track our own
        // allocations against the reported global size.
        let used = self.allocated.load(Ordering::Relaxed) as u64;
        MemoryInfo {
            total_bytes: self.total_memory,
            free_bytes: self.total_memory.saturating_sub(used),
        }
    }
}

impl DeviceBackend for OpenClBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryProbe::memory_info(self)
    }

    fn alloc(&self, bytes: usize, location: Location) -> GpuResult<Allocation> {
        let mut status: ClInt = 0;
        let mem = unsafe {
            (self.lib.create_buffer)(
                self.context,
                CL_MEM_READ_WRITE,
                bytes.max(1),
                std::ptr::null_mut(),
                &mut status,
            )
        };
        check(status, "clCreateBuffer", self.id)?;
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
        Ok(Allocation {
            id: next_resource_id(),
            ptr: mem as u64,
            bytes,
            location,
        })
    }

    fn free(&self, alloc: &Allocation) {
        unsafe {
            (self.lib.release_mem_object)(self.mem(alloc));
        }
        self.allocated.fetch_sub(alloc.bytes, Ordering::Relaxed);
    }

    fn create_queue(&self) -> GpuResult<QueueHandle> {
        let mut status: ClInt = 0;
        let queue =
            unsafe { (self.lib.create_command_queue)(self.context, self.device, 0, &mut status) };
        check(status, "clCreateCommandQueue", self.id)?;
        Ok(QueueHandle {
            raw: Box::new(ClQueue { queue }),
        })
    }

    fn destroy_queue(&self, queue: &QueueHandle) {
        if let Ok(q) = self.cl_queue(queue) {
            unsafe {
                (self.lib.release_command_queue)(q.queue);
            }
        }
    }

    fn copy_in(
        &self,
        dst: &Allocation,
        dst_offset: usize,
        src: &[u8],
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        let q = self.cl_queue(queue)?;
        let status = unsafe {
            (self.lib.enqueue_write_buffer)(
                q.queue,
                self.mem(dst),
                CL_TRUE,
                dst_offset,
                src.len(),
                src.as_ptr() as *const c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check(status, "clEnqueueWriteBuffer", self.id)
    }

    fn copy_out(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &mut [u8],
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        let q = self.cl_queue(queue)?;
        let status = unsafe {
            (self.lib.enqueue_read_buffer)(
                q.queue,
                self.mem(src),
                CL_TRUE,
                src_offset,
                dst.len(),
                dst.as_mut_ptr() as *mut c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check(status, "clEnqueueReadBuffer", self.id)
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
        let q = self.cl_queue(queue)?;
        let status = unsafe {
            (self.lib.enqueue_copy_buffer)(
                q.queue,
                self.mem(src),
                self.mem(dst),
                src_offset,
                dst_offset,
                bytes,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check(status, "clEnqueueCopyBuffer", self.id)
    }

    fn fill_zero(
        &self,
        dst: &Allocation,
        offset: usize,
        bytes: usize,
        queue: &QueueHandle,
    ) -> GpuResult<()> {
        let q = self.cl_queue(queue)?;
        let zero: u8 = 0;
        let status = unsafe {
            (self.lib.enqueue_fill_buffer)(
                q.queue,
                self.mem(dst),
                &zero as *const u8 as *const c_void,
                1,
                offset,
                bytes,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check(status, "clEnqueueFillBuffer", self.id)
    }

    fn load_module(&self, artifact: &KernelArtifact) -> GpuResult<ModuleHandle> {
        let il = match artifact.payload() {
            ArtifactPayload::SpirV(words) => words,
            other => {
                return Err(GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    format!("OpenCL backend expects SPIR-V, got {}", other.tag()),
                )
                .with_device(self.id)
                .with_kernel(artifact.entry_point()))
            }
        };
        let mut status: ClInt = 0;
        let program = unsafe {
            (self.lib.create_program_with_il)(
                self.context,
                il.as_ptr() as *const c_void,
                il.len(),
                &mut status,
            )
        };
        check(status, "clCreateProgramWithIL", self.id)?;

        let mut status = unsafe {
            (self.lib.build_program)(
                program,
                1,
                &self.device,
                b"\0".as_ptr() as *const c_char,
                None,
                std::ptr::null_mut(),
            )
        };
        if status != CL_SUCCESS {
            let build_log = self.build_log(program);
            unsafe {
                (self.lib.release_program)(program);
            }
            return Err(GpuError::new(
                ErrorKind::KernelCompilationFailed,
                format!("clBuildProgram: {}", status_name(status)),
            )
            .with_device(self.id)
            .with_kernel(artifact.entry_point())
            .with_context("build_log", build_log));
        }

        let entry = std::ffi::CString::new(artifact.entry_point()).map_err(|_| {
            GpuError::invalid_argument("kernel entry point contains a NUL byte")
        })?;
        let kernel = unsafe { (self.lib.create_kernel)(program, entry.as_ptr(), &mut status) };
        if status != CL_SUCCESS {
            unsafe {
                (self.lib.release_program)(program);
            }
            return Err(GpuError::new(
                ErrorKind::KernelCompilationFailed,
                format!("clCreateKernel: {}", status_name(status)),
            )
            .with_device(self.id)
            .with_kernel(artifact.entry_point()));
        }

        Ok(ModuleHandle {
            entry: artifact.entry_point().to_string(),
            raw: Box::new(ClModule {
                program,
                kernel: Mutex::new(KernelPtr(kernel)),
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
        let q = self.cl_queue(queue)?;
        let cl_module = module
            .raw
            .downcast_ref::<ClModule>()
            .ok_or_else(|| GpuError::invariant("foreign module handle passed to OpenCL backend"))?;
        let kernel = cl_module.kernel.lock().unwrap();

        for (i, slot) in params.slots.iter().enumerate() {
            let status = match slot.kind {
                ParamKind::View => {
                    let view = slot.view.as_ref().ok_or_else(|| {
                        GpuError::invariant("view slot resolved without a buffer")
                    })?;
                    let mem = view.ptr as ClMem;
                    unsafe {
                        (self.lib.set_kernel_arg)(
                            kernel.0,
                            i as ClUint,
                            std::mem::size_of::<ClMem>(),
                            &mem as *const ClMem as *const c_void,
                        )
                    }
                }
                ParamKind::Scalar | ParamKind::Struct => unsafe {
                    (self.lib.set_kernel_arg)(
                        kernel.0,
                        i as ClUint,
                        slot.size,
                        params.bytes[slot.offset..].as_ptr() as *const c_void,
                    )
                },
            };
            check(status, "clSetKernelArg", self.id)
                .map_err(|e| e.with_kernel(module.entry.clone()))?;
        }

        let local: [usize; 3] = [
            dims.block[0] as usize,
            dims.block[1] as usize,
            dims.block[2] as usize,
        ];
        let global: [usize; 3] = [
            dims.grid[0] as usize * local[0],
            dims.grid[1] as usize * local[1],
            dims.grid[2] as usize * local[2],
        ];
        let status = unsafe {
            (self.lib.enqueue_nd_range_kernel)(
                q.queue,
                kernel.0,
                3,
                std::ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check(status, "clEnqueueNDRangeKernel", self.id).map_err(|e| {
            GpuError::new(ErrorKind::LaunchFailed, e.message())
                .with_device(self.id)
                .with_kernel(module.entry.clone())
        })
    }

    fn queue_sync(&self, queue: &QueueHandle) -> GpuResult<()> {
        let q = self.cl_queue(queue)?;
        let status = unsafe { (self.lib.finish)(q.queue) };
        check(status, "clFinish", self.id)
    }

    fn host_ptr(&self, _alloc: &Allocation) -> Option<*mut u8> {
        // Discrete buffers; host access goes through explicit copies.
        None
    }
}

impl Drop for ClModule {
    fn drop(&mut self) {
        // The loader outlives every module (it is never unloaded), so
        // releasing here is safe even at process teardown.
        if let Some(lib) = ClLib::get() {
            unsafe {
                (lib.release_kernel)(self.kernel.lock().unwrap().0);
                (lib.release_program)(self.program);
            }
        }
    }
}

fn device_string(lib: &ClLib, device: ClDeviceId, param: ClUint) -> String {
    let mut len = 0usize;
    let status =
        unsafe { (lib.get_device_info)(device, param, 0, std::ptr::null_mut(), &mut len) };
    if status != CL_SUCCESS || len == 0 {
        return "unknown".to_string();
    }
    let mut buf = vec![0u8; len];
    let status = unsafe {
        (lib.get_device_info)(
            device,
            param,
            len,
            buf.as_mut_ptr() as *mut c_void,
            std::ptr::null_mut(),
        )
    };
    if status != CL_SUCCESS {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

fn device_scalar<T: Copy + Default>(lib: &ClLib, device: ClDeviceId, param: ClUint) -> Option<T> {
    let mut value = T::default();
    let status = unsafe {
        (lib.get_device_info)(
            device,
            param,
            std::mem::size_of::<T>(),
            &mut value as *mut T as *mut c_void,
            std::ptr::null_mut(),
        )
    };
    (status == CL_SUCCESS).then_some(value)
}

type Enumerated = Result<(Device, Arc<dyn DeviceBackend>), Device>;

/// Enumerate every OpenCL device. Missing loader: empty list (logged at
/// Info by `ClLib::get`). Per-device init failures degrade to
/// unavailable descriptors with the reason attached.
pub(crate) fn enumerate() -> Vec<Enumerated> {
    let Some(lib) = ClLib::get() else {
        return Vec::new();
    };

    let mut platform_count: ClUint = 0;
    let status =
        unsafe { (lib.get_platform_ids)(0, std::ptr::null_mut(), &mut platform_count) };
    if status != CL_SUCCESS || platform_count == 0 {
        log::info!("OpenCL loader present but no platforms found");
        return Vec::new();
    }
    let mut platforms = vec![std::ptr::null_mut(); platform_count as usize];
    if unsafe { (lib.get_platform_ids)(platform_count, platforms.as_mut_ptr(), std::ptr::null_mut()) }
        != CL_SUCCESS
    {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (p_idx, &platform) in platforms.iter().enumerate() {
        log::debug!(
            "OpenCL platform {p_idx}: {}",
            platform_string(lib, platform, CL_PLATFORM_NAME)
        );
        let mut device_count: ClUint = 0;
        let status = unsafe {
            (lib.get_device_ids)(
                platform,
                CL_DEVICE_TYPE_ALL,
                0,
                std::ptr::null_mut(),
                &mut device_count,
            )
        };
        if status != CL_SUCCESS || device_count == 0 {
            continue;
        }
        let mut devices = vec![std::ptr::null_mut(); device_count as usize];
        if unsafe {
            (lib.get_device_ids)(
                platform,
                CL_DEVICE_TYPE_ALL,
                device_count,
                devices.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        } != CL_SUCCESS
        {
            continue;
        }

        for (d_idx, &device) in devices.iter().enumerate() {
            let id = DeviceId::opencl(p_idx as u32, d_idx as u32);
            let name = device_string(lib, device, CL_DEVICE_NAME);
            let total: ClUlong =
                device_scalar(lib, device, CL_DEVICE_GLOBAL_MEM_SIZE).unwrap_or(0);
            let max_wg: usize =
                device_scalar(lib, device, CL_DEVICE_MAX_WORK_GROUP_SIZE).unwrap_or(256);
            let unified: ClUint =
                device_scalar(lib, device, CL_DEVICE_HOST_UNIFIED_MEMORY).unwrap_or(0);
            match OpenClBackend::init(Arc::clone(lib), id, device, total) {
                Ok(backend) => {
                    let caps = Capabilities {
                        compute_capability: None,
                        max_work_group: max_wg,
                        unified_memory: unified == CL_TRUE,
                        memory_pools: true,
                        tensor_cores: Vec::new(),
                        async_copy: true,
                    };
                    let probe: Arc<dyn MemoryProbe> = backend.clone();
                    let descriptor = Device::new(id, name, caps, probe);
                    out.push(Ok((descriptor, backend as Arc<dyn DeviceBackend>)));
                }
                Err(e) => {
                    log::warn!("OpenCL device {id} failed to initialize: {e}");
                    out.push(Err(Device::unavailable(id, name, e.to_string())));
                }
            }
        }
    }
    out
}

fn platform_string(lib: &ClLib, platform: ClPlatformId, param: ClUint) -> String {
    let mut len = 0usize;
    let status =
        unsafe { (lib.get_platform_info)(platform, param, 0, std::ptr::null_mut(), &mut len) };
    if status != CL_SUCCESS || len == 0 {
        return "unknown".to_string();
    }
    let mut buf = vec![0u8; len];
    let status = unsafe {
        (lib.get_platform_info)(
            platform,
            param,
            len,
            buf.as_mut_ptr() as *mut c_void,
            std::ptr::null_mut(),
        )
    };
    if status != CL_SUCCESS {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_classes() {
        let id = DeviceId::opencl(0, 0);
        let oom = check(CL_OUT_OF_HOST_MEMORY, "alloc", id).unwrap_err();
        assert_eq!(oom.kind(), ErrorKind::OutOfMemory);
        let transient = check(CL_OUT_OF_RESOURCES, "launch", id).unwrap_err();
        assert_eq!(transient.kind(), ErrorKind::DriverError { transient: true });
        assert!(transient.is_retryable());
        let hard = check(-30, "any", id).unwrap_err();
        assert_eq!(hard.kind(), ErrorKind::DriverError { transient: false });
        assert!(check(CL_SUCCESS, "noop", id).is_ok());
    }

    #[test]
    fn enumeration_never_panics() {
        // With or without a loader installed, this must return cleanly.
        let _ = enumerate();
    }
}
