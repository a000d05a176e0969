//! In-process CPU simulator backend.
//!
//! "Device memory" is host memory tracked by an allocation table with a
//! configurable capacity, so out-of-memory paths behave like a real
//! device. Kernels are host functions registered by name in an explicit
//! registry; compiled artifacts reference registry entries instead of
//! carrying machine code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::backend::{
    next_resource_id, Allocation, DeviceBackend, ModuleHandle, PackedParams, QueueHandle,
    ResolvedSlot,
};
use crate::buffer::Location;
use crate::config::RuntimeConfig;
use crate::device::{
    BackendKind, Capabilities, Device, DeviceId, MemoryInfo, MemoryProbe,
};
use crate::element::{Element, ElemType};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{KernelArtifact, ArtifactPayload, LaunchDims, ParamKind};

/// Typed access to marshalled launch parameters, handed to registered
/// host kernels.
pub struct HostArgs<'a> {
    bytes: &'a [u8],
    slots: &'a [ResolvedSlot],
}

impl<'a> HostArgs<'a> {
    pub(crate) fn new(params: &'a PackedParams) -> Self {
        Self {
            bytes: &params.bytes,
            slots: &params.slots,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> GpuResult<&ResolvedSlot> {
        self.slots.get(index).ok_or_else(|| {
            GpuError::new(
                ErrorKind::InvalidKernelParameters,
                format!("parameter index {index} out of range"),
            )
        })
    }

    /// Read a scalar slot.
    pub fn scalar<E: Element>(&self, index: usize) -> GpuResult<E> {
        let slot = self.slot(index)?;
        if slot.kind != ParamKind::Scalar || slot.size != std::mem::size_of::<E>() {
            return Err(GpuError::new(
                ErrorKind::InvalidKernelParameters,
                format!("parameter {index} is not a {} scalar", E::ELEM),
            ));
        }
        let raw = &self.bytes[slot.offset..slot.offset + slot.size];
        let mut value = E::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                &mut value as *mut E as *mut u8,
                slot.size,
            );
        }
        Ok(value)
    }

    /// Raw bytes of a struct slot.
    pub fn struct_bytes(&self, index: usize) -> GpuResult<&[u8]> {
        let slot = self.slot(index)?;
        if slot.kind != ParamKind::Struct {
            return Err(GpuError::new(
                ErrorKind::InvalidKernelParameters,
                format!("parameter {index} is not a struct"),
            ));
        }
        Ok(&self.bytes[slot.offset..slot.offset + slot.size])
    }

    fn view_raw(&self, index: usize, elem: ElemType) -> GpuResult<(*mut u8, usize)> {
        let slot = self.slot(index)?;
        let view = slot.view.as_ref().ok_or_else(|| {
            GpuError::new(
                ErrorKind::InvalidKernelParameters,
                format!("parameter {index} is not a buffer view"),
            )
        })?;
        if view.elem != elem {
            return Err(GpuError::new(
                ErrorKind::InvalidKernelParameters,
                format!(
                    "parameter {index} has element type {}, kernel expects {}",
                    view.elem, elem
                ),
            ));
        }
        Ok((view.ptr as *mut u8, view.len_elems))
    }

    /// Borrow a view slot as a host slice.
    pub fn view<E: Element>(&self, index: usize) -> GpuResult<&'a [E]> {
        let (ptr, len) = self.view_raw(index, E::ELEM)?;
        // The simulator's device memory is host memory; the allocation
        // outlives the launch because the stream holds the buffer alive.
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const E, len) })
    }

    /// Borrow a view slot mutably. Kernels must not request overlapping
    /// mutable views, mirroring device aliasing rules.
    #[allow(clippy::mut_from_ref)]
    pub fn view_mut<E: Element>(&self, index: usize) -> GpuResult<&'a mut [E]> {
        let (ptr, len) = self.view_raw(index, E::ELEM)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut E, len) })
    }
}

/// A host function standing in for a compiled kernel.
pub type HostKernel =
    Arc<dyn Fn(&HostArgs<'_>, &LaunchDims) -> GpuResult<()> + Send + Sync>;

struct HostModule {
    kernel: HostKernel,
}

struct CpuAlloc {
    data: Box<[u8]>,
    location: Location,
}

#[derive(Default)]
struct AllocTable {
    live: HashMap<u64, CpuAlloc>,
    used: usize,
}

/// The simulator device.
pub(crate) struct CpuBackend {
    id: DeviceId,
    capacity: usize,
    table: Mutex<AllocTable>,
    registry: RwLock<HashMap<String, HostKernel>>,
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend").field("id", &self.id).finish()
    }
}

impl CpuBackend {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let backend = Arc::new(Self {
            id: DeviceId::cpu(config_hash(config)),
            capacity: config.cpu_device_memory,
            table: Mutex::new(AllocTable::default()),
            registry: RwLock::new(HashMap::new()),
        });
        register_builtins(&backend);
        backend
    }

    /// Descriptor for the simulator, shared with the catalog.
    pub fn describe(config: &RuntimeConfig, probe: Arc<dyn MemoryProbe>) -> Device {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Device::new(
            DeviceId::cpu(config_hash(config)),
            format!("CPU simulator ({threads} threads, {})", std::env::consts::ARCH),
            Capabilities {
                compute_capability: None,
                max_work_group: 1024,
                unified_memory: true,
                memory_pools: true,
                tensor_cores: Vec::new(),
                async_copy: true,
            },
            probe,
        )
    }

    /// Register a host function under `name`. Replacing an existing
    /// registration is allowed and takes effect for future module loads.
    pub fn register(&self, name: &str, kernel: HostKernel) {
        self.registry
            .write()
            .unwrap()
            .insert(name.to_string(), kernel);
    }

    fn resolve(&self, alloc: &Allocation) -> GpuResult<*mut u8> {
        let table = self.table.lock().unwrap();
        let entry = table.live.get(&alloc.id).ok_or_else(|| {
            GpuError::invalid_argument(format!("allocation {} is not live", alloc.id))
                .with_device(self.id)
        })?;
        Ok(entry.data.as_ptr() as *mut u8)
    }

    fn check_range(alloc: &Allocation, offset: usize, bytes: usize) -> GpuResult<()> {
        if offset.checked_add(bytes).map_or(true, |end| end > alloc.bytes) {
            return Err(GpuError::invalid_argument(format!(
                "range {offset}..{} exceeds allocation of {} bytes",
                offset + bytes,
                alloc.bytes
            )));
        }
        Ok(())
    }
}

impl MemoryProbe for CpuBackend {
    fn memory_info(&self) -> MemoryInfo {
        let table = self.table.lock().unwrap();
        MemoryInfo {
            total_bytes: self.capacity as u64,
            free_bytes: (self.capacity - table.used.min(self.capacity)) as u64,
        }
    }
}

impl DeviceBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryProbe::memory_info(self)
    }

    fn alloc(&self, bytes: usize, location: Location) -> GpuResult<Allocation> {
        let mut table = self.table.lock().unwrap();
        let free = self.capacity.saturating_sub(table.used);
        if bytes > free {
            return Err(GpuError::out_of_memory(bytes, free as u64).with_device(self.id));
        }
        let data = vec![0u8; bytes.max(1)].into_boxed_slice();
        let ptr = data.as_ptr() as u64;
        let id = next_resource_id();
        table.live.insert(id, CpuAlloc { data, location });
        table.used += bytes;
        Ok(Allocation {
            id,
            ptr,
            bytes,
            location,
        })
    }

    fn free(&self, alloc: &Allocation) {
        let mut table = self.table.lock().unwrap();
        if table.live.remove(&alloc.id).is_some() {
            table.used = table.used.saturating_sub(alloc.bytes);
        }
    }

    fn create_queue(&self) -> GpuResult<QueueHandle> {
        Ok(QueueHandle { raw: Box::new(()) })
    }

    fn destroy_queue(&self, _queue: &QueueHandle) {}

    fn copy_in(
        &self,
        dst: &Allocation,
        dst_offset: usize,
        src: &[u8],
        _queue: &QueueHandle,
    ) -> GpuResult<()> {
        Self::check_range(dst, dst_offset, src.len())?;
        let base = self.resolve(dst)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(dst_offset), src.len());
        }
        Ok(())
    }

    fn copy_out(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &mut [u8],
        _queue: &QueueHandle,
    ) -> GpuResult<()> {
        Self::check_range(src, src_offset, dst.len())?;
        let base = self.resolve(src)?;
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(src_offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn copy_within(
        &self,
        src: &Allocation,
        src_offset: usize,
        dst: &Allocation,
        dst_offset: usize,
        bytes: usize,
        _queue: &QueueHandle,
    ) -> GpuResult<()> {
        Self::check_range(src, src_offset, bytes)?;
        Self::check_range(dst, dst_offset, bytes)?;
        let src_base = self.resolve(src)?;
        let dst_base = self.resolve(dst)?;
        unsafe {
            // Same-allocation copies may overlap.
            std::ptr::copy(src_base.add(src_offset), dst_base.add(dst_offset), bytes);
        }
        Ok(())
    }

    fn fill_zero(
        &self,
        dst: &Allocation,
        offset: usize,
        bytes: usize,
        _queue: &QueueHandle,
    ) -> GpuResult<()> {
        Self::check_range(dst, offset, bytes)?;
        let base = self.resolve(dst)?;
        unsafe {
            std::ptr::write_bytes(base.add(offset), 0, bytes);
        }
        Ok(())
    }

    fn load_module(&self, artifact: &KernelArtifact) -> GpuResult<ModuleHandle> {
        let name = match artifact.payload() {
            ArtifactPayload::HostFn(name) => name,
            other => {
                return Err(GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    format!(
                        "CPU simulator cannot execute {} artifacts",
                        other.tag()
                    ),
                )
                .with_device(self.id))
            }
        };
        let kernel = self
            .registry
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                GpuError::new(
                    ErrorKind::KernelCompilationFailed,
                    format!("no host kernel registered under '{name}'"),
                )
                .with_device(self.id)
                .with_kernel(name.clone())
            })?;
        Ok(ModuleHandle {
            entry: artifact.entry_point().to_string(),
            raw: Box::new(HostModule { kernel }),
        })
    }

    fn launch(
        &self,
        module: &ModuleHandle,
        dims: &LaunchDims,
        params: &PackedParams,
        _queue: &QueueHandle,
    ) -> GpuResult<()> {
        let host = module
            .raw
            .downcast_ref::<HostModule>()
            .ok_or_else(|| GpuError::invariant("foreign module handle passed to CPU backend"))?;
        let args = HostArgs::new(params);
        (host.kernel)(&args, dims).map_err(|e| {
            if e.kind() == ErrorKind::InvalidKernelParameters {
                e.with_kernel(module.entry.clone())
            } else {
                GpuError::new(ErrorKind::LaunchFailed, e.message())
                    .with_device(self.id)
                    .with_kernel(module.entry.clone())
            }
        })
    }

    fn queue_sync(&self, _queue: &QueueHandle) -> GpuResult<()> {
        // Simulator commands execute inline on the stream worker.
        Ok(())
    }

    fn host_ptr(&self, alloc: &Allocation) -> Option<*mut u8> {
        self.resolve(alloc).ok()
    }

    fn register_host_kernel(&self, name: &str, kernel: HostKernel) -> GpuResult<()> {
        self.register(name, kernel);
        Ok(())
    }
}

/// Stable hash of the host configuration, used as the simulator's
/// device-id payload.
fn config_hash(config: &RuntimeConfig) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    let mut eat = |v: u64| {
        for b in v.to_le_bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
    };
    eat(config.cpu_device_memory as u64);
    eat(
        std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1),
    );
    h
}

// ── Built-in kernels ─────────────────────────────────────────────────
//
// The hybrid dispatcher's device paths route through these registry
// entries so forced device execution works on the simulator too.
// Every builtin takes explicit (start, end) range scalars so hybrid
// splits can launch over a sub-range.

macro_rules! builtin_elementwise {
    ($backend:expr, $name:expr, $ty:ty, $op:expr) => {
        $backend.register(
            $name,
            Arc::new(|args: &HostArgs<'_>, _dims: &LaunchDims| {
                let a = args.view::<$ty>(0)?;
                let b = args.view::<$ty>(1)?;
                let out = args.view_mut::<$ty>(2)?;
                let start = args.scalar::<u64>(3)? as usize;
                let end = (args.scalar::<u64>(4)? as usize).min(out.len());
                let op: fn($ty, $ty) -> $ty = $op;
                for i in start..end {
                    out[i] = op(a[i], b[i]);
                }
                Ok(())
            }),
        );
    };
}

macro_rules! builtin_reduce {
    ($backend:expr, $name:expr, $ty:ty, $init:expr, $fold:expr) => {
        $backend.register(
            $name,
            Arc::new(|args: &HostArgs<'_>, _dims: &LaunchDims| {
                let a = args.view::<$ty>(0)?;
                let out = args.view_mut::<$ty>(1)?;
                let start = args.scalar::<u64>(2)? as usize;
                let end = (args.scalar::<u64>(3)? as usize).min(a.len());
                let fold: fn($ty, $ty) -> $ty = $fold;
                let mut acc: $ty = $init;
                for &v in &a[start..end] {
                    acc = fold(acc, v);
                }
                out[0] = acc;
                Ok(())
            }),
        );
    };
}

macro_rules! builtin_matmul {
    ($backend:expr, $name:expr, $ty:ty) => {
        $backend.register(
            $name,
            Arc::new(|args: &HostArgs<'_>, _dims: &LaunchDims| {
                let a = args.view::<$ty>(0)?;
                let b = args.view::<$ty>(1)?;
                let out = args.view_mut::<$ty>(2)?;
                let k = args.scalar::<u64>(3)? as usize;
                let n = args.scalar::<u64>(4)? as usize;
                let row_start = args.scalar::<u64>(5)? as usize;
                let row_end = args.scalar::<u64>(6)? as usize;
                for i in row_start..row_end {
                    for j in 0..n {
                        let mut acc = <$ty as Element>::ZERO;
                        for p in 0..k {
                            acc = acc.elem_mul_add(a[i * k + p], b[p * n + j]);
                        }
                        out[i * n + j] = acc;
                    }
                }
                Ok(())
            }),
        );
    };
}

macro_rules! builtin_transpose {
    ($backend:expr, $name:expr, $ty:ty) => {
        $backend.register(
            $name,
            Arc::new(|args: &HostArgs<'_>, _dims: &LaunchDims| {
                let a = args.view::<$ty>(0)?;
                let out = args.view_mut::<$ty>(1)?;
                let rows = args.scalar::<u64>(2)? as usize;
                let cols = args.scalar::<u64>(3)? as usize;
                let row_start = args.scalar::<u64>(4)? as usize;
                let row_end = args.scalar::<u64>(5)? as usize;
                for i in row_start..row_end {
                    for j in 0..cols {
                        out[j * rows + i] = a[i * cols + j];
                    }
                }
                Ok(())
            }),
        );
    };
}

fn register_builtins(backend: &Arc<CpuBackend>) {
    builtin_elementwise!(backend, "accel.add.f32", f32, |x, y| x + y);
    builtin_elementwise!(backend, "accel.add.f64", f64, |x, y| x + y);
    builtin_elementwise!(backend, "accel.add.i32", i32, i32::wrapping_add);
    builtin_elementwise!(backend, "accel.mul.f32", f32, |x, y| x * y);
    builtin_elementwise!(backend, "accel.mul.f64", f64, |x, y| x * y);
    builtin_elementwise!(backend, "accel.mul.i32", i32, i32::wrapping_mul);

    builtin_reduce!(backend, "accel.reduce_sum.f32", f32, 0.0, |a, v| a + v);
    builtin_reduce!(backend, "accel.reduce_sum.f64", f64, 0.0, |a, v| a + v);
    builtin_reduce!(backend, "accel.reduce_sum.i32", i32, 0, i32::wrapping_add);
    builtin_reduce!(backend, "accel.reduce_max.f32", f32, f32::NEG_INFINITY, f32::max);
    builtin_reduce!(backend, "accel.reduce_max.f64", f64, f64::NEG_INFINITY, f64::max);
    builtin_reduce!(backend, "accel.reduce_max.i32", i32, i32::MIN, i32::max);

    builtin_matmul!(backend, "accel.matmul.f32", f32);
    builtin_matmul!(backend, "accel.matmul.f64", f64);

    builtin_transpose!(backend, "accel.transpose.f32", f32);
    builtin_transpose!(backend, "accel.transpose.f64", f64);
    builtin_transpose!(backend, "accel.transpose.i32", i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Arc<CpuBackend> {
        CpuBackend::new(&RuntimeConfig::default())
    }

    #[test]
    fn alloc_tracks_capacity() {
        let mut config = RuntimeConfig::default();
        config.cpu_device_memory = 1024;
        let b = CpuBackend::new(&config);
        let a1 = b.alloc(512, Location::Device).unwrap();
        assert_eq!(DeviceBackend::memory_info(&*b).free_bytes, 512);
        let err = b.alloc(1024, Location::Device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.suggestions().iter().any(|s| s.contains("pool.trim")));
        b.free(&a1);
        assert_eq!(DeviceBackend::memory_info(&*b).free_bytes, 1024);
    }

    #[test]
    fn copy_round_trip() {
        let b = backend();
        let q = b.create_queue().unwrap();
        let alloc = b.alloc(16, Location::Device).unwrap();
        b.copy_in(&alloc, 4, &[1, 2, 3, 4], &q).unwrap();
        let mut out = [0u8; 4];
        b.copy_out(&alloc, 4, &mut out, &q).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_copy_is_rejected() {
        let b = backend();
        let q = b.create_queue().unwrap();
        let alloc = b.alloc(8, Location::Device).unwrap();
        let err = b.copy_in(&alloc, 6, &[0; 4], &q).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unregistered_kernel_fails_compilation() {
        let b = backend();
        let artifact = KernelArtifact::host_fn("no.such.kernel", &[]);
        let err = b.load_module(&artifact).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KernelCompilationFailed);
    }
}
