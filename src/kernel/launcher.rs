//! Typed kernel dispatch.
//!
//! A `Launcher` binds one compiled artifact to its signature and packs
//! call arguments into an ABI-aligned parameter buffer before driver
//! submission. Arity, kind, and element-type mismatches are rejected
//! before anything reaches the device.

use std::sync::Arc;
use std::time::{Duration, Instant};

use half::{bf16, f16};

use crate::backend::{DeviceBackend, ModuleHandle, PackedParams, ResolvedSlot, ViewRef};
use crate::buffer::{BufferInner, MemoryBuffer};
use crate::device::DeviceId;
use crate::element::{Element, ElemType};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{KernelArtifact, KernelSignature, LaunchDims, ParamKind};
use crate::stream::{AsyncHandle, CancelToken, Stream};

/// A buffer passed as a kernel view argument. Holds the buffer alive
/// until the launch has executed.
pub struct ViewArg {
    pub(crate) inner: Arc<BufferInner>,
}

impl std::fmt::Debug for ViewArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewArg").finish()
    }
}

/// One kernel call argument.
pub enum LaunchArg {
    F32(f32),
    F64(f64),
    F16(f16),
    BF16(bf16),
    I8(i8),
    U8(u8),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    View(ViewArg),
    Struct(Vec<u8>),
}

impl std::fmt::Debug for LaunchArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F32(v) => f.debug_tuple("F32").field(v).finish(),
            Self::F64(v) => f.debug_tuple("F64").field(v).finish(),
            Self::F16(v) => f.debug_tuple("F16").field(v).finish(),
            Self::BF16(v) => f.debug_tuple("BF16").field(v).finish(),
            Self::I8(v) => f.debug_tuple("I8").field(v).finish(),
            Self::U8(v) => f.debug_tuple("U8").field(v).finish(),
            Self::I32(v) => f.debug_tuple("I32").field(v).finish(),
            Self::U32(v) => f.debug_tuple("U32").field(v).finish(),
            Self::I64(v) => f.debug_tuple("I64").field(v).finish(),
            Self::U64(v) => f.debug_tuple("U64").field(v).finish(),
            Self::View(v) => f.debug_tuple("View").field(v).finish(),
            Self::Struct(v) => f.debug_tuple("Struct").field(v).finish(),
        }
    }
}

impl LaunchArg {
    fn scalar_elem(&self) -> Option<ElemType> {
        Some(match self {
            Self::F32(_) => ElemType::F32,
            Self::F64(_) => ElemType::F64,
            Self::F16(_) => ElemType::F16,
            Self::BF16(_) => ElemType::BF16,
            Self::I8(_) => ElemType::I8,
            Self::U8(_) => ElemType::U8,
            Self::I32(_) => ElemType::I32,
            Self::U32(_) => ElemType::U32,
            Self::I64(_) => ElemType::I64,
            Self::U64(_) => ElemType::U64,
            Self::View(_) | Self::Struct(_) => return None,
        })
    }

    fn write_scalar(&self, out: &mut [u8]) {
        match self {
            Self::F32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::F16(v) => out.copy_from_slice(&v.to_bits().to_le_bytes()),
            Self::BF16(v) => out.copy_from_slice(&v.to_bits().to_le_bytes()),
            Self::I8(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::U8(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Self::View(_) | Self::Struct(_) => unreachable!("scalar write on non-scalar"),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::View(_) => "view",
            Self::Struct(_) => "struct",
            _ => "scalar",
        }
    }
}

impl<E: Element> MemoryBuffer<E> {
    /// Pass this buffer as a kernel view argument.
    pub fn arg(&self) -> GpuResult<LaunchArg> {
        // Liveness is re-checked at pack time too; failing early gives
        // the caller a better error site.
        self.inner.checked_alloc()?;
        Ok(LaunchArg::View(ViewArg {
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Completion report of an async launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct LaunchResult {
    pub status: LaunchStatus,
    pub elapsed: Duration,
}

/// Reusable dispatch stub for one kernel signature.
pub struct Launcher {
    signature: Arc<KernelSignature>,
    artifact: Arc<KernelArtifact>,
    module: Arc<ModuleHandle>,
    backend: Arc<dyn DeviceBackend>,
    device: DeviceId,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("signature", &self.signature.name())
            .field("device", &self.device)
            .finish()
    }
}

impl Launcher {
    pub(crate) fn new(
        signature: Arc<KernelSignature>,
        artifact: Arc<KernelArtifact>,
        module: ModuleHandle,
        backend: Arc<dyn DeviceBackend>,
        device: DeviceId,
    ) -> Self {
        Self {
            signature,
            artifact,
            module: Arc::new(module),
            backend,
            device,
        }
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    pub fn entry_point(&self) -> &str {
        self.artifact.entry_point()
    }

    fn param_error(&self, message: String) -> GpuError {
        GpuError::new(ErrorKind::InvalidKernelParameters, message)
            .with_device(self.device)
            .with_kernel(self.signature.name())
    }

    /// Pack `args` into a parameter buffer per the artifact layout.
    fn pack(&self, args: &[LaunchArg]) -> GpuResult<PackedParams> {
        let layout = self.artifact.layout();
        let slots = layout.slots();
        if args.len() != slots.len() {
            return Err(self.param_error(format!(
                "kernel takes {} parameters, {} were supplied",
                slots.len(),
                args.len()
            )));
        }

        let mut bytes = vec![0u8; layout.total_size()];
        let mut resolved = Vec::with_capacity(slots.len());
        for (i, (slot, arg)) in slots.iter().zip(args).enumerate() {
            let mut view = None;
            match slot.kind {
                ParamKind::Scalar => {
                    let elem = arg.scalar_elem().ok_or_else(|| {
                        self.param_error(format!(
                            "parameter {i} expects a scalar, got a {}",
                            arg.kind_name()
                        ))
                    })?;
                    if slot.elem != Some(elem) || slot.size != elem.size_bytes() {
                        return Err(self.param_error(format!(
                            "parameter {i} expects {} scalar, got {elem}",
                            slot.elem.map_or("untyped", ElemType::name),
                        )));
                    }
                    arg.write_scalar(&mut bytes[slot.offset..slot.offset + slot.size]);
                }
                ParamKind::View => {
                    let LaunchArg::View(view_arg) = arg else {
                        return Err(self.param_error(format!(
                            "parameter {i} expects a buffer view, got a {}",
                            arg.kind_name()
                        )));
                    };
                    if slot.elem != Some(view_arg.inner.elem) {
                        return Err(self.param_error(format!(
                            "parameter {i} expects a {} view, got {}",
                            slot.elem.map_or("untyped", ElemType::name),
                            view_arg.inner.elem
                        )));
                    }
                    let alloc = view_arg.inner.checked_alloc()?;
                    bytes[slot.offset..slot.offset + 8].copy_from_slice(&alloc.ptr.to_le_bytes());
                    view = Some(ViewRef {
                        alloc_id: alloc.id,
                        ptr: alloc.ptr,
                        len_elems: view_arg.inner.len(),
                        elem: view_arg.inner.elem,
                    });
                }
                ParamKind::Struct => {
                    let LaunchArg::Struct(data) = arg else {
                        return Err(self.param_error(format!(
                            "parameter {i} expects a struct, got a {}",
                            arg.kind_name()
                        )));
                    };
                    if data.len() != slot.size {
                        return Err(self.param_error(format!(
                            "parameter {i} struct is {} bytes, layout declares {}",
                            data.len(),
                            slot.size
                        )));
                    }
                    bytes[slot.offset..slot.offset + slot.size].copy_from_slice(data);
                }
            }
            resolved.push(ResolvedSlot {
                kind: slot.kind,
                offset: slot.offset,
                size: slot.size,
                view,
            });
        }
        Ok(PackedParams {
            bytes,
            slots: resolved,
        })
    }

    fn keep_alive(args: Vec<LaunchArg>) -> Vec<Arc<BufferInner>> {
        args.into_iter()
            .filter_map(|arg| match arg {
                LaunchArg::View(v) => Some(v.inner),
                _ => None,
            })
            .collect()
    }

    /// Enqueue a launch on `stream`. Returns as soon as the command is
    /// queued; failures surface at the next synchronize.
    pub fn launch(
        &self,
        dims: LaunchDims,
        args: Vec<LaunchArg>,
        stream: &Stream,
    ) -> GpuResult<()> {
        let params = self.pack(&args)?;
        let buffers = Self::keep_alive(args);
        let module = Arc::clone(&self.module);
        stream.enqueue("kernel_launch", move |backend, queue| {
            let result = backend.launch(&module, &dims, &params, queue);
            drop(buffers);
            result
        })
    }

    /// Launch and wait for completion.
    pub fn launch_blocking(
        &self,
        dims: LaunchDims,
        args: Vec<LaunchArg>,
        stream: &Stream,
    ) -> GpuResult<()> {
        self.launch(dims, args, stream)?;
        stream.synchronize()
    }

    /// Cancellable async launch. A token observed as cancelled before
    /// the command reaches the device skips the launch and reports
    /// `Cancelled`; work already submitted runs to completion.
    pub fn launch_async(
        &self,
        dims: LaunchDims,
        args: Vec<LaunchArg>,
        stream: &Stream,
        cancel: CancelToken,
    ) -> GpuResult<AsyncHandle<LaunchResult>> {
        if cancel.is_cancelled() {
            return Err(GpuError::cancelled("kernel launch")
                .with_device(self.device)
                .with_kernel(self.signature.name()));
        }
        let params = self.pack(&args)?;
        let buffers = Self::keep_alive(args);
        let module = Arc::clone(&self.module);
        stream.enqueue_async("kernel_launch_async", move |backend, queue| {
            if cancel.is_cancelled() {
                return Ok(LaunchResult {
                    status: LaunchStatus::Cancelled,
                    elapsed: Duration::ZERO,
                });
            }
            let start = Instant::now();
            let result = backend.launch(&module, &dims, &params, queue);
            drop(buffers);
            result?;
            backend.queue_sync(queue)?;
            Ok(LaunchResult {
                status: LaunchStatus::Completed,
                elapsed: start.elapsed(),
            })
        })
    }
}

macro_rules! impl_scalar_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$ty> for LaunchArg {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })+
    };
}

impl_scalar_from!(
    f32 => F32, f64 => F64, f16 => F16, bf16 => BF16,
    i8 => I8, u8 => U8, i32 => I32, u32 => U32, i64 => I64, u64 => U64,
);
