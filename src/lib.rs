//! accel-runtime: a host-side compute runtime for heterogeneous
//! accelerators.
//!
//! Compiled kernels are cached by signature fingerprint, device memory is
//! pooled per element type, and high-level operations route between
//! vectorized host execution and device kernels. Three backends: NVIDIA
//! CUDA (feature `cuda`, via `cudarc`), OpenCL (feature `opencl`, via a
//! dlopen'd ICD loader), and an always-available in-process CPU
//! simulator whose kernels are registered host functions.
//!
//! ```no_run
//! use accel_runtime::{Context, LayoutHint, Shape};
//!
//! let ctx = Context::new()?;
//! let accel = ctx.default_accelerator()?;
//! let buf = accel.alloc::<f32>(Shape::d1(4096), LayoutHint::Auto)?;
//! buf.copy_from_host(&vec![1.0; 4096], None)?;
//! # Ok::<(), accel_runtime::GpuError>(())
//! ```

mod accelerator;
mod backend;
mod buffer;
mod catalog;
mod config;
mod context;
mod cpu_kernels;
mod device;
mod element;
mod error;
mod hybrid;
mod kernel;
mod pool;
mod recovery;
mod stream;

pub use accelerator::Accelerator;
pub use backend::cpu::{HostArgs, HostKernel};
pub use buffer::{ArrayView, LayoutHint, Location, MemoryBuffer, MigrateTo, Shape, UnifiedBuffer};
pub use catalog::{DeviceCatalog, DeviceFilter};
pub use config::{
    CacheConfig, HybridConfig, OptLevel, PoolConfig, PreferredBackend, RetentionPolicy,
    RuntimeConfig,
};
pub use context::{Context, ContextBuilder};
pub use cpu_kernels::{isa_level, IsaLevel};
pub use device::{
    BackendKind, Capabilities, Device, DeviceId, DevicePayload, DeviceStatus, Feature,
    MemoryInfo, TensorPrecision,
};
pub use element::{ElemType, Element};
pub use error::{ErrorKind, GpuError, GpuResult, Severity};
pub use hybrid::{HybridDispatcher, OpKind, ReduceOp, Strategy};
pub use kernel::{
    ArtifactPayload, CacheStats, CachedKernel, KernelArtifact, KernelCache, KernelMetadata,
    KernelSignature, LaunchArg, LaunchDims, LaunchResult, LaunchStatus, Launcher, ParamKind,
    ParamLayout, ParamSpec, SlotLayout, ViewArg,
};
pub use pool::{MemoryPool, PoolStats};
pub use recovery::{CollectingLogger, ErrorLogger, ErrorRecord, FacadeLogger, RecoveryDispatcher};
pub use stream::{AsyncHandle, CancelToken, Event, Stream};
