//! Kernel identity, compiled artifacts, and parameter layouts.
//!
//! The runtime never parses artifact internals: an external backend hands
//! over opaque payload bytes plus a layout descriptor declaring parameter
//! count, kinds, sizes, and alignments. Signatures are fingerprinted with
//! a stable hash so they can key the kernel cache across runs.

mod cache;
mod launcher;
mod persist;

pub use cache::{CacheStats, CachedKernel, KernelCache};
pub use launcher::{LaunchArg, LaunchResult, LaunchStatus, Launcher, ViewArg};
pub(crate) use persist::{load_directory, persist_directory};

use std::collections::BTreeMap;

use crate::config::OptLevel;
use crate::device::BackendKind;
use crate::element::ElemType;
use crate::error::{GpuError, GpuResult};

/// Kind of one kernel parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Plain scalar passed by value.
    Scalar,
    /// Device buffer view (passed as a device pointer).
    View,
    /// Opaque by-value struct.
    Struct,
}

/// Declared shape of one parameter slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamSpec {
    pub kind: ParamKind,
    /// Element type for views and typed scalars; `None` for structs.
    pub elem: Option<ElemType>,
    /// Marshalled size in bytes.
    pub size: usize,
    pub align: usize,
}

impl ParamSpec {
    pub fn scalar(elem: ElemType) -> Self {
        let size = elem.size_bytes();
        Self {
            kind: ParamKind::Scalar,
            elem: Some(elem),
            size,
            align: size,
        }
    }

    /// A buffer view slot; marshalled as a 64-bit device pointer.
    pub fn view(elem: ElemType) -> Self {
        Self {
            kind: ParamKind::View,
            elem: Some(elem),
            size: 8,
            align: 8,
        }
    }

    pub fn structure(size: usize, align: usize) -> Self {
        Self {
            kind: ParamKind::Struct,
            elem: None,
            size,
            align: align.max(1),
        }
    }
}

/// Identity of a kernel request.
///
/// Value type; fingerprinted via a stable FNV-1a hash over every field so
/// the same request always maps to the same cache key, across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSignature {
    name: String,
    params: Vec<ParamSpec>,
    device_kind: BackendKind,
    opt: OptLevel,
}

impl KernelSignature {
    pub fn new(
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        device_kind: BackendKind,
        opt: OptLevel,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            device_kind,
            opt,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn device_kind(&self) -> BackendKind {
        self.device_kind
    }

    pub fn opt(&self) -> OptLevel {
        self.opt
    }

    /// Stable 64-bit fingerprint of (name, parameter kinds + element
    /// types, device kind, optimization flags).
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = OFFSET;
        let mut eat = |bytes: &[u8]| {
            for &b in bytes {
                h ^= u64::from(b);
                h = h.wrapping_mul(PRIME);
            }
        };
        eat(self.name.as_bytes());
        eat(&[0xff]);
        for p in &self.params {
            eat(&[match p.kind {
                ParamKind::Scalar => 1,
                ParamKind::View => 2,
                ParamKind::Struct => 3,
            }]);
            eat(p.elem.map_or("-", ElemType::name).as_bytes());
            eat(&(p.size as u32).to_le_bytes());
        }
        eat(&[0xfe]);
        eat(self.device_kind.name().as_bytes());
        eat(self.opt.name().as_bytes());
        h
    }
}

/// Offsets of each slot inside the packed parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    slots: Vec<SlotLayout>,
    total_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub kind: ParamKind,
    pub elem: Option<ElemType>,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
}

impl ParamLayout {
    /// Lay slots out sequentially, aligning each to its declared
    /// alignment (the target ABI's natural alignment rules).
    pub fn from_specs(specs: &[ParamSpec]) -> Self {
        let mut slots = Vec::with_capacity(specs.len());
        let mut offset = 0usize;
        for spec in specs {
            let align = spec.align.max(1);
            offset = (offset + align - 1) / align * align;
            slots.push(SlotLayout {
                kind: spec.kind,
                elem: spec.elem,
                offset,
                size: spec.size,
                align,
            });
            offset += spec.size;
        }
        Self {
            slots,
            total_size: offset,
        }
    }

    pub fn slots(&self) -> &[SlotLayout] {
        &self.slots
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Checks that this layout can marshal calls for `signature`.
    pub fn matches(&self, signature: &KernelSignature) -> GpuResult<()> {
        let params = signature.params();
        if self.slots.len() != params.len() {
            return Err(GpuError::new(
                crate::error::ErrorKind::InvalidKernelParameters,
                format!(
                    "artifact declares {} parameters, signature has {}",
                    self.slots.len(),
                    params.len()
                ),
            )
            .with_kernel(signature.name()));
        }
        for (i, (slot, spec)) in self.slots.iter().zip(params).enumerate() {
            if slot.kind != spec.kind || slot.elem != spec.elem {
                return Err(GpuError::new(
                    crate::error::ErrorKind::InvalidKernelParameters,
                    format!("parameter {i} kind/type mismatch between artifact and signature"),
                )
                .with_kernel(signature.name()));
            }
        }
        Ok(())
    }
}

/// Opaque compiled payload from an external backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactPayload {
    /// PTX text for the CUDA driver.
    Ptx(String),
    /// SPIR-V words for OpenCL.
    SpirV(Vec<u8>),
    /// Native machine code.
    MachineCode(Vec<u8>),
    /// Name of a host function registered with the CPU simulator.
    HostFn(String),
}

impl ArtifactPayload {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Self::Ptx(_) => "ptx",
            Self::SpirV(_) => "spirv",
            Self::MachineCode(_) => "machine",
            Self::HostFn(_) => "hostfn",
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Self::Ptx(s) | Self::HostFn(s) => s.as_bytes(),
            Self::SpirV(b) | Self::MachineCode(b) => b,
        }
    }

    pub(crate) fn from_parts(tag: &str, bytes: Vec<u8>) -> Option<Self> {
        match tag {
            "ptx" => Some(Self::Ptx(String::from_utf8(bytes).ok()?)),
            "hostfn" => Some(Self::HostFn(String::from_utf8(bytes).ok()?)),
            "spirv" => Some(Self::SpirV(bytes)),
            "machine" => Some(Self::MachineCode(bytes)),
            _ => None,
        }
    }
}

/// A compiled kernel as delivered by an external backend.
#[derive(Debug, Clone)]
pub struct KernelArtifact {
    entry_point: String,
    payload: ArtifactPayload,
    layout: ParamLayout,
}

impl KernelArtifact {
    pub fn new(
        entry_point: impl Into<String>,
        payload: ArtifactPayload,
        layout: ParamLayout,
    ) -> Self {
        Self {
            entry_point: entry_point.into(),
            payload,
            layout,
        }
    }

    /// Artifact for a host function previously registered with the CPU
    /// simulator backend.
    pub fn host_fn(name: impl Into<String>, specs: &[ParamSpec]) -> Self {
        let name = name.into();
        Self {
            entry_point: name.clone(),
            payload: ArtifactPayload::HostFn(name),
            layout: ParamLayout::from_specs(specs),
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn payload(&self) -> &ArtifactPayload {
        &self.payload
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }
}

/// Grid/block configuration for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchDims {
    pub fn new(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self { grid, block }
    }

    /// 1-D launch covering `len` elements with `block_size` threads per
    /// block.
    pub fn linear(len: usize, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let blocks = (len as u64).div_ceil(u64::from(block_size)).max(1) as u32;
        Self {
            grid: [blocks, 1, 1],
            block: [block_size, 1, 1],
        }
    }

    /// Total number of launched threads.
    pub fn total_threads(&self) -> u64 {
        self.grid.iter().map(|&g| u64::from(g)).product::<u64>()
            * self.block.iter().map(|&b| u64::from(b)).product::<u64>()
    }
}

/// Free-form metadata attached to cache entries.
pub type KernelMetadata = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str, opt: OptLevel) -> KernelSignature {
        KernelSignature::new(
            name,
            vec![ParamSpec::view(ElemType::F32), ParamSpec::scalar(ElemType::U64)],
            BackendKind::Cpu,
            opt,
        )
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = sig("saxpy", OptLevel::Default);
        let b = sig("saxpy", OptLevel::Default);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), sig("daxpy", OptLevel::Default).fingerprint());
        assert_ne!(a.fingerprint(), sig("saxpy", OptLevel::Speed).fingerprint());

        let other_kind = KernelSignature::new(
            "saxpy",
            a.params().to_vec(),
            BackendKind::Cuda,
            OptLevel::Default,
        );
        assert_ne!(a.fingerprint(), other_kind.fingerprint());
    }

    #[test]
    fn layout_respects_alignment() {
        let layout = ParamLayout::from_specs(&[
            ParamSpec::scalar(ElemType::U8),
            ParamSpec::scalar(ElemType::F64),
            ParamSpec::view(ElemType::F32),
        ]);
        let slots = layout.slots();
        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[1].offset, 8);
        assert_eq!(slots[2].offset, 16);
        assert_eq!(layout.total_size(), 24);
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let signature = sig("saxpy", OptLevel::Default);
        let layout = ParamLayout::from_specs(&[ParamSpec::view(ElemType::F32)]);
        let err = layout.matches(&signature).unwrap_err();
        assert_eq!(
            err.kind(),
            crate::error::ErrorKind::InvalidKernelParameters
        );
    }

    #[test]
    fn linear_dims_cover_length() {
        let dims = LaunchDims::linear(1000, 256);
        assert_eq!(dims.grid[0], 4);
        assert!(dims.total_threads() >= 1000);
        assert_eq!(LaunchDims::linear(0, 256).grid[0], 1);
    }
}
