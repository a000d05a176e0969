//! Hybrid CPU/GPU operation dispatch.
//!
//! Routes high-level operations to the vectorized host path, the
//! device's general kernels, matrix hardware, or a split across both.
//! Auto-selection is deterministic in the inputs: small working sets go
//! to the CPU, tensor-eligible matmuls to matrix units, everything else
//! to the device unless the device *is* the host.

use crate::accelerator::Accelerator;
use crate::buffer::MemoryBuffer;
use crate::config::HybridConfig;
use crate::device::BackendKind;
use crate::element::{Element, ElemType};
use crate::error::{ErrorKind, GpuError, GpuResult};
use crate::kernel::{
    KernelArtifact, KernelSignature, LaunchArg, LaunchDims, ParamSpec,
};
use crate::cpu_kernels;

/// Kernel-cache version for the built-in operation kernels.
const BUILTIN_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Matrix hardware wants every dimension at this size or above.
const TENSOR_MIN_DIM: usize = 16;

/// Execution strategy for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Auto,
    CpuSimd,
    GpuGeneral,
    GpuTensorCore,
    Hybrid,
}

/// Operations the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Mul,
    MatMul,
    Reduce,
    Transpose,
    Convolve,
}

impl OpKind {
    fn builtin(&self) -> Option<&'static str> {
        Some(match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::MatMul => "matmul",
            Self::Transpose => "transpose",
            Self::Reduce | Self::Convolve => return None,
        })
    }
}

/// Reduction flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Per-accelerator operation router.
pub struct HybridDispatcher {
    accel: Accelerator,
    config: HybridConfig,
}

impl HybridDispatcher {
    pub fn new(accel: Accelerator) -> Self {
        let config = accel.shared.config.hybrid.clone();
        Self { accel, config }
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accel
    }

    /// Resolve `Auto` into a concrete strategy. Deterministic given the
    /// inputs; `Hybrid` is never auto-selected.
    pub fn select(&self, op: OpKind, total_elems: usize, min_dim: usize, elem: ElemType) -> Strategy {
        if total_elems < self.config.small_threshold {
            return Strategy::CpuSimd;
        }
        let caps = self.accel.capabilities();
        if self.accel.supports_tensor_cores()
            && matches!(op, OpKind::MatMul | OpKind::Convolve)
            && caps.tensor_core_eligible(elem)
            && min_dim >= TENSOR_MIN_DIM
        {
            return Strategy::GpuTensorCore;
        }
        if self.accel.device_id().kind() != BackendKind::Cpu {
            return Strategy::GpuGeneral;
        }
        Strategy::CpuSimd
    }

    fn resolve(&self, op: OpKind, total: usize, min_dim: usize, elem: ElemType, strategy: Strategy) -> GpuResult<Strategy> {
        Ok(match strategy {
            Strategy::Auto => self.select(op, total, min_dim, elem),
            Strategy::GpuTensorCore => {
                if !self.accel.supports_tensor_cores()
                    || !self.accel.capabilities().tensor_core_eligible(elem)
                {
                    return Err(GpuError::unsupported(format!(
                        "device has no matrix hardware for {elem}"
                    ))
                    .with_device(self.accel.device_id()));
                }
                Strategy::GpuTensorCore
            }
            other => other,
        })
    }

    /// CPU share of the outermost dimension under `Hybrid`.
    fn split_point(&self, outer: usize) -> usize {
        ((outer as f64) * self.config.cpu_gpu_ratio).round() as usize
    }

    // ── element-wise ─────────────────────────────────────────────

    /// `out = a + b`. Returns the strategy that actually ran.
    pub fn add<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        strategy: Strategy,
    ) -> GpuResult<Strategy> {
        self.elementwise(OpKind::Add, a, b, out, strategy)
    }

    /// `out = a * b` (element-wise).
    pub fn mul<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        strategy: Strategy,
    ) -> GpuResult<Strategy> {
        self.elementwise(OpKind::Mul, a, b, out, strategy)
    }

    fn elementwise<E: Element>(
        &self,
        op: OpKind,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        strategy: Strategy,
    ) -> GpuResult<Strategy> {
        let len = out.len();
        if a.len() != len || b.len() != len {
            return Err(GpuError::invalid_argument(format!(
                "{op:?}: operand lengths {}/{}/{} differ",
                a.len(),
                b.len(),
                len
            )));
        }
        let chosen = self.resolve(op, len, len, E::ELEM, strategy)?;
        match chosen {
            Strategy::CpuSimd => {
                self.cpu_elementwise(op, a, b, out, 0, len)?;
                Ok(Strategy::CpuSimd)
            }
            Strategy::GpuGeneral | Strategy::GpuTensorCore => {
                match self.launch_elementwise(op, a, b, out, 0, len) {
                    Ok(()) => Ok(Strategy::GpuGeneral),
                    Err(e) if fallback_worthy(&e) => {
                        log::debug!("{op:?} falling back to CPU-SIMD: {e}");
                        self.cpu_elementwise(op, a, b, out, 0, len)?;
                        Ok(Strategy::CpuSimd)
                    }
                    Err(e) => Err(e),
                }
            }
            Strategy::Hybrid => {
                let split = self.split_point(len);
                // Device part first, asynchronously.
                let stream = self.accel.default_stream().clone();
                self.launch_elementwise_async(op, a, b, out, split, len, &stream)?;
                let event = stream.record_event()?;
                // Host part on the calling worker.
                self.cpu_elementwise(op, a, b, out, 0, split)?;
                event.wait_blocking()?;
                stream.synchronize()?;
                Ok(Strategy::Hybrid)
            }
            Strategy::Auto => unreachable!("resolve() never returns Auto"),
        }
    }

    fn cpu_elementwise<E: Element>(
        &self,
        op: OpKind,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        start: usize,
        end: usize,
    ) -> GpuResult<()> {
        if start >= end {
            return Ok(());
        }
        let run = |av: &[E], bv: &[E], ov: &mut [E]| match op {
            OpKind::Add => cpu_kernels::add(av, bv, ov, start, end),
            OpKind::Mul => cpu_kernels::mul(av, bv, ov, start, end),
            _ => unreachable!("not an element-wise op"),
        };
        // Zero-copy when the memory is mapped, staged otherwise.
        if let (Some(av), Some(bv), Some(ov)) =
            (a.host_slice()?, b.host_slice()?, out.host_slice_mut()?)
        {
            return run(av, bv, ov);
        }
        let mut av = vec![E::default(); a.len()];
        a.copy_to_host(&mut av)?;
        let mut bv = vec![E::default(); b.len()];
        b.copy_to_host(&mut bv)?;
        let mut ov = vec![E::default(); end - start];
        {
            let mut staged = vec![E::default(); out.len()];
            run(&av, &bv, &mut staged)?;
            ov.copy_from_slice(&staged[start..end]);
        }
        out.write_region(start, &ov)
    }

    fn launch_elementwise<E: Element>(
        &self,
        op: OpKind,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        start: usize,
        end: usize,
    ) -> GpuResult<()> {
        let stream = self.accel.default_stream().clone();
        self.launch_elementwise_async(op, a, b, out, start, end, &stream)?;
        stream.synchronize()
    }

    fn launch_elementwise_async<E: Element>(
        &self,
        op: OpKind,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        start: usize,
        end: usize,
        stream: &crate::stream::Stream,
    ) -> GpuResult<()> {
        if start >= end {
            return Ok(());
        }
        let launcher = self.builtin_launcher(
            op,
            E::ELEM,
            vec![
                ParamSpec::view(E::ELEM),
                ParamSpec::view(E::ELEM),
                ParamSpec::view(E::ELEM),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
            ],
        )?;
        launcher.launch(
            LaunchDims::linear(end - start, 256),
            vec![
                a.arg()?,
                b.arg()?,
                out.arg()?,
                LaunchArg::U64(start as u64),
                LaunchArg::U64(end as u64),
            ],
            stream,
        )
    }

    // ── matmul ───────────────────────────────────────────────────

    /// Row-major `out[m×n] = a[m×k] · b[k×n]`.
    pub fn matmul<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        m: usize,
        k: usize,
        n: usize,
        strategy: Strategy,
    ) -> GpuResult<Strategy> {
        if a.len() != m * k || b.len() != k * n || out.len() != m * n {
            return Err(GpuError::invalid_argument(format!(
                "matmul: buffers do not match {m}×{k} · {k}×{n}"
            )));
        }
        let min_dim = m.min(k).min(n);
        let chosen = self.resolve(OpKind::MatMul, m * n, min_dim, E::ELEM, strategy)?;
        match chosen {
            Strategy::CpuSimd => {
                self.cpu_matmul(a, b, out, k, n, 0, m)?;
                Ok(Strategy::CpuSimd)
            }
            // Matrix hardware and general compute share the built-in
            // path here; a real device backend picks its own kernel.
            Strategy::GpuGeneral | Strategy::GpuTensorCore => {
                match self.launch_matmul(a, b, out, k, n, 0, m, None) {
                    Ok(()) => Ok(chosen),
                    Err(e) if fallback_worthy(&e) => {
                        log::debug!("matmul falling back to CPU-SIMD: {e}");
                        self.cpu_matmul(a, b, out, k, n, 0, m)?;
                        Ok(Strategy::CpuSimd)
                    }
                    Err(e) => Err(e),
                }
            }
            Strategy::Hybrid => {
                let split = self.split_point(m);
                let stream = self.accel.default_stream().clone();
                self.launch_matmul(a, b, out, k, n, split, m, Some(&stream))?;
                let event = stream.record_event()?;
                self.cpu_matmul(a, b, out, k, n, 0, split)?;
                event.wait_blocking()?;
                stream.synchronize()?;
                Ok(Strategy::Hybrid)
            }
            Strategy::Auto => unreachable!("resolve() never returns Auto"),
        }
    }

    fn cpu_matmul<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        k: usize,
        n: usize,
        row_start: usize,
        row_end: usize,
    ) -> GpuResult<()> {
        if row_start >= row_end {
            return Ok(());
        }
        if let (Some(av), Some(bv), Some(ov)) =
            (a.host_slice()?, b.host_slice()?, out.host_slice_mut()?)
        {
            return cpu_kernels::matmul(av, bv, ov, k, n, row_start, row_end);
        }
        let mut av = vec![E::default(); a.len()];
        a.copy_to_host(&mut av)?;
        let mut bv = vec![E::default(); b.len()];
        b.copy_to_host(&mut bv)?;
        let mut staged = vec![E::default(); out.len()];
        cpu_kernels::matmul(&av, &bv, &mut staged, k, n, row_start, row_end)?;
        out.write_region(row_start * n, &staged[row_start * n..row_end * n])
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_matmul<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        b: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        k: usize,
        n: usize,
        row_start: usize,
        row_end: usize,
        stream: Option<&crate::stream::Stream>,
    ) -> GpuResult<()> {
        if row_start >= row_end {
            return Ok(());
        }
        let launcher = self.builtin_launcher(
            OpKind::MatMul,
            E::ELEM,
            vec![
                ParamSpec::view(E::ELEM),
                ParamSpec::view(E::ELEM),
                ParamSpec::view(E::ELEM),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
            ],
        )?;
        let args = vec![
            a.arg()?,
            b.arg()?,
            out.arg()?,
            LaunchArg::U64(k as u64),
            LaunchArg::U64(n as u64),
            LaunchArg::U64(row_start as u64),
            LaunchArg::U64(row_end as u64),
        ];
        let dims = LaunchDims::linear((row_end - row_start) * n, 256);
        match stream {
            Some(stream) => launcher.launch(dims, args, stream),
            None => launcher.launch_blocking(dims, args, self.accel.default_stream()),
        }
    }

    // ── reduce ───────────────────────────────────────────────────

    /// Reduce the whole buffer. Returns the value and the strategy used.
    pub fn reduce<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        op: ReduceOp,
        strategy: Strategy,
    ) -> GpuResult<(E, Strategy)> {
        let len = a.len();
        if len == 0 {
            return Err(GpuError::invalid_argument("reduce over an empty buffer"));
        }
        let chosen = self.resolve(OpKind::Reduce, len, len, E::ELEM, strategy)?;
        match chosen {
            Strategy::CpuSimd => Ok((self.cpu_reduce(a, op, 0, len)?, Strategy::CpuSimd)),
            Strategy::GpuGeneral | Strategy::GpuTensorCore => {
                match self.device_reduce(a, op, 0, len) {
                    Ok(v) => Ok((v, Strategy::GpuGeneral)),
                    Err(e) if fallback_worthy(&e) => {
                        log::debug!("reduce falling back to CPU-SIMD: {e}");
                        Ok((self.cpu_reduce(a, op, 0, len)?, Strategy::CpuSimd))
                    }
                    Err(e) => Err(e),
                }
            }
            Strategy::Hybrid => {
                let split = self.split_point(len);
                if split == 0 {
                    let v = self.device_reduce(a, op, 0, len)?;
                    return Ok((v, Strategy::Hybrid));
                }
                if split >= len {
                    let v = self.cpu_reduce(a, op, 0, len)?;
                    return Ok((v, Strategy::Hybrid));
                }
                let device_part = self.device_reduce(a, op, split, len)?;
                let host_part = self.cpu_reduce(a, op, 0, split)?;
                let combined = match op {
                    ReduceOp::Sum => host_part.elem_add(device_part),
                    ReduceOp::Max => {
                        if host_part > device_part {
                            host_part
                        } else {
                            device_part
                        }
                    }
                };
                Ok((combined, Strategy::Hybrid))
            }
            Strategy::Auto => unreachable!("resolve() never returns Auto"),
        }
    }

    fn cpu_reduce<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        op: ReduceOp,
        start: usize,
        end: usize,
    ) -> GpuResult<E> {
        let reduce = |data: &[E]| match op {
            ReduceOp::Sum => Ok(cpu_kernels::reduce_sum(data, start, end)),
            ReduceOp::Max => cpu_kernels::reduce_max(data, start, end)
                .ok_or_else(|| GpuError::invalid_argument("reduce over an empty range")),
        };
        if let Some(av) = a.host_slice()? {
            return reduce(av);
        }
        let mut av = vec![E::default(); a.len()];
        a.copy_to_host(&mut av)?;
        reduce(&av)
    }

    fn device_reduce<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        op: ReduceOp,
        start: usize,
        end: usize,
    ) -> GpuResult<E> {
        if start >= end {
            return match op {
                ReduceOp::Sum => Ok(E::ZERO),
                ReduceOp::Max => Err(GpuError::invalid_argument("reduce over an empty range")),
            };
        }
        let name = format!(
            "accel.reduce_{}.{}",
            match op {
                ReduceOp::Sum => "sum",
                ReduceOp::Max => "max",
            },
            E::ELEM
        );
        let specs = vec![
            ParamSpec::view(E::ELEM),
            ParamSpec::view(E::ELEM),
            ParamSpec::scalar(ElemType::U64),
            ParamSpec::scalar(ElemType::U64),
        ];
        let signature = KernelSignature::new(
            name.clone(),
            specs.clone(),
            self.accel.device_id().kind(),
            self.accel.shared.config.kernel_optimization,
        );
        let launcher = self.accel.load_kernel_cached(signature, BUILTIN_VERSION, || {
            Ok(KernelArtifact::host_fn(name.clone(), &specs))
        })?;
        let scratch: MemoryBuffer<E> =
            self.accel
                .alloc(crate::buffer::Shape::d1(1), crate::buffer::LayoutHint::GpuOptimized)?;
        launcher.launch_blocking(
            LaunchDims::linear(end - start, 256),
            vec![
                a.arg()?,
                scratch.arg()?,
                LaunchArg::U64(start as u64),
                LaunchArg::U64(end as u64),
            ],
            self.accel.default_stream(),
        )?;
        let mut out = [E::default()];
        scratch.copy_to_host(&mut out)?;
        Ok(out[0])
    }

    // ── transpose ────────────────────────────────────────────────

    /// `out[cols×rows] = aᵀ` for a row-major `a[rows×cols]`.
    pub fn transpose<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        rows: usize,
        cols: usize,
        strategy: Strategy,
    ) -> GpuResult<Strategy> {
        if a.len() != rows * cols || out.len() != rows * cols {
            return Err(GpuError::invalid_argument(format!(
                "transpose: buffers do not match {rows}×{cols}"
            )));
        }
        let chosen = self.resolve(OpKind::Transpose, rows * cols, rows.min(cols), E::ELEM, strategy)?;
        match chosen {
            Strategy::CpuSimd => {
                self.cpu_transpose(a, out, rows, cols, 0, rows)?;
                Ok(Strategy::CpuSimd)
            }
            Strategy::GpuGeneral | Strategy::GpuTensorCore => {
                match self.launch_transpose(a, out, rows, cols, 0, rows, None) {
                    Ok(()) => Ok(Strategy::GpuGeneral),
                    Err(e) if fallback_worthy(&e) => {
                        log::debug!("transpose falling back to CPU-SIMD: {e}");
                        self.cpu_transpose(a, out, rows, cols, 0, rows)?;
                        Ok(Strategy::CpuSimd)
                    }
                    Err(e) => Err(e),
                }
            }
            Strategy::Hybrid => {
                let split = self.split_point(rows);
                let stream = self.accel.default_stream().clone();
                self.launch_transpose(a, out, rows, cols, split, rows, Some(&stream))?;
                let event = stream.record_event()?;
                self.cpu_transpose(a, out, rows, cols, 0, split)?;
                event.wait_blocking()?;
                stream.synchronize()?;
                Ok(Strategy::Hybrid)
            }
            Strategy::Auto => unreachable!("resolve() never returns Auto"),
        }
    }

    fn cpu_transpose<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        rows: usize,
        cols: usize,
        row_start: usize,
        row_end: usize,
    ) -> GpuResult<()> {
        if row_start >= row_end {
            return Ok(());
        }
        if let (Some(av), Some(ov)) = (a.host_slice()?, out.host_slice_mut()?) {
            return cpu_kernels::transpose(av, ov, rows, cols, row_start, row_end);
        }
        let mut av = vec![E::default(); a.len()];
        a.copy_to_host(&mut av)?;
        // The written columns are scattered; stage the whole output.
        let mut current = vec![E::default(); out.len()];
        out.copy_to_host(&mut current)?;
        cpu_kernels::transpose(&av, &mut current, rows, cols, row_start, row_end)?;
        out.copy_from_host(&current, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_transpose<E: Element>(
        &self,
        a: &MemoryBuffer<E>,
        out: &MemoryBuffer<E>,
        rows: usize,
        cols: usize,
        row_start: usize,
        row_end: usize,
        stream: Option<&crate::stream::Stream>,
    ) -> GpuResult<()> {
        if row_start >= row_end {
            return Ok(());
        }
        let launcher = self.builtin_launcher(
            OpKind::Transpose,
            E::ELEM,
            vec![
                ParamSpec::view(E::ELEM),
                ParamSpec::view(E::ELEM),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
                ParamSpec::scalar(ElemType::U64),
            ],
        )?;
        let args = vec![
            a.arg()?,
            out.arg()?,
            LaunchArg::U64(rows as u64),
            LaunchArg::U64(cols as u64),
            LaunchArg::U64(row_start as u64),
            LaunchArg::U64(row_end as u64),
        ];
        let dims = LaunchDims::linear((row_end - row_start) * cols, 256);
        match stream {
            Some(stream) => launcher.launch(dims, args, stream),
            None => launcher.launch_blocking(dims, args, self.accel.default_stream()),
        }
    }

    // ── built-in kernel plumbing ─────────────────────────────────

    fn builtin_launcher(
        &self,
        op: OpKind,
        elem: ElemType,
        specs: Vec<ParamSpec>,
    ) -> GpuResult<crate::kernel::Launcher> {
        let Some(stem) = op.builtin() else {
            return Err(GpuError::unsupported(format!(
                "{op:?} has no built-in device kernel"
            )));
        };
        let name = format!("accel.{stem}.{elem}");
        let signature = KernelSignature::new(
            name.clone(),
            specs.clone(),
            self.accel.device_id().kind(),
            self.accel.shared.config.kernel_optimization,
        );
        self.accel.load_kernel_cached(signature, BUILTIN_VERSION, move || {
            Ok(KernelArtifact::host_fn(name, &specs))
        })
    }
}

/// Device-path failures that should quietly fall back to the host path:
/// the kernel repertoire simply does not cover this op/type here.
fn fallback_worthy(e: &GpuError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::KernelCompilationFailed | ErrorKind::Unsupported
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{LayoutHint, Shape};
    use crate::context::Context;

    fn dispatcher(ctx: &Context) -> HybridDispatcher {
        HybridDispatcher::new(ctx.default_accelerator().unwrap())
    }

    fn upload(ctx: &Context, data: &[f32]) -> MemoryBuffer<f32> {
        let accel = ctx.default_accelerator().unwrap();
        let buf = accel
            .alloc::<f32>(Shape::d1(data.len()), LayoutHint::GpuOptimized)
            .unwrap();
        buf.copy_from_host(data, None).unwrap();
        buf
    }

    #[test]
    fn auto_prefers_cpu_for_small_inputs() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        assert_eq!(
            d.select(OpKind::Add, 16, 16, ElemType::F32),
            Strategy::CpuSimd
        );
        // On the simulator, big inputs still resolve to the host path.
        assert_eq!(
            d.select(OpKind::Add, 1 << 22, 1 << 22, ElemType::F32),
            Strategy::CpuSimd
        );
    }

    #[test]
    fn add_runs_on_every_strategy() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        let accel = ctx.default_accelerator().unwrap();
        let a_data: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let b_data: Vec<f32> = (0..1000).map(|i| (i * 2) as f32).collect();
        for strategy in [
            Strategy::Auto,
            Strategy::CpuSimd,
            Strategy::GpuGeneral,
            Strategy::Hybrid,
        ] {
            let a = upload(&ctx, &a_data);
            let b = upload(&ctx, &b_data);
            let out = accel
                .alloc::<f32>(Shape::d1(1000), LayoutHint::GpuOptimized)
                .unwrap();
            d.add(&a, &b, &out, strategy).unwrap();
            let mut result = vec![0f32; 1000];
            out.copy_to_host(&mut result).unwrap();
            for i in 0..1000 {
                assert_eq!(result[i], (i * 3) as f32, "strategy {strategy:?}");
            }
        }
    }

    #[test]
    fn matmul_agrees_across_strategies() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        let accel = ctx.default_accelerator().unwrap();
        let (m, k, n) = (20, 15, 10);
        let a_data: Vec<f32> = (0..m * k).map(|i| ((i % 5) as f32) - 2.0).collect();
        let b_data: Vec<f32> = (0..k * n).map(|i| ((i % 3) as f32) * 0.5).collect();
        let mut reference = vec![0f32; m * n];
        cpu_kernels::matmul(&a_data, &b_data, &mut reference, k, n, 0, m).unwrap();

        for strategy in [Strategy::CpuSimd, Strategy::GpuGeneral, Strategy::Hybrid] {
            let a = upload(&ctx, &a_data);
            let b = upload(&ctx, &b_data);
            let out = accel
                .alloc::<f32>(Shape::d1(m * n), LayoutHint::GpuOptimized)
                .unwrap();
            d.matmul(&a, &b, &out, m, k, n, strategy).unwrap();
            let mut result = vec![0f32; m * n];
            out.copy_to_host(&mut result).unwrap();
            for (x, y) in result.iter().zip(&reference) {
                assert!((x - y).abs() < 1e-4, "strategy {strategy:?}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn reduce_sum_and_max() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        let data: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        let a = upload(&ctx, &data);
        for strategy in [Strategy::CpuSimd, Strategy::GpuGeneral, Strategy::Hybrid] {
            let (sum, _) = d.reduce(&a, ReduceOp::Sum, strategy).unwrap();
            assert_eq!(sum, 5050.0, "strategy {strategy:?}");
            let (max, _) = d.reduce(&a, ReduceOp::Max, strategy).unwrap();
            assert_eq!(max, 100.0, "strategy {strategy:?}");
        }
    }

    #[test]
    fn transpose_is_exact() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        let accel = ctx.default_accelerator().unwrap();
        let (rows, cols) = (12, 7);
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32).collect();
        for strategy in [Strategy::CpuSimd, Strategy::GpuGeneral, Strategy::Hybrid] {
            let a = upload(&ctx, &data);
            let out = accel
                .alloc::<f32>(Shape::d1(rows * cols), LayoutHint::GpuOptimized)
                .unwrap();
            d.transpose(&a, &out, rows, cols, strategy).unwrap();
            let mut t = vec![0f32; rows * cols];
            out.copy_to_host(&mut t).unwrap();
            for i in 0..rows {
                for j in 0..cols {
                    assert_eq!(t[j * rows + i], data[i * cols + j], "{strategy:?}");
                }
            }
        }
    }

    #[test]
    fn forced_tensor_core_without_hardware_is_unsupported() {
        let ctx = Context::new().unwrap();
        let d = dispatcher(&ctx);
        let a = upload(&ctx, &[1.0; 256]);
        let b = upload(&ctx, &[1.0; 256]);
        let accel = ctx.default_accelerator().unwrap();
        let out = accel
            .alloc::<f32>(Shape::d1(256), LayoutHint::GpuOptimized)
            .unwrap();
        let err = d
            .matmul(&a, &b, &out, 16, 16, 16, Strategy::GpuTensorCore)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
