//! Typed device memory buffers.
//!
//! A `MemoryBuffer<E>` is one device allocation with a rank-1/2/3 shape.
//! Ownership is single: the accelerator (or pool) hands a buffer out,
//! `dispose` (or drop) hands it back. A disposed buffer keeps rejecting
//! operations with `InvalidArgument` instead of touching freed memory.

mod unified;
mod view;

pub use unified::{MigrateTo, UnifiedBuffer};
pub use view::ArrayView;

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use crate::backend::{Allocation, DeviceBackend, QueueHandle};
use crate::device::DeviceId;
use crate::element::{as_bytes, as_bytes_mut, Element, ElemType};
use crate::error::{GpuError, GpuResult};
use crate::pool::PoolShared;
use crate::stream::{AsyncHandle, Stream};

/// Where an allocation physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Plain pageable host memory.
    Host,
    /// Device-resident memory.
    Device,
    /// Host+device coherent memory managed by the runtime.
    Unified,
    /// Page-locked host memory for fast DMA.
    Pinned,
}

/// Allocation placement hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutHint {
    /// Small buffers go host-side, large ones device-side, unified when
    /// the device supports it and the buffer is over a million elements.
    #[default]
    Auto,
    CpuOptimized,
    GpuOptimized,
    Unified,
    Pinned,
}

/// Rank-1/2/3 dense extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; 3],
    rank: usize,
}

impl Shape {
    pub fn d1(n: usize) -> Self {
        Self {
            dims: [n, 1, 1],
            rank: 1,
        }
    }

    pub fn d2(rows: usize, cols: usize) -> Self {
        Self {
            dims: [rows, cols, 1],
            rank: 2,
        }
    }

    pub fn d3(d0: usize, d1: usize, d2: usize) -> Self {
        Self {
            dims: [d0, d1, d2],
            rank: 3,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major contiguous strides, in elements.
    pub fn contiguous_strides(&self) -> [usize; 3] {
        let d = self.dims;
        match self.rank {
            1 => [1, 0, 0],
            2 => [d[1], 1, 0],
            _ => [d[1] * d[2], d[2], 1],
        }
    }
}

pub(crate) struct BufState {
    pub alloc: Option<Allocation>,
    pub disposed: bool,
    pub shape: Shape,
    /// Physical capacity; may exceed `shape.len()` for pooled buffers.
    pub capacity_elems: usize,
    /// Set when dispose should hand the allocation back to a pool.
    pub pool: Option<Weak<PoolShared>>,
}

pub(crate) struct BufferInner {
    pub id: u64,
    pub accel_id: u64,
    pub backend: Arc<dyn DeviceBackend>,
    pub sync_queue: Arc<QueueHandle>,
    pub device: DeviceId,
    pub elem: ElemType,
    pub location: Location,
    pub strides: [usize; 3],
    pub state: Mutex<BufState>,
}

impl BufferInner {
    /// Allocation handle if the buffer is still live.
    pub fn checked_alloc(&self) -> GpuResult<Allocation> {
        let st = self.state.lock().unwrap();
        if st.disposed {
            return Err(self.disposed_error());
        }
        st.alloc
            .clone()
            .ok_or_else(|| self.disposed_error())
    }

    pub fn disposed_error(&self) -> GpuError {
        GpuError::invalid_argument(format!("buffer {} has been disposed", self.id))
            .with_device(self.device)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().shape.len()
    }

    /// Free or pool-return the allocation; further operations fail.
    pub fn dispose_inner(&self) -> GpuResult<()> {
        let (alloc, pool, capacity) = {
            let mut st = self.state.lock().unwrap();
            if st.disposed {
                return Err(self.disposed_error());
            }
            st.disposed = true;
            (st.alloc.take(), st.pool.take(), st.capacity_elems)
        };
        if let Some(alloc) = alloc {
            match pool.as_ref().and_then(Weak::upgrade) {
                Some(pool) => pool.retain(self.elem, alloc, capacity),
                None => self.backend.free(&alloc),
            }
        }
        Ok(())
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        // Last-resort free for buffers dropped without dispose.
        let alloc = self.state.lock().unwrap().alloc.take();
        if let Some(alloc) = alloc {
            self.backend.free(&alloc);
        }
    }
}

/// A typed 1-D/2-D/3-D device allocation.
pub struct MemoryBuffer<E: Element> {
    pub(crate) inner: Arc<BufferInner>,
    pub(crate) _elem: PhantomData<E>,
}

impl<E: Element> MemoryBuffer<E> {
    pub(crate) fn from_inner(inner: Arc<BufferInner>) -> Self {
        Self {
            inner,
            _elem: PhantomData,
        }
    }

    /// Process-unique buffer identity. Stable across pool reuse of the
    /// same underlying allocation.
    pub fn id(&self) -> u64 {
        self.inner
            .state
            .lock()
            .unwrap()
            .alloc
            .as_ref()
            .map(|a| a.id)
            .unwrap_or(self.inner.id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> Shape {
        self.inner.state.lock().unwrap().shape
    }

    pub fn rank(&self) -> usize {
        self.shape().rank()
    }

    pub fn strides(&self) -> [usize; 3] {
        self.inner.strides
    }

    pub fn elem(&self) -> ElemType {
        self.inner.elem
    }

    pub fn location(&self) -> Location {
        self.inner.location
    }

    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().unwrap().disposed
    }

    fn byte_len(&self) -> usize {
        self.len() * E::ELEM.size_bytes()
    }

    /// Whether the element layout is dense row-major.
    pub fn is_contiguous(&self) -> bool {
        self.inner.strides == self.shape().contiguous_strides()
    }

    fn require_contiguous(&self, operation: &str) -> GpuResult<()> {
        if self.is_contiguous() {
            return Ok(());
        }
        Err(GpuError::invalid_argument(format!(
            "{operation} requires a dense buffer; this one is strided"
        )))
    }

    /// Upload from a host slice. With a stream the copy is asynchronous
    /// with respect to the caller and ordered on the stream; without one
    /// it completes before returning.
    pub fn copy_from_host(&self, src: &[E], stream: Option<&Stream>) -> GpuResult<()> {
        self.require_contiguous("copy_from_host")?;
        if src.len() != self.len() {
            return Err(GpuError::invalid_argument(format!(
                "source has {} elements, buffer has {}",
                src.len(),
                self.len()
            )));
        }
        let alloc = self.inner.checked_alloc()?;
        match stream {
            None => {
                self.inner
                    .backend
                    .copy_in(&alloc, 0, as_bytes(src), &self.inner.sync_queue)?;
                self.inner.backend.queue_sync(&self.inner.sync_queue)
            }
            Some(stream) => {
                let owned: Vec<E> = src.to_vec();
                let inner = Arc::clone(&self.inner);
                stream.enqueue("copy_from_host", move |backend, queue| {
                    let alloc = inner.checked_alloc()?;
                    backend.copy_in(&alloc, 0, as_bytes(&owned), queue)
                })
            }
        }
    }

    /// Download into a host slice, synchronously.
    pub fn copy_to_host(&self, dst: &mut [E]) -> GpuResult<()> {
        self.require_contiguous("copy_to_host")?;
        if dst.len() != self.len() {
            return Err(GpuError::invalid_argument(format!(
                "destination has {} elements, buffer has {}",
                dst.len(),
                self.len()
            )));
        }
        let alloc = self.inner.checked_alloc()?;
        self.inner
            .backend
            .copy_out(&alloc, 0, as_bytes_mut(dst), &self.inner.sync_queue)?;
        self.inner.backend.queue_sync(&self.inner.sync_queue)
    }

    /// Download asynchronously on `stream`; the handle resolves to the
    /// buffer contents once all prior stream commands have run.
    pub fn read_back(&self, stream: &Stream) -> GpuResult<AsyncHandle<Vec<E>>> {
        let len = self.len();
        let inner = Arc::clone(&self.inner);
        stream.enqueue_async("read_back", move |backend, queue| {
            let alloc = inner.checked_alloc()?;
            let mut out = vec![E::default(); len];
            backend.copy_out(&alloc, 0, as_bytes_mut(&mut out), queue)?;
            Ok(out)
        })
    }

    /// Zero the buffer contents.
    pub fn fill_zero(&self, stream: Option<&Stream>) -> GpuResult<()> {
        self.require_contiguous("fill_zero")?;
        let alloc = self.inner.checked_alloc()?;
        let bytes = self.byte_len();
        match stream {
            None => {
                self.inner
                    .backend
                    .fill_zero(&alloc, 0, bytes, &self.inner.sync_queue)?;
                self.inner.backend.queue_sync(&self.inner.sync_queue)
            }
            Some(stream) => {
                let inner = Arc::clone(&self.inner);
                stream.enqueue("fill_zero", move |backend, queue| {
                    let alloc = inner.checked_alloc()?;
                    backend.fill_zero(&alloc, 0, bytes, queue)
                })
            }
        }
    }

    /// Device-to-device copy into `dst`. Element types already match by
    /// construction; lengths must too.
    pub fn copy_to(&self, dst: &MemoryBuffer<E>, stream: Option<&Stream>) -> GpuResult<()> {
        self.require_contiguous("copy_to")?;
        dst.require_contiguous("copy_to")?;
        if dst.len() != self.len() {
            return Err(GpuError::invalid_argument(format!(
                "copy_to length mismatch: {} vs {}",
                self.len(),
                dst.len()
            )));
        }
        let src_alloc = self.inner.checked_alloc()?;
        let dst_alloc = dst.inner.checked_alloc()?;
        let bytes = self.byte_len();
        match stream {
            None => {
                self.inner.backend.copy_within(
                    &src_alloc,
                    0,
                    &dst_alloc,
                    0,
                    bytes,
                    &self.inner.sync_queue,
                )?;
                self.inner.backend.queue_sync(&self.inner.sync_queue)
            }
            Some(stream) => {
                let src = Arc::clone(&self.inner);
                let dstin = Arc::clone(&dst.inner);
                stream.enqueue("copy_to", move |backend, queue| {
                    let s = src.checked_alloc()?;
                    let d = dstin.checked_alloc()?;
                    backend.copy_within(&s, 0, &d, 0, bytes, queue)
                })
            }
        }
    }

    /// Borrow the buffer contents as a host slice. Only possible when
    /// the memory is host-visible (the simulator, pinned and unified
    /// allocations); discrete device memory requires an explicit copy.
    pub fn view(&self) -> GpuResult<ArrayView<'_, E>> {
        let alloc = self.inner.checked_alloc()?;
        let ptr = self.inner.backend.host_ptr(&alloc).ok_or_else(|| {
            GpuError::unsupported("buffer memory is not host-visible; use copy_to_host")
                .with_device(self.inner.device)
        })?;
        if self.is_contiguous() {
            let len = self.len();
            return Ok(ArrayView::new(unsafe {
                std::slice::from_raw_parts(ptr as *const E, len)
            }));
        }
        // Rank-1 strided buffers view their physical span with a step;
        // higher ranks have no flat representation.
        let state = self.inner.state.lock().unwrap();
        if state.shape.rank() != 1 {
            return Err(GpuError::unsupported(
                "strided views are only available for rank-1 buffers",
            ));
        }
        let physical = state.capacity_elems;
        drop(state);
        ArrayView::new(unsafe { std::slice::from_raw_parts(ptr as *const E, physical) })
            .with_stride(self.inner.strides[0])
    }

    /// Bounds-checked 1-D subview.
    pub fn subview(&self, offset: usize, extent: usize) -> GpuResult<ArrayView<'_, E>> {
        self.view()?.subview(offset, extent)
    }

    /// Zero-copy host access when the memory is mapped; `None` when the
    /// backend requires staging copies.
    pub(crate) fn host_slice(&self) -> GpuResult<Option<&[E]>> {
        let alloc = self.inner.checked_alloc()?;
        Ok(self.inner.backend.host_ptr(&alloc).map(|ptr| unsafe {
            std::slice::from_raw_parts(ptr as *const E, self.len())
        }))
    }

    /// Mutable zero-copy host access. Callers must not hold overlapping
    /// views while writing, mirroring device aliasing rules.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn host_slice_mut(&self) -> GpuResult<Option<&mut [E]>> {
        let alloc = self.inner.checked_alloc()?;
        Ok(self.inner.backend.host_ptr(&alloc).map(|ptr| unsafe {
            std::slice::from_raw_parts_mut(ptr as *mut E, self.len())
        }))
    }

    /// Synchronous partial upload starting at `offset_elems`.
    pub(crate) fn write_region(&self, offset_elems: usize, src: &[E]) -> GpuResult<()> {
        if offset_elems + src.len() > self.len() {
            return Err(GpuError::invalid_argument(format!(
                "region [{offset_elems}, {}) exceeds buffer of length {}",
                offset_elems + src.len(),
                self.len()
            )));
        }
        let alloc = self.inner.checked_alloc()?;
        self.inner.backend.copy_in(
            &alloc,
            offset_elems * E::ELEM.size_bytes(),
            as_bytes(src),
            &self.inner.sync_queue,
        )?;
        self.inner.backend.queue_sync(&self.inner.sync_queue)
    }

    /// Release the allocation. Pool-rented buffers return to their pool;
    /// direct allocations are freed. Every later operation (including a
    /// second dispose) fails with `InvalidArgument`.
    pub fn dispose(&mut self) -> GpuResult<()> {
        self.inner.dispose_inner()
    }
}

impl<E: Element> std::fmt::Debug for MemoryBuffer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("id", &self.inner.id)
            .field("elem", &self.inner.elem)
            .field("shape", &self.shape())
            .field("location", &self.inner.location)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_lengths() {
        assert_eq!(Shape::d1(7).len(), 7);
        assert_eq!(Shape::d2(3, 4).len(), 12);
        assert_eq!(Shape::d3(2, 3, 4).len(), 24);
        assert_eq!(Shape::d2(3, 4).contiguous_strides(), [4, 1, 0]);
        assert_eq!(Shape::d3(2, 3, 4).contiguous_strides(), [12, 4, 1]);
    }
}
