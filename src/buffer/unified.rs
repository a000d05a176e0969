//! Coherent dual-residency buffers.
//!
//! A `UnifiedBuffer` keeps a host copy and a device allocation logically
//! coherent through explicit migration. Per-side validity bits live under
//! a per-buffer lock: a mutation on one side clears the other side's bit,
//! `ensure_host`/`ensure_device` migrate and set both. At least one side
//! is valid at every instant.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::buffer::MemoryBuffer;
use crate::element::{as_bytes, as_bytes_mut, Element};
use crate::error::{GpuError, GpuResult};
use crate::kernel::LaunchArg;
use crate::stream::{AsyncHandle, Stream};

/// Migration direction for `migrate_async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateTo {
    Host,
    Device,
}

struct UnifiedState<E> {
    host: Vec<E>,
    host_valid: bool,
    device_valid: bool,
}

pub(crate) struct UnifiedInner<E: Element> {
    device: MemoryBuffer<E>,
    state: Mutex<UnifiedState<E>>,
}

/// Host+device coherent buffer with runtime-managed migration.
pub struct UnifiedBuffer<E: Element> {
    inner: Arc<UnifiedInner<E>>,
    _elem: PhantomData<E>,
}

impl<E: Element> UnifiedBuffer<E> {
    /// Wrap a freshly allocated, zero-filled device buffer. Both sides
    /// start valid (both are all-zero), so the coherence invariant holds
    /// before the first mutation.
    pub(crate) fn from_device_buffer(device: MemoryBuffer<E>) -> GpuResult<Self> {
        let len = device.len();
        device.fill_zero(None)?;
        Ok(Self {
            inner: Arc::new(UnifiedInner {
                device,
                state: Mutex::new(UnifiedState {
                    host: vec![E::default(); len],
                    host_valid: true,
                    device_valid: true,
                }),
            }),
            _elem: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn id(&self) -> u64 {
        self.inner.device.id()
    }

    pub fn host_valid(&self) -> bool {
        self.inner.state.lock().unwrap().host_valid
    }

    pub fn device_valid(&self) -> bool {
        self.inner.state.lock().unwrap().device_valid
    }

    /// Zero-copy host read. Requires the host side to be valid.
    pub fn read_host<R>(&self, f: impl FnOnce(&[E]) -> R) -> GpuResult<R> {
        let st = self.inner.state.lock().unwrap();
        if !st.host_valid {
            return Err(GpuError::invalid_argument(
                "host side is not valid; call ensure_host first",
            ));
        }
        Ok(f(&st.host))
    }

    /// Host mutation. Requires the host side to be valid; clears the
    /// device side's validity until the next migration.
    pub fn write_host<R>(&self, f: impl FnOnce(&mut [E]) -> R) -> GpuResult<R> {
        let mut st = self.inner.state.lock().unwrap();
        if !st.host_valid {
            return Err(GpuError::invalid_argument(
                "host side is not valid; call ensure_host first",
            ));
        }
        st.device_valid = false;
        Ok(f(&mut st.host))
    }

    /// Make the host side valid, migrating device → host if needed.
    /// After migration both sides are valid.
    pub fn ensure_host(&self) -> GpuResult<()> {
        let mut st = self.inner.state.lock().unwrap();
        if st.host_valid {
            return Ok(());
        }
        debug_assert!(st.device_valid);
        let inner = &self.inner.device.inner;
        let alloc = inner.checked_alloc()?;
        inner
            .backend
            .copy_out(&alloc, 0, as_bytes_mut(&mut st.host), &inner.sync_queue)?;
        inner.backend.queue_sync(&inner.sync_queue)?;
        st.host_valid = true;
        Ok(())
    }

    /// Make the device side valid, migrating host → device if needed.
    pub fn ensure_device(&self) -> GpuResult<()> {
        let mut st = self.inner.state.lock().unwrap();
        if st.device_valid {
            return Ok(());
        }
        debug_assert!(st.host_valid);
        let inner = &self.inner.device.inner;
        let alloc = inner.checked_alloc()?;
        inner
            .backend
            .copy_in(&alloc, 0, as_bytes(&st.host), &inner.sync_queue)?;
        inner.backend.queue_sync(&inner.sync_queue)?;
        st.device_valid = true;
        Ok(())
    }

    /// Migration enqueued on `stream`: establishes a host/device
    /// happens-before edge with the stream's other commands. The handle
    /// resolves once the validity bits have flipped.
    pub fn migrate_async(
        &self,
        to: MigrateTo,
        stream: &Stream,
    ) -> GpuResult<AsyncHandle<()>> {
        let inner = Arc::clone(&self.inner);
        stream.enqueue_async("unified_migrate", move |backend, queue| {
            let mut st = inner.state.lock().unwrap();
            let alloc = inner.device.inner.checked_alloc()?;
            match to {
                MigrateTo::Host => {
                    if !st.host_valid {
                        backend.copy_out(&alloc, 0, as_bytes_mut(&mut st.host), queue)?;
                        backend.queue_sync(queue)?;
                        st.host_valid = true;
                    }
                }
                MigrateTo::Device => {
                    if !st.device_valid {
                        backend.copy_in(&alloc, 0, as_bytes(&st.host), queue)?;
                        backend.queue_sync(queue)?;
                        st.device_valid = true;
                    }
                }
            }
            Ok(())
        })
    }

    /// Launch argument reading the device side. Requires device validity.
    pub fn device_arg(&self) -> GpuResult<LaunchArg> {
        let st = self.inner.state.lock().unwrap();
        if !st.device_valid {
            return Err(GpuError::invalid_argument(
                "device side is not valid; call ensure_device first",
            ));
        }
        drop(st);
        self.inner.device.arg()
    }

    /// Launch argument mutating the device side: the host bit is cleared
    /// until the next `ensure_host`.
    pub fn device_arg_mut(&self) -> GpuResult<LaunchArg> {
        let mut st = self.inner.state.lock().unwrap();
        if !st.device_valid {
            return Err(GpuError::invalid_argument(
                "device side is not valid; call ensure_device first",
            ));
        }
        st.host_valid = false;
        drop(st);
        self.inner.device.arg()
    }

    /// Release both residencies.
    pub fn dispose(&mut self) -> GpuResult<()> {
        let mut st = self.inner.state.lock().unwrap();
        st.host = Vec::new();
        st.host_valid = false;
        st.device_valid = true; // the coherence invariant outlives content
        drop(st);
        self.inner.device.inner.dispose_inner()
    }
}

impl<E: Element> std::fmt::Debug for UnifiedBuffer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("UnifiedBuffer")
            .field("len", &self.inner.device.len())
            .field("host_valid", &st.host_valid)
            .field("device_valid", &st.device_valid)
            .finish()
    }
}
