//! Ordered command streams, events, and async handles.
//!
//! A stream is a FIFO queue backed by a dedicated worker thread that
//! drives the backend's command queue. Commands run in program order;
//! `synchronize` inserts a fence and reports (then clears) the first
//! error any prior command produced. Events are one-shot cross-stream
//! join points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::backend::{DeviceBackend, QueueHandle};
use crate::device::DeviceId;
use crate::error::{ErrorKind, GpuError, GpuResult};

/// Cloneable cancellation signal for async entry points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Future-like completion handle.
///
/// Completion is signalled from the stream worker; callers either block
/// on `wait`, poll with `try_wait`, or bound the wait with
/// `wait_timeout` (which returns a retryable `Timeout` on elapse and
/// leaves the handle usable).
pub struct AsyncHandle<T> {
    rx: Receiver<GpuResult<T>>,
}

impl<T> std::fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle").finish()
    }
}

impl<T> AsyncHandle<T> {
    pub(crate) fn new(rx: Receiver<GpuResult<T>>) -> Self {
        Self { rx }
    }

    pub fn wait(self) -> GpuResult<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(GpuError::invariant("stream worker went away mid-operation")))
    }

    /// Nonblocking poll; `None` while still pending.
    pub fn try_wait(&self) -> Option<GpuResult<T>> {
        self.rx.try_recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> GpuResult<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                Err(GpuError::timeout("async wait", timeout.as_millis()))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(GpuError::invariant("stream worker went away mid-operation"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Pending,
    Signaled,
}

struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
    claimed: AtomicBool,
}

/// One-shot cross-stream synchronization point.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::Pending),
                cv: Condvar::new(),
                claimed: AtomicBool::new(false),
            }),
        }
    }

    fn signal(&self) {
        *self.inner.state.lock().unwrap() = EventState::Signaled;
        self.inner.cv.notify_all();
    }

    fn block_until_signaled(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while *state == EventState::Pending {
            state = self.inner.cv.wait(state).unwrap();
        }
    }

    /// Events are one-shot: only one waiter may consume them.
    fn claim(&self) -> GpuResult<()> {
        if self.inner.claimed.swap(true, Ordering::SeqCst) {
            return Err(GpuError::invalid_argument(
                "event has already been waited on; events are one-shot",
            ));
        }
        Ok(())
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.state.lock().unwrap() == EventState::Signaled
    }

    /// Host-side wait, outside any stream.
    pub fn wait_blocking(&self) -> GpuResult<()> {
        self.claim()?;
        self.block_until_signaled();
        Ok(())
    }
}

type CmdFn = Box<dyn FnOnce(&dyn DeviceBackend, &QueueHandle) -> GpuResult<()> + Send>;

enum Msg {
    Cmd { name: &'static str, f: CmdFn },
    Fence { tx: Sender<GpuResult<()>> },
}

pub(crate) struct StreamShared {
    pub id: u64,
    device: DeviceId,
    tx: Mutex<Option<Sender<Msg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

/// An ordered command queue on one accelerator.
///
/// Enqueue is expected to be single-writer (callers serialize); the
/// stream itself is not re-entrant.
#[derive(Clone)]
pub struct Stream {
    pub(crate) shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn spawn(backend: Arc<dyn DeviceBackend>, device: DeviceId) -> GpuResult<Self> {
        let queue = backend.create_queue()?;
        let (tx, rx) = unbounded::<Msg>();
        let id = crate::backend::next_resource_id();
        let worker = std::thread::Builder::new()
            .name(format!("accel-stream-{id}"))
            .spawn(move || worker_loop(backend, queue, rx))
            .map_err(|e| {
                GpuError::new(ErrorKind::DriverError { transient: false }, e.to_string())
            })?;
        Ok(Self {
            shared: Arc::new(StreamShared {
                id,
                device,
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn device(&self) -> DeviceId {
        self.shared.device
    }

    fn sender(&self) -> GpuResult<Sender<Msg>> {
        self.shared
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GpuError::invalid_argument("stream has been shut down"))
    }

    /// Enqueue one command. Nonblocking; fails with `Cancelled` once the
    /// stream has been cancelled.
    pub(crate) fn enqueue(
        &self,
        name: &'static str,
        f: impl FnOnce(&dyn DeviceBackend, &QueueHandle) -> GpuResult<()> + Send + 'static,
    ) -> GpuResult<()> {
        if self.is_cancelled() {
            return Err(GpuError::cancelled(name).with_device(self.shared.device));
        }
        self.sender()?
            .send(Msg::Cmd {
                name,
                f: Box::new(f),
            })
            .map_err(|_| GpuError::invalid_argument("stream has been shut down"))
    }

    /// Enqueue a command whose result is delivered through a handle.
    pub(crate) fn enqueue_async<T: Send + 'static>(
        &self,
        name: &'static str,
        f: impl FnOnce(&dyn DeviceBackend, &QueueHandle) -> GpuResult<T> + Send + 'static,
    ) -> GpuResult<AsyncHandle<T>> {
        let (tx, rx) = bounded::<GpuResult<T>>(1);
        self.enqueue(name, move |backend, queue| {
            let result = f(backend, queue);
            let failed = result.is_err();
            let err_clone = result.as_ref().err().cloned();
            let _ = tx.send(result);
            if failed {
                // Also surface through the stream's error state.
                return Err(err_clone.unwrap());
            }
            Ok(())
        })?;
        Ok(AsyncHandle::new(rx))
    }

    fn fence(&self) -> GpuResult<Receiver<GpuResult<()>>> {
        let (tx, rx) = bounded::<GpuResult<()>>(1);
        self.sender()?
            .send(Msg::Fence { tx })
            .map_err(|_| GpuError::invalid_argument("stream has been shut down"))?;
        Ok(rx)
    }

    /// Block until all previously enqueued commands finish. Returns the
    /// first error encountered since the last synchronize, clearing it.
    pub fn synchronize(&self) -> GpuResult<()> {
        let rx = self.fence()?;
        let result = rx
            .recv()
            .unwrap_or_else(|_| Err(GpuError::invariant("stream worker went away mid-fence")));
        if self.is_cancelled() {
            return Err(GpuError::cancelled("synchronize").with_device(self.shared.device));
        }
        result
    }

    /// Bounded synchronize; `Timeout` on elapse, with no state damage.
    /// A later synchronize still drains normally.
    pub fn synchronize_timeout(&self, timeout: Duration) -> GpuResult<()> {
        let start = Instant::now();
        let rx = self.fence()?;
        match rx.recv_timeout(timeout) {
            Ok(result) => {
                if self.is_cancelled() {
                    return Err(GpuError::cancelled("synchronize").with_device(self.shared.device));
                }
                result
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(GpuError::timeout(
                "stream synchronize",
                start.elapsed().as_millis(),
            )
            .with_device(self.shared.device)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(GpuError::invariant("stream worker went away mid-fence"))
            }
        }
    }

    /// Fence whose completion is observed through a handle.
    pub fn synchronize_async(&self) -> GpuResult<AsyncHandle<()>> {
        Ok(AsyncHandle::new(self.fence()?))
    }

    /// Record a one-shot event that signals once all currently enqueued
    /// commands have completed on the device.
    pub fn record_event(&self) -> GpuResult<Event> {
        let event = Event::new();
        let signal = event.clone();
        self.enqueue("record_event", move |backend, queue| {
            backend.queue_sync(queue)?;
            signal.signal();
            Ok(())
        })?;
        Ok(event)
    }

    /// Make this stream wait for `event` before running later commands.
    pub fn wait_for_event(&self, event: &Event) -> GpuResult<()> {
        event.claim()?;
        let event = event.clone();
        self.enqueue("wait_for_event", move |_backend, _queue| {
            event.block_until_signaled();
            Ok(())
        })
    }

    /// Signal cancellation. In-flight driver commands run to completion;
    /// the next enqueue or synchronize returns `Cancelled`.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Stop admission and drain with a bound. On timeout the worker is
    /// abandoned (commands already submitted still run) and the caller
    /// decides how loudly to complain.
    pub(crate) fn shutdown(&self, timeout: Duration) -> GpuResult<()> {
        let rx = match self.fence() {
            Ok(rx) => rx,
            // Already shut down.
            Err(_) => return Ok(()),
        };
        *self.shared.tx.lock().unwrap() = None;
        match rx.recv_timeout(timeout) {
            Ok(_) => {
                if let Some(worker) = self.shared.worker.lock().unwrap().take() {
                    let _ = worker.join();
                }
                Ok(())
            }
            Err(_) => Err(GpuError::timeout("stream drain", timeout.as_millis())
                .with_device(self.shared.device)),
        }
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        // Disposing a stream implies flush + sync: closing the channel
        // lets the worker drain everything already enqueued, and the
        // join waits for it.
        *self.tx.lock().unwrap() = None;
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(backend: Arc<dyn DeviceBackend>, queue: QueueHandle, rx: Receiver<Msg>) {
    let mut first_error: Option<GpuError> = None;
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Cmd { name, f } => {
                if let Err(e) = f(&*backend, &queue) {
                    log::debug!("stream command {name} failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e.with_context("operation", name));
                    }
                }
            }
            Msg::Fence { tx } => {
                let sync_err = backend.queue_sync(&queue).err();
                let err = first_error.take().or(sync_err);
                let _ = tx.send(match err {
                    Some(e) => Err(e),
                    None => Ok(()),
                });
            }
        }
    }
    backend.destroy_queue(&queue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::backend::DeviceBackend as _;
    use crate::config::RuntimeConfig;

    fn stream() -> Stream {
        let backend = CpuBackend::new(&RuntimeConfig::default());
        let device = backend.device_id();
        Stream::spawn(backend, device).unwrap()
    }

    #[test]
    fn commands_run_in_program_order() {
        let s = stream();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            s.enqueue("push", move |_, _| {
                log.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        s.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_reports_then_clears_first_error() {
        let s = stream();
        s.enqueue("boom", |_, _| Err(GpuError::invalid_argument("first")))
            .unwrap();
        s.enqueue("boom2", |_, _| Err(GpuError::invalid_argument("second")))
            .unwrap();
        let err = s.synchronize().unwrap_err();
        assert!(err.message().contains("first"));
        // Cleared: a later synchronize is clean.
        s.synchronize().unwrap();
    }

    #[test]
    fn cancelled_stream_rejects_enqueue_and_sync() {
        let s = stream();
        s.cancel();
        let err = s.enqueue("nop", |_, _| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let err = s.synchronize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn events_join_streams_and_are_one_shot() {
        let a = stream();
        let b = stream();
        let witness = Arc::new(AtomicBool::new(false));

        let w = Arc::clone(&witness);
        a.enqueue("slow", move |_, _| {
            std::thread::sleep(Duration::from_millis(20));
            w.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        let event = a.record_event().unwrap();
        b.wait_for_event(&event).unwrap();

        let w = Arc::clone(&witness);
        let saw = Arc::new(AtomicBool::new(false));
        let saw2 = Arc::clone(&saw);
        b.enqueue("check", move |_, _| {
            saw2.store(w.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        b.synchronize().unwrap();
        assert!(saw.load(Ordering::SeqCst), "join must order after producer");

        // One-shot: a second waiter is rejected.
        assert!(b.wait_for_event(&event).is_err());
    }

    #[test]
    fn async_handle_polls_and_waits() {
        let s = stream();
        let handle = s
            .enqueue_async("value", |_, _| {
                std::thread::sleep(Duration::from_millis(10));
                Ok(41)
            })
            .unwrap();
        assert_eq!(handle.wait().unwrap(), 41);

        let handle = s.synchronize_async().unwrap();
        handle.wait().unwrap();
    }

    #[test]
    fn wait_timeout_is_retryable() {
        let s = stream();
        let handle = s
            .enqueue_async("slow", |_, _| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            })
            .unwrap();
        let err = handle.wait_timeout(Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // Handle still usable afterwards.
        handle.wait_timeout(Duration::from_secs(5)).unwrap();
    }
}
