//! Error logging and local recovery.
//!
//! The dispatcher here is the single place that observes retryable errors
//! and possibly consumes them before re-surfacing: OutOfMemory gets one
//! pool trim and one retry, Timeout gets bounded backoff retries, and
//! driver errors tagged transient get the same. Everything else passes
//! through unchanged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::device::DeviceId;
use crate::error::{ErrorKind, GpuError, GpuResult, Severity};

/// One logged failure.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error: GpuError,
    pub operation: String,
    pub severity: Severity,
    pub device: Option<DeviceId>,
    pub attempt: u32,
}

/// Pluggable structured error sink.
pub trait ErrorLogger: Send + Sync {
    fn log(&self, record: &ErrorRecord);
}

/// Default logger: routes records through the `log` facade at the
/// severity-mapped level.
#[derive(Debug, Default)]
pub struct FacadeLogger;

impl ErrorLogger for FacadeLogger {
    fn log(&self, record: &ErrorRecord) {
        let level = match record.severity {
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error => log::Level::Error,
            Severity::Critical => log::Level::Error,
        };
        log::log!(
            level,
            "{}{} attempt {}: {}",
            if record.severity == Severity::Critical {
                "CRITICAL "
            } else {
                ""
            },
            record.operation,
            record.attempt,
            record.error
        );
    }
}

/// Collecting sink, mainly for tests and embedders that forward errors
/// to their own telemetry.
#[derive(Debug, Default)]
pub struct CollectingLogger {
    records: Mutex<Vec<ErrorRecord>>,
}

impl CollectingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorLogger for CollectingLogger {
    fn log(&self, record: &ErrorRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

/// Retry dispatcher wrapping fallible runtime operations.
#[derive(Clone)]
pub struct RecoveryDispatcher {
    logger: Arc<dyn ErrorLogger>,
    max_retries: u32,
    backoff: Duration,
}

impl RecoveryDispatcher {
    pub fn new(logger: Arc<dyn ErrorLogger>, max_retries: u32) -> Self {
        Self {
            logger,
            max_retries,
            backoff: Duration::from_millis(10),
        }
    }

    pub fn logger(&self) -> &Arc<dyn ErrorLogger> {
        &self.logger
    }

    /// Log an error without retry handling.
    pub fn report(&self, operation: &str, device: Option<DeviceId>, error: &GpuError) {
        self.logger.log(&ErrorRecord {
            error: error.clone(),
            operation: operation.to_string(),
            severity: error.severity(),
            device,
            attempt: 1,
        });
    }

    /// Run `f`, applying the local recovery policy.
    ///
    /// `trim` is invoked once before the single OutOfMemory retry; pass
    /// `None` when no pool is attached.
    pub fn run<T>(
        &self,
        operation: &str,
        device: Option<DeviceId>,
        trim: Option<&dyn Fn()>,
        mut f: impl FnMut() -> GpuResult<T>,
    ) -> GpuResult<T> {
        let mut attempt: u32 = 0;
        let mut oom_retried = false;
        let mut transient_retries: u32 = 0;
        loop {
            attempt += 1;
            let err = match f() {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            self.logger.log(&ErrorRecord {
                error: err.clone(),
                operation: operation.to_string(),
                severity: err.severity(),
                device,
                attempt,
            });
            match err.kind() {
                ErrorKind::OutOfMemory if !oom_retried => {
                    let Some(trim) = trim else { return Err(err) };
                    trim();
                    oom_retried = true;
                }
                ErrorKind::Timeout | ErrorKind::DriverError { transient: true }
                    if transient_retries < self.max_retries =>
                {
                    transient_retries += 1;
                    std::thread::sleep(self.backoff * transient_retries);
                }
                _ => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dispatcher(logger: Arc<CollectingLogger>) -> RecoveryDispatcher {
        RecoveryDispatcher::new(logger, 3)
    }

    #[test]
    fn oom_trims_once_then_retries_once() {
        let logger = Arc::new(CollectingLogger::new());
        let trims = AtomicU32::new(0);
        let calls = AtomicU32::new(0);
        let result: GpuResult<()> = dispatcher(logger.clone()).run(
            "alloc",
            None,
            Some(&|| {
                trims.fetch_add(1, Ordering::SeqCst);
            }),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GpuError::out_of_memory(64, 0))
            },
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(trims.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(logger.len(), 2);
    }

    #[test]
    fn oom_recovers_after_trim() {
        let logger = Arc::new(CollectingLogger::new());
        let calls = AtomicU32::new(0);
        let result = dispatcher(logger).run("alloc", None, Some(&|| {}), || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GpuError::out_of_memory(64, 0))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn timeout_retries_up_to_limit() {
        let logger = Arc::new(CollectingLogger::new());
        let calls = AtomicU32::new(0);
        let result: GpuResult<()> = dispatcher(logger.clone()).run("sync", None, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GpuError::timeout("sync", 1))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fatal_errors_pass_through_unchanged() {
        let logger = Arc::new(CollectingLogger::new());
        let calls = AtomicU32::new(0);
        let result: GpuResult<()> = dispatcher(logger.clone()).run("op", None, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GpuError::invalid_argument("nope"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(logger.len(), 1);
    }
}
