//! Runtime error taxonomy.
//!
//! Driver status codes are translated at the FFI boundary into a `GpuError`
//! carrying the typed kind, the originating device, the kernel name when
//! one is in play, and a free-form context map. The recovery dispatcher
//! (`crate::recovery`) is the only place that consumes retryable errors
//! before they surface.

use std::collections::BTreeMap;
use std::fmt;

use crate::device::DeviceId;

/// Closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error: bad shape, disposed buffer, alien pool return. Fatal.
    InvalidArgument,
    /// Launch argument arity/kind/type mismatch. Fatal.
    InvalidKernelParameters,
    /// Allocation failed. Retryable after a pool trim.
    OutOfMemory,
    /// Device missing or not initialized; may become available later.
    DeviceUnavailable,
    /// Translated driver status. Fatal unless the driver classified it
    /// as transient.
    DriverError { transient: bool },
    /// Backend compiler rejected the kernel. Fatal for that version.
    KernelCompilationFailed,
    /// Submission or execution failure. Potentially retryable.
    LaunchFailed,
    /// A bounded wait elapsed. Retryable.
    Timeout,
    /// The operation observed a cancellation request. Terminal for it.
    Cancelled,
    /// Configuration asked for something this device cannot do.
    Unsupported,
    /// A runtime invariant broke. Always logged at Critical.
    InternalInvariantViolated,
}

impl ErrorKind {
    /// Whether the recovery dispatcher may retry this kind at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory
                | Self::Timeout
                | Self::LaunchFailed
                | Self::DriverError { transient: true }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidKernelParameters => "InvalidKernelParameters",
            Self::OutOfMemory => "OutOfMemory",
            Self::DeviceUnavailable => "DeviceUnavailable",
            Self::DriverError { .. } => "DriverError",
            Self::KernelCompilationFailed => "KernelCompilationFailed",
            Self::LaunchFailed => "LaunchFailed",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Unsupported => "Unsupported",
            Self::InternalInvariantViolated => "InternalInvariantViolated",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log severity for an error, per the fixed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Structured runtime error.
#[derive(Debug, Clone)]
pub struct GpuError {
    kind: ErrorKind,
    message: String,
    device: Option<DeviceId>,
    kernel: Option<String>,
    /// Thread/block indices, when the driver supplies them.
    thread_idx: Option<[u32; 3]>,
    block_idx: Option<[u32; 3]>,
    context: BTreeMap<String, String>,
    suggestions: Vec<String>,
}

impl GpuError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            device: None,
            kernel: None,
            thread_idx: None,
            block_idx: None,
            context: BTreeMap::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn out_of_memory(requested: usize, available: u64) -> Self {
        Self::new(
            ErrorKind::OutOfMemory,
            format!("requested {requested} bytes, {available} available"),
        )
        .with_suggestion("Reduce working set or call pool.trim()")
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("{operation} was cancelled"))
    }

    pub fn timeout(operation: &str, elapsed_ms: u128) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{operation} timed out after {elapsed_ms} ms"),
        )
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInvariantViolated, message)
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = Some(kernel.into());
        self
    }

    pub fn with_indices(mut self, block: [u32; 3], thread: [u32; 3]) -> Self {
        self.block_idx = Some(block);
        self.thread_idx = Some(thread);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn kernel(&self) -> Option<&str> {
        self.kernel.as_deref()
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Severity mapping: InternalInvariantViolated=Critical;
    /// KernelCompilationFailed and non-transient DriverError=Error;
    /// OutOfMemory and Timeout=Warning; Cancelled=Info.
    pub fn severity(&self) -> Severity {
        match self.kind {
            ErrorKind::InternalInvariantViolated => Severity::Critical,
            ErrorKind::KernelCompilationFailed
            | ErrorKind::DriverError { transient: false } => Severity::Error,
            ErrorKind::OutOfMemory | ErrorKind::Timeout => Severity::Warning,
            ErrorKind::Cancelled => Severity::Info,
            ErrorKind::DriverError { transient: true } => Severity::Warning,
            ErrorKind::InvalidArgument
            | ErrorKind::InvalidKernelParameters
            | ErrorKind::Unsupported
            | ErrorKind::DeviceUnavailable
            | ErrorKind::LaunchFailed => Severity::Error,
        }
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(device) = self.device {
            write!(f, " [device {device}]")?;
        }
        if let Some(kernel) = &self.kernel {
            write!(f, " [kernel {kernel}]")?;
        }
        if let (Some(b), Some(t)) = (self.block_idx, self.thread_idx) {
            write!(
                f,
                " [block ({},{},{}) thread ({},{},{})]",
                b[0], b[1], b[2], t[0], t[1], t[2]
            )?;
        }
        for (k, v) in &self.context {
            write!(f, " {k}={v}")?;
        }
        for s in &self.suggestions {
            write!(f, "; hint: {s}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GpuError {}

pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(
            GpuError::invariant("x").severity(),
            Severity::Critical
        );
        assert_eq!(
            GpuError::new(ErrorKind::KernelCompilationFailed, "x").severity(),
            Severity::Error
        );
        assert_eq!(GpuError::out_of_memory(1, 0).severity(), Severity::Warning);
        assert_eq!(GpuError::timeout("sync", 5).severity(), Severity::Warning);
        assert_eq!(GpuError::cancelled("launch").severity(), Severity::Info);
        assert_eq!(
            GpuError::new(ErrorKind::DriverError { transient: false }, "x").severity(),
            Severity::Error
        );
    }

    #[test]
    fn retryability() {
        assert!(GpuError::out_of_memory(1, 0).is_retryable());
        assert!(GpuError::timeout("sync", 1).is_retryable());
        assert!(GpuError::new(ErrorKind::DriverError { transient: true }, "x").is_retryable());
        assert!(!GpuError::new(ErrorKind::DriverError { transient: false }, "x").is_retryable());
        assert!(!GpuError::invalid_argument("x").is_retryable());
        assert!(!GpuError::cancelled("op").is_retryable());
    }

    #[test]
    fn display_carries_context() {
        let e = GpuError::new(ErrorKind::LaunchFailed, "bad launch")
            .with_device(DeviceId::cuda(0))
            .with_kernel("saxpy")
            .with_context("grid", "128");
        let s = e.to_string();
        assert!(s.contains("LaunchFailed"));
        assert!(s.contains("CUDA:0"));
        assert!(s.contains("saxpy"));
        assert!(s.contains("grid=128"));
    }
}
