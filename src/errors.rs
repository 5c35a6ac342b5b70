use thiserror::Error;

/// Errors that can occur during gearwork operations.
///
/// Each variant corresponds to one failure kind of the library: codec
/// failures are never retried, queue failures are fatal to the worker that
/// observes them, job failures are consumed by the retry loop, and notifier
/// failures are appended to the surfaced job error without replacing it.
#[derive(Error, Debug)]
pub enum GearworkError {
    /// A payload could not be encoded or decoded, or round-trip
    /// verification diverged
    #[error("codec error: {0}")]
    Codec(String),

    /// A queue handle did not match `H:<token>:<digits>` (optionally
    /// prefixed by `<server>//`)
    #[error("malformed job handle '{0}'")]
    HandleFormat(String),

    /// The queue backend returned a non-success reply or the connection
    /// broke mid-protocol
    #[error("queue error: {0}")]
    Queue(String),

    /// A job's terminal failure, surfaced after the retry budget is spent.
    /// `handle` is set when the job went through the queue so the caller
    /// can locate its log.
    #[error("job failed: {message}")]
    JobFailure {
        message: String,
        handle: Option<String>,
    },

    /// A single job attempt exceeded the function's timeout budget
    #[error("job attempt timed out after {0}s")]
    JobTimeout(u64),

    /// The worker pool was asked to spawn more workers than its cap allows
    #[error("worker pool capacity exceeded: requested {requested} workers, cap is {cap}")]
    PoolCapacityExceeded { requested: usize, cap: usize },

    /// No configured gearman server accepted the worker's registration
    #[error("no gearman server accepted registration: {0}")]
    BackendRegistration(String),

    /// The failure notification could not be delivered
    #[error("notifier error: {0}")]
    Notifier(String),

    /// A progress report carried a non-positive denominator
    #[error("invalid progress report: denominator must be greater than zero")]
    InvalidProgress,

    /// An underlying I/O failure (socket, log file)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GearworkError {
    /// Shorthand for a job failure without an associated queue handle.
    pub fn job_failure(message: impl Into<String>) -> Self {
        GearworkError::JobFailure {
            message: message.into(),
            handle: None,
        }
    }
}

/// A Result type alias for GearworkError.
pub type Result<T> = core::result::Result<T, GearworkError>;
