use tokio::sync::mpsc;

use crate::errors::{GearworkError, Result};

/// A progress update as `(numerator, denominator)`.
pub type ProgressUpdate = (u64, u64);

/// Per-job progress sink handed to the running function.
///
/// Worker-backed sinks forward reports to the queue's per-job status
/// channel (`WORK_STATUS`); jobs executed locally get a no-op sink.
/// Monotonicity of the numerator is the caller's responsibility.
#[derive(Clone)]
pub struct ProgressSink {
    sender: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressSink {
    /// Sink for local execution: reports validate and then vanish.
    pub fn noop() -> Self {
        ProgressSink { sender: None }
    }

    /// Sink wired to a worker connection. The receiver side is drained by
    /// the worker loop and written out as `WORK_STATUS` packets.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            ProgressSink {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Report progress. Fails when `denominator` is zero; `numerator`
    /// within `0..=denominator` is recommended but not enforced.
    pub fn report(&self, numerator: u64, denominator: u64) -> Result<()> {
        if denominator == 0 {
            return Err(GearworkError::InvalidProgress);
        }

        if let Some(sender) = &self.sender {
            // The worker may already have stopped draining; a job's
            // progress must not fail because of that.
            let _ = sender.send((numerator, denominator));
        }

        Ok(())
    }
}
