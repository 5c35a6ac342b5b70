use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::codec::Arguments;
use crate::config::Config;
use crate::errors::{GearworkError, Result};
use crate::function::{FunctionDescriptor, JobContext};
use crate::job_log::JobLog;
use crate::notifier::Notifier;
use crate::progress::ProgressSink;

/// Trailing log lines included in failure notification bodies.
const NOTIFICATION_TAIL_LINES: usize = 50;

/// Drives a single job's attempt loop end-to-end: log setup, retries,
/// timeout enforcement, progress forwarding, and failure notification.
///
/// Every attempt runs a fresh function instance, so retries are oblivious
/// to prior attempt state; all attempts of one job append to the same log.
pub struct JobRunner {
    config: Arc<Config>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl JobRunner {
    pub fn new(config: Arc<Config>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        JobRunner { config, notifier }
    }

    /// Execute one job to a terminal outcome.
    ///
    /// Returns the function's (unwrapped) result value, or the terminal
    /// failure after the retry budget is spent. A notifier error is
    /// appended to the surfaced message, never substituted for it.
    pub async fn run_job(
        &self,
        descriptor: &FunctionDescriptor,
        gjs_id: &str,
        args: Option<Arguments>,
        progress: ProgressSink,
    ) -> Result<Value> {
        let log = JobLog::open(&self.config.worker_log_dir, descriptor.name(), gjs_id)?;
        let retries = *descriptor.retries();
        let timeout = *descriptor.timeout();

        let mut terminal_failure = String::new();
        for attempt in 0..=retries {
            let ctx = JobContext::new(
                gjs_id.to_string(),
                args.clone(),
                progress.clone(),
                log.clone(),
            );

            // The attempt owns its context; the progress sink reference is
            // released when the attempt finishes.
            match self.run_attempt(descriptor, ctx, timeout).await {
                Ok(value) => {
                    log.line("Finished job")?;
                    info!(
                        function = descriptor.name().as_str(),
                        gjs_id, attempt, "Finished job"
                    );
                    return Ok(value);
                }
                Err(failure) => {
                    log.line(&format!("Job attempt {attempt} failed: {failure}"))?;
                    if attempt < retries {
                        warn!(
                            function = descriptor.name().as_str(),
                            gjs_id,
                            attempt,
                            error = %failure,
                            "Job attempt failed"
                        );
                        log.line(&format!("Retrying ({})", attempt + 1))?;
                    } else {
                        error!(
                            function = descriptor.name().as_str(),
                            gjs_id,
                            attempt,
                            error = %failure,
                            "Job failed terminally"
                        );
                        terminal_failure = failure;
                    }
                }
            }
        }

        let mut message = format!(
            "function \"{}\" failed after {} attempts: {terminal_failure}",
            descriptor.name(),
            retries + 1
        );

        if *descriptor.notify_on_failure() {
            if let Err(notify_err) = self
                .send_failure_notification(descriptor, &log, &terminal_failure)
                .await
            {
                error!(
                    function = descriptor.name().as_str(),
                    gjs_id,
                    error = %notify_err,
                    "Failure notification could not be delivered"
                );
                message = format!("{message} (notification failed: {notify_err})");
            }
        }

        Err(GearworkError::job_failure(message))
    }

    /// Run one attempt on its own task so a user-code panic is confined to
    /// the attempt, applying the function's timeout when one is declared.
    async fn run_attempt(
        &self,
        descriptor: &FunctionDescriptor,
        ctx: JobContext,
        timeout: Duration,
    ) -> core::result::Result<Value, String> {
        let mut task = tokio::spawn(descriptor.run_attempt(ctx));

        let joined = if timeout > Duration::ZERO {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(GearworkError::JobTimeout(timeout.as_secs()).to_string());
                }
            }
        } else {
            (&mut task).await
        };

        match joined {
            Ok(result) => result,
            Err(join_err) => Err(format!("job attempt panicked: {join_err}")),
        }
    }

    async fn send_failure_notification(
        &self,
        descriptor: &FunctionDescriptor,
        log: &JobLog,
        failure: &str,
    ) -> Result<()> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };

        let subject = format!("Function \"{}\" failed", descriptor.name());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let tail = log.tail(NOTIFICATION_TAIL_LINES).unwrap_or_default();

        let body = format!(
            "Function: {}\n\
             Host: {host}\n\
             Time: {}\n\
             Failure: {failure}\n\
             Log file: {}\n\
             \n\
             Last {NOTIFICATION_TAIL_LINES} log lines:\n\
             {}\n",
            descriptor.name(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            log.path().display(),
            tail.join("\n"),
        );

        notifier.notify(&subject, &body).await
    }
}
