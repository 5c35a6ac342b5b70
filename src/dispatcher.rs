use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::client::QueueClient;
use crate::codec::{self, Arguments};
use crate::config::Config;
use crate::errors::Result;
use crate::function::FunctionDescriptor;
use crate::identity::{canonical_job_key, gjs_job_id, random_prefix};
use crate::notifier::{notifier_from_config, Notifier};
use crate::progress::ProgressSink;
use crate::runner::JobRunner;

/// The three client modes over a function descriptor.
///
/// The dispatcher holds no cross-call state: each call marshals its own
/// arguments, derives its own identity, and talks to the queue (or the
/// local runner) independently.
pub struct Dispatcher {
    config: Arc<Config>,
    client: QueueClient,
    runner: JobRunner,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let notifier = notifier_from_config(&config);
        Self::with_notifier(config, notifier)
    }

    /// Build a dispatcher with an explicit notifier (or none), for callers
    /// and tests that substitute their own sink.
    pub fn with_notifier(config: Config, notifier: Option<Arc<dyn Notifier>>) -> Self {
        let config = Arc::new(config);
        Dispatcher {
            client: QueueClient::from_config(&config),
            runner: JobRunner::new(config.clone(), notifier),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    /// Execute the function in-process, skipping the queue entirely.
    ///
    /// The job still gets the full lifecycle: a GJS ID with a fresh random
    /// prefix, an isolated log, retries, and failure notification. The
    /// progress sink is absent (reports validate and vanish).
    pub async fn run_locally(
        &self,
        descriptor: &FunctionDescriptor,
        args: Option<Arguments>,
    ) -> Result<Value> {
        let key = canonical_job_key(descriptor.name(), args.as_ref());
        let gjs_id = gjs_job_id(&random_prefix(), &key);
        debug!(function = descriptor.name().as_str(), gjs_id, "Running job locally");

        self.runner
            .run_job(descriptor, &gjs_id, args, ProgressSink::noop())
            .await
    }

    /// Submit through the queue and block until a worker completes the
    /// job; returns the unwrapped result value.
    pub async fn run_on_gearman(
        &self,
        descriptor: &FunctionDescriptor,
        args: Option<Arguments>,
    ) -> Result<Value> {
        let payload = codec::encode(args.as_ref())?;
        let unique_key =
            (*descriptor.unique()).then(|| canonical_job_key(descriptor.name(), args.as_ref()));

        let (handle, result_bytes) = self
            .client
            .submit_foreground(
                descriptor.name(),
                &payload,
                *descriptor.priority(),
                unique_key.as_deref(),
                None,
            )
            .await?;
        debug!(function = descriptor.name().as_str(), handle = %handle, "Foreground job completed");

        codec::decode_result(&result_bytes)
    }

    /// Enqueue through the queue and return the assigned handle without
    /// waiting for execution.
    pub async fn enqueue_on_gearman(
        &self,
        descriptor: &FunctionDescriptor,
        args: Option<Arguments>,
    ) -> Result<String> {
        let payload = codec::encode(args.as_ref())?;
        let unique_key =
            (*descriptor.unique()).then(|| canonical_job_key(descriptor.name(), args.as_ref()));

        let handle = self
            .client
            .submit_background(
                descriptor.name(),
                &payload,
                *descriptor.priority(),
                unique_key.as_deref(),
            )
            .await?;
        debug!(function = descriptor.name().as_str(), handle = %handle, "Background job enqueued");

        Ok(handle)
    }
}
