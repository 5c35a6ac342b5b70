use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use getset::Getters;
use serde_json::Value;
use tracing::warn;

use crate::codec::Arguments;
use crate::errors::Result;
use crate::job_log::JobLog;
use crate::progress::ProgressSink;

/// Priority class of a function's jobs. The queue keeps FIFO order within
/// a class; the class only selects the submission verb.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Context handed to each job attempt: the argument dictionary, the
/// progress sink, and the job's log.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct JobContext {
    /// Library-assigned job identifier, also the log file stem
    gjs_id: String,
    /// Argument dictionary the job was submitted with
    args: Option<Arguments>,
    #[getset(skip)]
    progress: ProgressSink,
    #[getset(skip)]
    log: JobLog,
}

impl JobContext {
    pub(crate) fn new(
        gjs_id: String,
        args: Option<Arguments>,
        progress: ProgressSink,
        log: JobLog,
    ) -> Self {
        JobContext {
            gjs_id,
            args,
            progress,
            log,
        }
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }

    pub fn log(&self) -> &JobLog {
        &self.log
    }

    /// Append one line to the job's log.
    pub fn log_line(&self, message: &str) -> Result<()> {
        self.log.line(message)
    }

    /// Fetch one argument by key.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|map| map.get(key))
    }
}

/// A registered unit of work.
///
/// Implementors declare a unique `NAME` and override the remaining
/// attributes as needed; every attribute has an explicit default. A fresh
/// value is constructed for every attempt (`Default`), so no state leaks
/// across attempts or jobs.
///
/// ```
/// use gearwork::{JobContext, JobFunction};
/// use serde_json::{json, Value};
///
/// #[derive(Default)]
/// struct Add;
///
/// impl JobFunction for Add {
///     const NAME: &'static str = "Add";
///
///     async fn run(&mut self, ctx: JobContext) -> Result<Value, String> {
///         let a = ctx.arg("a").and_then(Value::as_i64).ok_or("missing a")?;
///         let b = ctx.arg("b").and_then(Value::as_i64).ok_or("missing b")?;
///         Ok(json!(a + b))
///     }
/// }
/// ```
pub trait JobFunction: Default + Send + 'static {
    /// Unique function name; clients submit against this name
    const NAME: &'static str;

    /// Per-attempt timeout in seconds; 0 disables the timeout
    const TIMEOUT_SECS: u64 = 0;

    /// Retry budget; total attempts = `RETRIES + 1`
    const RETRIES: u32 = 0;

    /// Collapse concurrent submissions with equal `(name, args)` into one
    /// active queue job
    const UNIQUE: bool = false;

    const PRIORITY: Priority = Priority::Normal;

    /// Send a failure notification when the job fails terminally
    const NOTIFY_ON_FAILURE: bool = true;

    /// Execute one attempt against the argument dictionary; the returned
    /// value is wrapped as `{ "result": value }` on its way to the queue.
    fn run(
        &mut self,
        ctx: JobContext,
    ) -> impl Future<Output = core::result::Result<Value, String>> + Send;
}

type AttemptFn = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = core::result::Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// Type-erased registration record for one function: the declared
/// attributes plus a factory that builds a fresh instance per attempt.
/// Immutable after construction.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct FunctionDescriptor {
    name: String,
    timeout: Duration,
    retries: u32,
    unique: bool,
    priority: Priority,
    notify_on_failure: bool,
    #[getset(skip)]
    attempt: AttemptFn,
}

impl FunctionDescriptor {
    pub fn of<F: JobFunction>() -> Self {
        let attempt: AttemptFn = Arc::new(|ctx: JobContext| {
            async move {
                let mut function = F::default();
                function.run(ctx).await
            }
            .boxed()
        });

        FunctionDescriptor {
            name: F::NAME.to_string(),
            timeout: Duration::from_secs(F::TIMEOUT_SECS),
            retries: F::RETRIES,
            unique: F::UNIQUE,
            priority: F::PRIORITY,
            notify_on_failure: F::NOTIFY_ON_FAILURE,
            attempt,
        }
    }

    /// Run one attempt with a fresh function instance.
    pub(crate) fn run_attempt(
        &self,
        ctx: JobContext,
    ) -> Pin<Box<dyn Future<Output = core::result::Result<Value, String>> + Send>> {
        (self.attempt)(ctx)
    }

    /// Timeout in milliseconds, the unit `CAN_DO_TIMEOUT` registration
    /// declares to the queue.
    pub fn timeout_millis(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

impl std::fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("unique", &self.unique)
            .field("priority", &self.priority)
            .field("notify_on_failure", &self.notify_on_failure)
            .finish()
    }
}

/// Name → descriptor map consumed by the worker pool and the CLI.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionDescriptor>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Re-registering a name replaces the previous
    /// descriptor (last wins).
    pub fn register<F: JobFunction>(&mut self) -> &mut Self {
        let descriptor = FunctionDescriptor::of::<F>();
        if self
            .functions
            .insert(descriptor.name().clone(), descriptor)
            .is_some()
        {
            warn!(function = F::NAME, "Replacing existing function registration");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
