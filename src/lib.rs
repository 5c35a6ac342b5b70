//! gearwork layers a uniform *function* abstraction over a Gearman-style
//! task queue.
//!
//! Application code defines named functions with argument dictionaries and
//! result values; callers execute a function in three modes — locally
//! in-process, synchronously through the queue, or asynchronously enqueued
//! — while dedicated workers consume jobs from the queue. Every job gets a
//! consistent lifecycle: a stable filesystem-safe identity, an isolated
//! per-job log, a retry budget, progress reporting, and failure
//! notification.
//!
//! ```no_run
//! use gearwork::{Config, Dispatcher, FunctionDescriptor, JobContext, JobFunction};
//! use serde_json::{json, Map, Value};
//!
//! #[derive(Default)]
//! struct Add;
//!
//! impl JobFunction for Add {
//!     const NAME: &'static str = "Add";
//!
//!     async fn run(&mut self, ctx: JobContext) -> Result<Value, String> {
//!         let a = ctx.arg("a").and_then(Value::as_i64).ok_or("missing a")?;
//!         let b = ctx.arg("b").and_then(Value::as_i64).ok_or("missing b")?;
//!         Ok(json!(a + b))
//!     }
//! }
//!
//! # async fn example() -> gearwork::Result<()> {
//! let dispatcher = Dispatcher::new(Config::default());
//! let descriptor = FunctionDescriptor::of::<Add>();
//!
//! let mut args = Map::new();
//! args.insert("a".into(), json!(2));
//! args.insert("b".into(), json!(3));
//!
//! // In-process, no queue involved:
//! let sum = dispatcher.run_locally(&descriptor, Some(args.clone())).await?;
//! assert_eq!(sum, json!(5));
//!
//! // Through the queue, blocking until a worker finishes:
//! let sum = dispatcher.run_on_gearman(&descriptor, Some(args.clone())).await?;
//!
//! // Fire and forget; the handle serves status and cancel queries:
//! let handle = dispatcher.enqueue_on_gearman(&descriptor, Some(args)).await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod client;
pub mod codec;
pub mod config;
pub mod demo;
pub mod dispatcher;
pub mod errors;
pub mod function;
pub mod identity;
pub mod job_log;
pub mod notifier;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod runner;

pub use admin::{AdminClient, CancelOutcome};
pub use client::{JobStatus, QueueClient};
pub use codec::Arguments;
pub use config::{Config, DEFAULT_GEARMAN_PORT};
pub use dispatcher::Dispatcher;
pub use errors::{GearworkError, Result};
pub use function::{FunctionDescriptor, FunctionRegistry, JobContext, JobFunction, Priority};
pub use identity::ParsedHandle;
pub use job_log::JobLog;
pub use notifier::{notifier_from_config, EmailNotifier, Notifier, SmtpSettings};
pub use pool::{
    shutdown_on_signal, PoolBuildError, ShutdownSignal, WorkerPool, WorkerPoolOptions,
    DEFAULT_POOL_CAP,
};
pub use progress::ProgressSink;
pub use runner::JobRunner;
