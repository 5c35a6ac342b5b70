use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use rand::RngCore;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::Config;
use crate::errors::{GearworkError, Result};
use crate::function::{FunctionDescriptor, FunctionRegistry, JobFunction};
use crate::identity::{canonical_job_key, gjs_job_id, ParsedHandle};
use crate::notifier::{notifier_from_config, Notifier};
use crate::progress::ProgressSink;
use crate::protocol::{
    error_from_packet, read_packet, write_packet, Packet, PacketType, MAGIC_REQUEST,
    MAGIC_RESPONSE,
};
use crate::runner::JobRunner;

/// Default cap on the total number of workers one pool may spawn.
pub const DEFAULT_POOL_CAP: usize = 64;

/// Future that completes when the pool should shut down. Cloneable so
/// every worker can watch the same signal.
pub type ShutdownSignal = futures::future::Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Shutdown signal bound to SIGINT/SIGTERM (Ctrl-C elsewhere).
pub fn shutdown_on_signal() -> ShutdownSignal {
    async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate =
                signal(SignalKind::terminate()).expect("failed to attach SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => (),
                _ = terminate.recv() => (),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal detected. Attempting graceful shutdown...");
    }
    .boxed()
    .shared()
}

/// Errors raised while assembling a worker pool.
#[derive(Error, Debug)]
pub enum PoolBuildError {
    /// Neither an explicit function selection nor a registered function
    /// was available
    #[error("no functions selected for the worker pool")]
    NoFunctions,

    /// A selected function name has no registration
    #[error("function '{0}' is not registered")]
    UnknownFunction(String),

    /// Capacity or configuration errors from the library core
    #[error(transparent)]
    Gearwork(#[from] GearworkError),
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolOptions {
    config: Config,
    registry: FunctionRegistry,
    selection: Option<Vec<String>>,
    instances: usize,
    cap: usize,
    notifier: Option<Arc<dyn Notifier>>,
    shutdown: Option<ShutdownSignal>,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        WorkerPoolOptions {
            config: Config::default(),
            registry: FunctionRegistry::new(),
            selection: None,
            instances: 1,
            cap: DEFAULT_POOL_CAP,
            notifier: None,
            shutdown: None,
        }
    }
}

impl WorkerPoolOptions {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a function with the pool's registry.
    pub fn register<F: JobFunction>(mut self) -> Self {
        self.registry.register::<F>();
        self
    }

    /// Use an already-populated registry.
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Restrict the pool to one named function. Repeatable; without any
    /// selection the pool serves every registered function.
    pub fn function(mut self, name: &str) -> Self {
        self.selection
            .get_or_insert_with(Vec::new)
            .push(name.to_string());
        self
    }

    /// Workers to spawn per selected function.
    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Cap on the total worker count.
    pub fn cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    /// Replace the config-derived notifier (tests substitute a capturing
    /// sink here).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// External shutdown signal; [`shutdown_on_signal`] for the usual
    /// SIGINT/SIGTERM behavior. `WorkerPool::request_shutdown` works
    /// either way.
    pub fn shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn init(self) -> core::result::Result<WorkerPool, PoolBuildError> {
        let selected = match self.selection {
            Some(names) => names,
            None => self.registry.names(),
        };
        if selected.is_empty() || self.instances == 0 {
            return Err(PoolBuildError::NoFunctions);
        }

        let mut descriptors = Vec::with_capacity(selected.len());
        for name in &selected {
            let descriptor = self
                .registry
                .get(name)
                .ok_or_else(|| PoolBuildError::UnknownFunction(name.clone()))?;
            descriptors.push(descriptor.clone());
        }

        let requested = descriptors.len() * self.instances;
        if requested > self.cap {
            return Err(GearworkError::PoolCapacityExceeded {
                requested,
                cap: self.cap,
            }
            .into());
        }

        // The log directory must be writable before any worker accepts a
        // job; failing here beats failing on the first assignment.
        std::fs::create_dir_all(&self.config.worker_log_dir).map_err(GearworkError::Io)?;

        let notifier = self.notifier.or_else(|| notifier_from_config(&self.config));
        let config = Arc::new(self.config);
        let runner = Arc::new(JobRunner::new(config.clone(), notifier));

        let shutdown_notify = Arc::new(Notify::new());
        let notify = shutdown_notify.clone();
        let notify_fut = async move { notify.notified().await };
        let shutdown: ShutdownSignal = match self.shutdown {
            Some(external) => async move {
                tokio::select! {
                    _ = external => (),
                    _ = notify_fut => (),
                }
            }
            .boxed()
            .shared(),
            None => notify_fut.boxed().shared(),
        };

        Ok(WorkerPool {
            config,
            descriptors,
            instances: self.instances,
            runner,
            shutdown,
            shutdown_notify,
        })
    }
}

/// Supervises N workers per registered function.
///
/// Each worker registers its function with every configured server and
/// consumes jobs until a fatal protocol error or shutdown. Workers are
/// isolated from each other: one worker's death never cascades to its
/// siblings, and the supervisor waits for all of them before returning.
pub struct WorkerPool {
    config: Arc<Config>,
    descriptors: Vec<FunctionDescriptor>,
    instances: usize,
    runner: Arc<JobRunner>,
    shutdown: ShutdownSignal,
    shutdown_notify: Arc<Notify>,
}

impl WorkerPool {
    pub fn options() -> WorkerPoolOptions {
        WorkerPoolOptions::default()
    }

    /// Total workers this pool spawns.
    pub fn worker_count(&self) -> usize {
        self.descriptors.len() * self.instances
    }

    /// Ask every worker to finish its in-flight job and exit.
    pub fn request_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Spawn all workers and wait for every one of them to exit.
    ///
    /// Returns the first worker error once all workers have finished, or
    /// `Ok` when every worker exited cleanly (shutdown).
    pub async fn run(&self) -> Result<()> {
        let servers = self.config.server_addrs();
        let mut handles = Vec::with_capacity(self.worker_count());

        for descriptor in &self.descriptors {
            for instance in 0..self.instances {
                let worker = Worker {
                    worker_id: worker_id(),
                    descriptor: descriptor.clone(),
                    servers: servers.clone(),
                    runner: self.runner.clone(),
                    shutdown: self.shutdown.clone(),
                };
                debug!(
                    worker_id = worker.worker_id.as_str(),
                    function = descriptor.name().as_str(),
                    instance,
                    "Spawning worker"
                );
                handles.push(tokio::spawn(worker_main(worker)));
            }
        }

        info!(workers = handles.len(), "Worker pool started");

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Worker exited with error");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    error!(error = %join_err, "Worker task panicked");
                    first_error
                        .get_or_insert(GearworkError::Queue(format!("worker panicked: {join_err}")));
                }
            }
        }

        info!("Worker pool stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn worker_id() -> String {
    let mut random_bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    format!("gearwork_{}", hex::encode(random_bytes))
}

/// One long-lived worker bound to exactly one function.
struct Worker {
    worker_id: String,
    descriptor: FunctionDescriptor,
    servers: Vec<String>,
    runner: Arc<JobRunner>,
    shutdown: ShutdownSignal,
}

async fn worker_main(worker: Worker) -> Result<()> {
    let mut connections = Vec::new();
    let mut failures = Vec::new();

    for addr in &worker.servers {
        match register(&worker, addr).await {
            Ok(stream) => connections.push((addr.clone(), stream)),
            Err(e) => {
                warn!(
                    worker_id = worker.worker_id.as_str(),
                    addr = %addr,
                    error = %e,
                    "Registration refused"
                );
                failures.push(format!("{addr}: {e}"));
            }
        }
    }

    if connections.is_empty() {
        return Err(GearworkError::BackendRegistration(failures.join("; ")));
    }

    info!(
        worker_id = worker.worker_id.as_str(),
        function = worker.descriptor.name().as_str(),
        servers = connections.len(),
        "Worker registered"
    );

    // One consumption loop per registered server. A fatal protocol error
    // on any connection ends the whole worker; siblings are unaffected.
    let loops = connections
        .into_iter()
        .map(|(addr, stream)| connection_loop(&worker, addr, stream));
    futures::future::try_join_all(loops).await?;

    Ok(())
}

/// Connect and declare the function, with its timeout when one is set.
async fn register(worker: &Worker, addr: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| GearworkError::Queue(format!("connection to {addr} failed: {e}")))?;

    let name = worker.descriptor.name().as_bytes();
    let timeout_millis = worker.descriptor.timeout_millis();
    let packet = if timeout_millis > 0 {
        Packet::new(
            PacketType::CanDoTimeout,
            &[name, timeout_millis.to_string().as_bytes()],
        )
    } else {
        Packet::new(PacketType::CanDo, &[name])
    };
    write_packet(&mut stream, MAGIC_REQUEST, &packet).await?;

    Ok(stream)
}

async fn connection_loop(worker: &Worker, addr: String, mut stream: TcpStream) -> Result<()> {
    let mut shutdown = worker.shutdown.clone();

    loop {
        write_packet(
            &mut stream,
            MAGIC_REQUEST,
            &Packet::new(PacketType::GrabJob, &[]),
        )
        .await?;

        let packet = tokio::select! {
            _ = &mut shutdown => {
                info!(worker_id = worker.worker_id.as_str(), addr = %addr, "Worker shutting down");
                return Ok(());
            }
            packet = read_packet(&mut stream, MAGIC_RESPONSE) => packet?,
        };

        match packet.packet_type {
            PacketType::JobAssign => {
                process_assignment(worker, &mut stream, &packet).await?;
            }
            PacketType::NoJob => {
                write_packet(
                    &mut stream,
                    MAGIC_REQUEST,
                    &Packet::new(PacketType::PreSleep, &[]),
                )
                .await?;

                let wake = tokio::select! {
                    _ = &mut shutdown => {
                        info!(worker_id = worker.worker_id.as_str(), addr = %addr, "Worker shutting down");
                        return Ok(());
                    }
                    packet = read_packet(&mut stream, MAGIC_RESPONSE) => packet?,
                };
                match wake.packet_type {
                    PacketType::Noop => {}
                    PacketType::Error => return Err(error_from_packet(&wake)),
                    other => {
                        return Err(GearworkError::Queue(format!(
                            "expected NOOP while sleeping, server sent {other:?}"
                        )));
                    }
                }
            }
            PacketType::Noop => {}
            PacketType::Error => return Err(error_from_packet(&packet)),
            other => {
                return Err(GearworkError::Queue(format!(
                    "unexpected {other:?} in worker loop"
                )));
            }
        }
    }
}

/// Run one assigned job through the runner and reply to the queue.
///
/// User-code failures fail the job (`WORK_FAIL`) but never the worker;
/// failing to deliver the reply is fatal to the worker.
async fn process_assignment(worker: &Worker, stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    let (handle, payload) = {
        let args = packet.args(3)?;
        let handle = String::from_utf8(args[0].to_vec())
            .map_err(|_| GearworkError::Queue("job handle is not valid UTF-8".into()))?;
        (handle, args[2].to_vec())
    };

    info!(
        worker_id = worker.worker_id.as_str(),
        function = worker.descriptor.name().as_str(),
        handle = %handle,
        "Job assigned"
    );

    let job_args = match codec::decode(&payload) {
        Ok(args) => args,
        Err(e) => {
            // A corrupt payload fails the job, not the worker.
            error!(handle = %handle, error = %e, "Failed to decode job payload");
            return fail_job(stream, &handle).await;
        }
    };

    let prefix = match ParsedHandle::parse(&handle) {
        Ok(parsed) => parsed.gjs_prefix(),
        Err(e) => {
            error!(handle = %handle, error = %e, "Queue sent an unparseable handle");
            return fail_job(stream, &handle).await;
        }
    };
    let gjs_id = gjs_job_id(
        &prefix,
        &canonical_job_key(worker.descriptor.name(), job_args.as_ref()),
    );

    let (progress, mut progress_rx) = ProgressSink::channel();
    let runner = worker.runner.clone();
    let descriptor = worker.descriptor.clone();
    let job_gjs_id = gjs_id.clone();
    let mut job = tokio::spawn(async move {
        runner
            .run_job(&descriptor, &job_gjs_id, job_args, progress)
            .await
    });

    // Forward progress reports while the job runs.
    let outcome = loop {
        tokio::select! {
            joined = &mut job => break joined,
            update = progress_rx.recv() => {
                match update {
                    Some((numerator, denominator)) => {
                        let status = Packet::new(
                            PacketType::WorkStatus,
                            &[
                                handle.as_bytes(),
                                numerator.to_string().as_bytes(),
                                denominator.to_string().as_bytes(),
                            ],
                        );
                        write_packet(stream, MAGIC_REQUEST, &status).await?;
                    }
                    None => break (&mut job).await,
                }
            }
        }
    };

    // Deliver progress reported just before the job finished.
    while let Ok((numerator, denominator)) = progress_rx.try_recv() {
        let status = Packet::new(
            PacketType::WorkStatus,
            &[
                handle.as_bytes(),
                numerator.to_string().as_bytes(),
                denominator.to_string().as_bytes(),
            ],
        );
        write_packet(stream, MAGIC_REQUEST, &status).await?;
    }

    match outcome {
        Ok(Ok(value)) => match codec::encode_result(&value) {
            Ok(result_bytes) => {
                let complete = Packet::new(
                    PacketType::WorkComplete,
                    &[handle.as_bytes(), &result_bytes],
                );
                write_packet(stream, MAGIC_REQUEST, &complete).await?;
                info!(handle = %handle, gjs_id = gjs_id.as_str(), "Job completed");
            }
            Err(e) => {
                error!(handle = %handle, error = %e, "Failed to encode job result");
                fail_job(stream, &handle).await?;
            }
        },
        Ok(Err(e)) => {
            warn!(handle = %handle, gjs_id = gjs_id.as_str(), error = %e, "Job failed");
            fail_job(stream, &handle).await?;
        }
        Err(join_err) => {
            error!(handle = %handle, error = %join_err, "Job task died unexpectedly");
            fail_job(stream, &handle).await?;
        }
    }

    Ok(())
}

async fn fail_job(stream: &mut TcpStream, handle: &str) -> Result<()> {
    let fail = Packet::new(PacketType::WorkFail, &[handle.as_bytes()]);
    write_packet(stream, MAGIC_REQUEST, &fail).await
}
