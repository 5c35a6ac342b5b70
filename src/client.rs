use getset::Getters;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::admin::{AdminClient, CancelOutcome};
use crate::config::Config;
use crate::errors::{GearworkError, Result};
use crate::function::Priority;
use crate::identity::ParsedHandle;
use crate::protocol::{
    error_from_packet, read_packet, write_packet, Packet, PacketType, MAGIC_REQUEST,
    MAGIC_RESPONSE,
};

/// Progress values reported by `GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStatus {
    /// Whether the queue knows the handle at all
    pub known: bool,
    /// Whether a worker currently holds the job
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

/// Thin façade over the queue protocol: submission (foreground and
/// background, three priorities), status, cancellation, and the plaintext
/// admin commands.
///
/// Each operation opens its own connection; replies like `JOB_CREATED` and
/// `WORK_COMPLETE` are scoped to the connection that submitted. Handles
/// returned by submission are prefixed `server//` so later status and
/// cancel calls route to the server that owns the job.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct QueueClient {
    servers: Vec<String>,
}

impl QueueClient {
    /// Build a client over an explicit `host:port` list.
    pub fn new(servers: Vec<String>) -> Self {
        QueueClient { servers }
    }

    pub fn from_config(config: &Config) -> Self {
        QueueClient::new(config.server_addrs())
    }

    /// Connect to the first server that accepts.
    async fn connect_any(&self) -> Result<(TcpStream, String)> {
        let mut failures = Vec::new();
        for addr in &self.servers {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(addr = %addr, "Connected to gearman server");
                    return Ok((stream, addr.clone()));
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Gearman server refused connection");
                    failures.push(format!("{addr}: {e}"));
                }
            }
        }

        Err(GearworkError::Queue(format!(
            "no gearman server reachable ({})",
            failures.join("; ")
        )))
    }

    fn submit_verb(priority: Priority, background: bool) -> PacketType {
        match (priority, background) {
            (Priority::Low, false) => PacketType::SubmitJobLow,
            (Priority::Low, true) => PacketType::SubmitJobLowBg,
            (Priority::Normal, false) => PacketType::SubmitJob,
            (Priority::Normal, true) => PacketType::SubmitJobBg,
            (Priority::High, false) => PacketType::SubmitJobHigh,
            (Priority::High, true) => PacketType::SubmitJobHighBg,
        }
    }

    async fn submit(
        &self,
        function_name: &str,
        payload: &[u8],
        priority: Priority,
        unique_key: Option<&str>,
        background: bool,
    ) -> Result<(TcpStream, String, String)> {
        let (mut stream, addr) = self.connect_any().await?;

        let unique = unique_key.unwrap_or("");
        let packet = Packet::new(
            Self::submit_verb(priority, background),
            &[function_name.as_bytes(), unique.as_bytes(), payload],
        );
        write_packet(&mut stream, MAGIC_REQUEST, &packet).await?;

        let reply = read_packet(&mut stream, MAGIC_RESPONSE).await?;
        match reply.packet_type {
            PacketType::JobCreated => {
                let handle = reply.text_args(1)?.remove(0);
                debug!(function = function_name, handle = %handle, background, "Job submitted");
                Ok((stream, addr, handle))
            }
            PacketType::Error => Err(error_from_packet(&reply)),
            other => Err(GearworkError::Queue(format!(
                "expected JOB_CREATED, server sent {other:?}"
            ))),
        }
    }

    /// Submit and return immediately with the assigned handle, prefixed
    /// with the server that accepted the job.
    pub async fn submit_background(
        &self,
        function_name: &str,
        payload: &[u8],
        priority: Priority,
        unique_key: Option<&str>,
    ) -> Result<String> {
        let (_stream, addr, handle) = self
            .submit(function_name, payload, priority, unique_key, true)
            .await?;
        Ok(format!("{addr}//{handle}"))
    }

    /// Submit and block until the queue reports a terminal outcome.
    ///
    /// Returns the handle together with the result bytes; a `WORK_FAIL`
    /// surfaces as a job failure carrying the handle so the caller can
    /// locate the log. `WORK_STATUS` packets are forwarded to `on_status`.
    pub async fn submit_foreground(
        &self,
        function_name: &str,
        payload: &[u8],
        priority: Priority,
        unique_key: Option<&str>,
        mut on_status: Option<&mut (dyn FnMut(u64, u64) + Send)>,
    ) -> Result<(String, Vec<u8>)> {
        let (mut stream, addr, handle) = self
            .submit(function_name, payload, priority, unique_key, false)
            .await?;
        let routed_handle = format!("{addr}//{handle}");

        loop {
            let reply = read_packet(&mut stream, MAGIC_RESPONSE).await?;
            match reply.packet_type {
                PacketType::WorkStatus => {
                    let args = reply.text_args(3)?;
                    let numerator = parse_number(&args[1])?;
                    let denominator = parse_number(&args[2])?;
                    if let Some(ref mut observer) = on_status {
                        observer(numerator, denominator);
                    }
                }
                PacketType::WorkComplete => {
                    let args = reply.args(2)?;
                    return Ok((routed_handle, args[1].to_vec()));
                }
                PacketType::WorkFail => {
                    return Err(GearworkError::JobFailure {
                        message: format!("function \"{function_name}\" failed on the queue"),
                        handle: Some(routed_handle),
                    });
                }
                PacketType::Error => return Err(error_from_packet(&reply)),
                other => {
                    return Err(GearworkError::Queue(format!(
                        "unexpected {other:?} while waiting for job completion"
                    )));
                }
            }
        }
    }

    /// Query progress for a handle. When the handle carries no `server//`
    /// routing prefix every configured server is asked, and the first one
    /// that knows the job answers.
    pub async fn status(&self, handle: &str) -> Result<JobStatus> {
        let parsed = ParsedHandle::parse(handle)?;
        let raw = parsed.raw();

        let targets: Vec<String> = match parsed.server() {
            Some(server) => vec![server.clone()],
            None => self.servers.clone(),
        };

        let mut last = JobStatus::default();
        for addr in &targets {
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                GearworkError::Queue(format!("status connection to {addr} failed: {e}"))
            })?;

            let packet = Packet::new(PacketType::GetStatus, &[raw.as_bytes()]);
            write_packet(&mut stream, MAGIC_REQUEST, &packet).await?;

            let reply = read_packet(&mut stream, MAGIC_RESPONSE).await?;
            match reply.packet_type {
                PacketType::StatusRes => {
                    let args = reply.text_args(5)?;
                    let status = JobStatus {
                        known: args[1] == "1",
                        running: args[2] == "1",
                        numerator: parse_number(&args[3])?,
                        denominator: parse_number(&args[4])?,
                    };
                    if status.known {
                        return Ok(status);
                    }
                    last = status;
                }
                PacketType::Error => return Err(error_from_packet(&reply)),
                other => {
                    return Err(GearworkError::Queue(format!(
                        "expected STATUS_RES, server sent {other:?}"
                    )));
                }
            }
        }

        Ok(last)
    }

    /// Cancel a queued job. Connects to each configured server (the
    /// handle's own server first) and sends the textual cancel command;
    /// only an exact `OK` reply counts as cancelled. Running jobs cannot
    /// be cancelled — that is a documented protocol limitation.
    pub async fn cancel(&self, handle: &str) -> Result<CancelOutcome> {
        let parsed = ParsedHandle::parse(handle)?;
        let raw = parsed.raw();

        let mut targets: Vec<String> = Vec::new();
        if let Some(server) = parsed.server() {
            targets.push(server.clone());
        }
        for addr in &self.servers {
            if !targets.contains(addr) {
                targets.push(addr.clone());
            }
        }

        let mut last_refusal = CancelOutcome::Refused {
            reply: "no server reachable".to_string(),
        };
        for addr in &targets {
            let mut admin = match AdminClient::connect(addr).await {
                Ok(admin) => admin,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Cancel target unreachable");
                    continue;
                }
            };
            match admin.cancel_job(&raw).await? {
                CancelOutcome::Cancelled => {
                    debug!(handle = %raw, addr = %addr, "Job cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                refused => last_refusal = refused,
            }
        }

        Ok(last_refusal)
    }

    /// Open an admin session against the first reachable server.
    pub async fn admin(&self) -> Result<AdminClient> {
        let mut failures = Vec::new();
        for addr in &self.servers {
            match AdminClient::connect(addr).await {
                Ok(admin) => return Ok(admin),
                Err(e) => failures.push(format!("{addr}: {e}")),
            }
        }
        Err(GearworkError::Queue(format!(
            "no gearman server reachable for admin ({})",
            failures.join("; ")
        )))
    }
}

fn parse_number(text: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| GearworkError::Queue(format!("non-numeric status field '{text}'")))
}
