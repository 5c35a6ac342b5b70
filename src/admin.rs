use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{GearworkError, Result};

/// Client for the plaintext administrative protocol the queue exposes on
/// the same port as the binary protocol.
///
/// Commands are single lines; replies are either one line (`OK …`,
/// `ERR <code> <text>`, or a bare value such as a version string) or a
/// block of lines terminated by a line containing a single `.`.
pub struct AdminClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    addr: String,
}

/// Outcome of a cancel request. Only queued (not yet running) jobs are
/// cancellable; the queue refuses everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    Refused { reply: String },
}

impl AdminClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            GearworkError::Queue(format!("admin connection to {addr} failed: {e}"))
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(AdminClient {
            reader: BufReader::new(read_half),
            writer: write_half,
            addr: addr.to_string(),
        })
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        debug!(addr = %self.addr, command, "Sending admin command");
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(GearworkError::Queue(format!(
                "{} closed the admin connection",
                self.addr
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Run a command whose reply is a single line.
    async fn line_command(&mut self, command: &str) -> Result<String> {
        self.send(command).await?;
        let reply = self.read_line().await?;
        if let Some(err) = reply.strip_prefix("ERR ") {
            return Err(GearworkError::Queue(format!(
                "'{command}' failed: {err}"
            )));
        }
        Ok(reply)
    }

    /// Run a command whose reply is a `.`-terminated block.
    async fn block_command(&mut self, command: &str) -> Result<Vec<String>> {
        self.send(command).await?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(lines);
            }
            if let Some(err) = line.strip_prefix("ERR ") {
                return Err(GearworkError::Queue(format!("'{command}' failed: {err}")));
            }
            lines.push(line);
        }
    }

    /// Server version string.
    pub async fn version(&mut self) -> Result<String> {
        let reply = self.line_command("version").await?;
        Ok(reply.strip_prefix("OK ").unwrap_or(&reply).to_string())
    }

    /// Current verbosity level of the server.
    pub async fn verbose(&mut self) -> Result<String> {
        let reply = self.line_command("verbose").await?;
        Ok(reply.strip_prefix("OK ").unwrap_or(&reply).to_string())
    }

    /// PID of the server process.
    pub async fn getpid(&mut self) -> Result<u32> {
        let reply = self.line_command("getpid").await?;
        let digits = reply.strip_prefix("OK ").unwrap_or(&reply);
        digits.trim().parse().map_err(|_| {
            GearworkError::Queue(format!("'getpid' returned a non-numeric reply: {reply}"))
        })
    }

    /// Per-function queue statistics (`status` block).
    pub async fn status(&mut self) -> Result<Vec<String>> {
        self.block_command("status").await
    }

    /// Connected workers (`workers` block).
    pub async fn workers(&mut self) -> Result<Vec<String>> {
        self.block_command("workers").await
    }

    /// Every queued job.
    pub async fn show_jobs(&mut self) -> Result<Vec<String>> {
        self.block_command("show jobs").await
    }

    /// Every queued job holding a uniqueness token.
    pub async fn show_unique_jobs(&mut self) -> Result<Vec<String>> {
        self.block_command("show unique jobs").await
    }

    pub async fn create_function(&mut self, function_name: &str) -> Result<()> {
        self.line_command(&format!("create function {function_name}"))
            .await?;
        Ok(())
    }

    pub async fn drop_function(&mut self, function_name: &str) -> Result<()> {
        self.line_command(&format!("drop function {function_name}"))
            .await?;
        Ok(())
    }

    /// Ask the server to shut down, optionally draining gracefully.
    pub async fn shutdown(&mut self, graceful: bool) -> Result<()> {
        let command = if graceful { "shutdown graceful" } else { "shutdown" };
        self.send(command).await?;
        Ok(())
    }

    /// Cancel a queued job. Accepts only an exact `OK` reply; any other
    /// reply is a refusal (the job is already running, or unknown).
    pub async fn cancel_job(&mut self, handle: &str) -> Result<CancelOutcome> {
        self.send(&format!("cancel job {handle}")).await?;
        let reply = self.read_line().await?;
        if reply == "OK" {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::Refused { reply })
        }
    }
}
