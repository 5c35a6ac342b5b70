#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use gearwork::errors::GearworkError;
use gearwork::protocol::{
    read_packet, write_packet, Packet, PacketType, MAGIC_REQUEST, MAGIC_RESPONSE,
};
use gearwork::{Arguments, Config, Notifier};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// Build an argument dictionary from a JSON literal.
pub fn args(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object literal"),
    }
}

/// Config pointing at the given mock server with logs under a temp dir.
pub fn test_config(server_addr: &str, log_dir: &std::path::Path) -> Config {
    Config {
        gearman_servers: vec![server_addr.to_string()],
        worker_log_dir: log_dir.to_path_buf(),
        ..Default::default()
    }
}

/// Notifier that records every message instead of sending mail.
#[derive(Default, Clone)]
pub struct CapturingNotifier {
    messages: Arc<std::sync::Mutex<Vec<(String, String)>>>,
}

impl CapturingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn notify(&self, subject: &str, body: &str) -> gearwork::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Notifier whose delivery always fails.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _subject: &str, _body: &str) -> gearwork::Result<()> {
        Err(GearworkError::Notifier("smtp relay is down".into()))
    }
}

// ---------------------------------------------------------------------------
// Mock gearman server
// ---------------------------------------------------------------------------

/// Event routed from a worker connection back to a foreground submitter.
#[derive(Debug, Clone)]
enum WorkEvent {
    Status(u64, u64),
    Complete(Vec<u8>),
    Fail,
}

type Listener = mpsc::UnboundedSender<WorkEvent>;

struct QueuedJob {
    handle: String,
    function: String,
    payload: Vec<u8>,
    unique: Option<String>,
    listeners: Vec<Listener>,
}

struct ActiveJob {
    function: String,
    listeners: Vec<Listener>,
    numerator: u64,
    denominator: u64,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    queues: HashMap<String, VecDeque<QueuedJob>>,
    active: HashMap<String, ActiveJob>,
    unique_index: HashMap<(String, String), String>,
    sleepers: HashMap<String, Vec<mpsc::UnboundedSender<()>>>,
    created_total: u64,
}

impl State {
    fn submit(
        &mut self,
        function: &str,
        unique: Option<String>,
        payload: Vec<u8>,
        listener: Option<Listener>,
    ) -> String {
        if let Some(token) = &unique {
            let key = (function.to_string(), token.clone());
            if let Some(handle) = self.unique_index.get(&key).cloned() {
                // Merge: attach the new submitter to the existing job.
                if let Some(job) = self
                    .queues
                    .get_mut(function)
                    .and_then(|q| q.iter_mut().find(|j| j.handle == handle))
                {
                    job.listeners.extend(listener);
                    return handle;
                }
                if let Some(active) = self.active.get_mut(&handle) {
                    active.listeners.extend(listener);
                    return handle;
                }
                self.unique_index.remove(&key);
            }
        }

        self.next_seq += 1;
        self.created_total += 1;
        let handle = format!("H:mock:{}", self.next_seq);

        if let Some(token) = &unique {
            self.unique_index
                .insert((function.to_string(), token.clone()), handle.clone());
        }

        self.queues
            .entry(function.to_string())
            .or_default()
            .push_back(QueuedJob {
                handle: handle.clone(),
                function: function.to_string(),
                payload,
                unique,
                listeners: listener.into_iter().collect(),
            });

        for waker in self.sleepers.remove(function).unwrap_or_default() {
            let _ = waker.send(());
        }

        handle
    }

    fn grab(&mut self, registered: &[String]) -> Option<(String, String, Vec<u8>)> {
        for function in registered {
            if let Some(job) = self.queues.get_mut(function).and_then(|q| q.pop_front()) {
                self.active.insert(
                    job.handle.clone(),
                    ActiveJob {
                        function: job.function.clone(),
                        listeners: job.listeners,
                        numerator: 0,
                        denominator: 0,
                    },
                );
                return Some((job.handle, job.function, job.payload));
            }
        }
        None
    }

    fn has_queued(&self, registered: &[String]) -> bool {
        registered
            .iter()
            .any(|f| self.queues.get(f).is_some_and(|q| !q.is_empty()))
    }

    fn forward(&mut self, handle: &str, event: WorkEvent, terminal: bool) {
        if let Some(active) = self.active.get_mut(handle) {
            if let WorkEvent::Status(numerator, denominator) = event {
                active.numerator = numerator;
                active.denominator = denominator;
            }
            for listener in &active.listeners {
                let _ = listener.send(event.clone());
            }
            if terminal {
                let function = active.function.clone();
                self.active.remove(handle);
                self.unique_index
                    .retain(|(f, _), h| !(f == &function && h.as_str() == handle));
            }
        }
    }

    fn cancel(&mut self, handle: &str) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|j| j.handle == handle) {
                let job = queue.remove(pos).unwrap();
                if let Some(token) = job.unique {
                    self.unique_index.remove(&(job.function, token));
                }
                return true;
            }
        }
        false
    }

    fn status(&self, handle: &str) -> (bool, bool, u64, u64) {
        if let Some(active) = self.active.get(handle) {
            return (true, true, active.numerator, active.denominator);
        }
        let queued = self
            .queues
            .values()
            .any(|q| q.iter().any(|j| j.handle == handle));
        (queued, false, 0, 0)
    }
}

/// In-process server speaking enough of the gearman binary and admin
/// protocols for the integration tests: submission (all six verbs with
/// unique merging), worker registration and job flow, status, and cancel.
pub struct MockGearman {
    pub addr: String,
    state: Arc<Mutex<State>>,
}

impl MockGearman {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        MockGearman { addr, state }
    }

    pub async fn queued_count(&self, function: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(function).map_or(0, |q| q.len())
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Total jobs ever created (merged submissions do not count twice).
    pub async fn created_total(&self) -> u64 {
        self.state.lock().await.created_total
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Ok(());
    }

    if first[0] == 0 {
        binary_session(stream, state).await;
    } else {
        admin_session(stream, state).await?;
    }
    Ok(())
}

async fn send(write: &Arc<Mutex<OwnedWriteHalf>>, packet: Packet) {
    let mut guard = write.lock().await;
    let _ = write_packet(&mut *guard, MAGIC_RESPONSE, &packet).await;
}

async fn binary_session(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (mut read, write) = stream.into_split();
    let write = Arc::new(Mutex::new(write));
    let mut registered: Vec<String> = Vec::new();

    loop {
        let Ok(packet) = read_packet(&mut read, MAGIC_REQUEST).await else {
            return;
        };

        match packet.packet_type {
            PacketType::CanDo => {
                if let Ok(args) = packet.text_args(1) {
                    registered.push(args[0].clone());
                }
            }
            PacketType::CanDoTimeout => {
                if let Ok(args) = packet.text_args(2) {
                    registered.push(args[0].clone());
                }
            }
            PacketType::EchoReq => {
                send(&write, Packet::new(PacketType::EchoRes, &[packet.payload.as_slice()])).await;
            }
            PacketType::GrabJob => {
                let grabbed = state.lock().await.grab(&registered);
                match grabbed {
                    Some((handle, function, payload)) => {
                        let assign = Packet::new(
                            PacketType::JobAssign,
                            &[handle.as_bytes(), function.as_bytes(), &payload],
                        );
                        send(&write, assign).await;
                    }
                    None => send(&write, Packet::new(PacketType::NoJob, &[])).await,
                }
            }
            PacketType::PreSleep => {
                let ready = state.lock().await.has_queued(&registered);
                if ready {
                    send(&write, Packet::new(PacketType::Noop, &[])).await;
                } else {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    {
                        let mut guard = state.lock().await;
                        for function in &registered {
                            guard
                                .sleepers
                                .entry(function.clone())
                                .or_default()
                                .push(tx.clone());
                        }
                    }
                    drop(tx);
                    let _ = rx.recv().await;
                    send(&write, Packet::new(PacketType::Noop, &[])).await;
                }
            }
            PacketType::SubmitJob
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobHigh => {
                let Ok(args) = packet.args(3) else { return };
                let function = String::from_utf8_lossy(args[0]).into_owned();
                let unique = if args[1].is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(args[1]).into_owned())
                };
                let payload = args[2].to_vec();

                let (tx, mut rx) = mpsc::unbounded_channel();
                let handle = state
                    .lock()
                    .await
                    .submit(&function, unique, payload, Some(tx));
                send(
                    &write,
                    Packet::new(PacketType::JobCreated, &[handle.as_bytes()]),
                )
                .await;

                // Forward work events until the job reaches a terminal
                // state; foreground submitters read them off this
                // connection.
                while let Some(event) = rx.recv().await {
                    match event {
                        WorkEvent::Status(numerator, denominator) => {
                            let status = Packet::new(
                                PacketType::WorkStatus,
                                &[
                                    handle.as_bytes(),
                                    numerator.to_string().as_bytes(),
                                    denominator.to_string().as_bytes(),
                                ],
                            );
                            send(&write, status).await;
                        }
                        WorkEvent::Complete(data) => {
                            let complete = Packet::new(
                                PacketType::WorkComplete,
                                &[handle.as_bytes(), &data],
                            );
                            send(&write, complete).await;
                            break;
                        }
                        WorkEvent::Fail => {
                            send(
                                &write,
                                Packet::new(PacketType::WorkFail, &[handle.as_bytes()]),
                            )
                            .await;
                            break;
                        }
                    }
                }
            }
            PacketType::SubmitJobBg
            | PacketType::SubmitJobLowBg
            | PacketType::SubmitJobHighBg => {
                let Ok(args) = packet.args(3) else { return };
                let function = String::from_utf8_lossy(args[0]).into_owned();
                let unique = if args[1].is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(args[1]).into_owned())
                };
                let payload = args[2].to_vec();

                let handle = state.lock().await.submit(&function, unique, payload, None);
                send(
                    &write,
                    Packet::new(PacketType::JobCreated, &[handle.as_bytes()]),
                )
                .await;
            }
            PacketType::WorkStatus => {
                if let Ok(args) = packet.text_args(3) {
                    let numerator = args[1].parse().unwrap_or(0);
                    let denominator = args[2].parse().unwrap_or(0);
                    state.lock().await.forward(
                        &args[0],
                        WorkEvent::Status(numerator, denominator),
                        false,
                    );
                }
            }
            PacketType::WorkComplete => {
                if let Ok(args) = packet.args(2) {
                    let handle = String::from_utf8_lossy(args[0]).into_owned();
                    let data = args[1].to_vec();
                    state
                        .lock()
                        .await
                        .forward(&handle, WorkEvent::Complete(data), true);
                }
            }
            PacketType::WorkFail => {
                if let Ok(args) = packet.text_args(1) {
                    state.lock().await.forward(&args[0], WorkEvent::Fail, true);
                }
            }
            PacketType::GetStatus => {
                let Ok(args) = packet.text_args(1) else { return };
                let (known, running, numerator, denominator) =
                    state.lock().await.status(&args[0]);
                let status = Packet::new(
                    PacketType::StatusRes,
                    &[
                        args[0].as_bytes(),
                        if known { b"1" } else { b"0" },
                        if running { b"1" } else { b"0" },
                        numerator.to_string().as_bytes(),
                        denominator.to_string().as_bytes(),
                    ],
                );
                send(&write, status).await;
            }
            _ => return,
        }
    }
}

async fn admin_session(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if let Some(handle) = command.strip_prefix("cancel job ") {
            if state.lock().await.cancel(handle.trim()) {
                write.write_all(b"OK\r\n").await?;
            } else {
                write
                    .write_all(b"ERR NOT_QUEUED job is running or unknown\r\n")
                    .await?;
            }
        } else if command == "version" {
            write.write_all(b"OK 0.1-mock\r\n").await?;
        } else if command == "getpid" {
            write
                .write_all(format!("OK {}\r\n", std::process::id()).as_bytes())
                .await?;
        } else if command == "status" || command == "workers" {
            write.write_all(b".\r\n").await?;
        } else if command == "show jobs" || command == "show unique jobs" {
            let listing = {
                let guard = state.lock().await;
                let mut out = String::new();
                for queue in guard.queues.values() {
                    for job in queue {
                        out.push_str(&format!("{}\r\n", job.handle));
                    }
                }
                out
            };
            write.write_all(listing.as_bytes()).await?;
            write.write_all(b".\r\n").await?;
        } else if command.starts_with("create function") || command.starts_with("drop function") {
            write.write_all(b"OK\r\n").await?;
        } else if command.starts_with("shutdown") {
            write.write_all(b"OK\r\n").await?;
            break;
        } else {
            write.write_all(b"ERR UNKNOWN_COMMAND unknown\r\n").await?;
        }
        write.flush().await?;
    }

    Ok(())
}

/// Drive a bare worker connection by hand: register, grab one job, and
/// answer it with the given reply. Lets client tests exercise foreground
/// completion without a full pool.
pub async fn serve_one_job<F>(server_addr: String, function: &'static str, reply: F)
where
    F: FnOnce(Vec<u8>) -> WorkReply + Send + 'static,
{
    let mut stream = TcpStream::connect(&server_addr).await.unwrap();
    write_packet(
        &mut stream,
        MAGIC_REQUEST,
        &Packet::new(PacketType::CanDo, &[function.as_bytes()]),
    )
    .await
    .unwrap();

    let (handle, payload) = loop {
        write_packet(
            &mut stream,
            MAGIC_REQUEST,
            &Packet::new(PacketType::GrabJob, &[]),
        )
        .await
        .unwrap();

        let packet = read_packet(&mut stream, MAGIC_RESPONSE).await.unwrap();
        match packet.packet_type {
            PacketType::JobAssign => {
                let args = packet.args(3).unwrap();
                break (
                    String::from_utf8(args[0].to_vec()).unwrap(),
                    args[2].to_vec(),
                );
            }
            PacketType::NoJob => {
                write_packet(
                    &mut stream,
                    MAGIC_REQUEST,
                    &Packet::new(PacketType::PreSleep, &[]),
                )
                .await
                .unwrap();
                let _ = read_packet(&mut stream, MAGIC_RESPONSE).await.unwrap();
            }
            other => panic!("unexpected {other:?} while grabbing"),
        }
    };

    match reply(payload) {
        WorkReply::Complete(data) => {
            write_packet(
                &mut stream,
                MAGIC_REQUEST,
                &Packet::new(PacketType::WorkComplete, &[handle.as_bytes(), &data]),
            )
            .await
            .unwrap();
        }
        WorkReply::Fail => {
            write_packet(
                &mut stream,
                MAGIC_REQUEST,
                &Packet::new(PacketType::WorkFail, &[handle.as_bytes()]),
            )
            .await
            .unwrap();
        }
        WorkReply::StatusThenComplete(updates, data) => {
            for (numerator, denominator) in updates {
                write_packet(
                    &mut stream,
                    MAGIC_REQUEST,
                    &Packet::new(
                        PacketType::WorkStatus,
                        &[
                            handle.as_bytes(),
                            numerator.to_string().as_bytes(),
                            denominator.to_string().as_bytes(),
                        ],
                    ),
                )
                .await
                .unwrap();
            }
            write_packet(
                &mut stream,
                MAGIC_REQUEST,
                &Packet::new(PacketType::WorkComplete, &[handle.as_bytes(), &data]),
            )
            .await
            .unwrap();
        }
    }
}

/// Reply shapes for [`serve_one_job`].
pub enum WorkReply {
    Complete(Vec<u8>),
    Fail,
    StatusThenComplete(Vec<(u64, u64)>, Vec<u8>),
}
