//! Launcher client peer.
//!
//! Connects to the distribution server, answers its sync requests through
//! the worker pool and drives the game through the [`GameRunner`] seam.
//! The client never initiates synchronization.

pub mod connection;
pub mod processor;
pub mod runner;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Buf;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{resolve_address, ClientConfig};
use crate::error::{Error, Result};
use crate::layout::FileLayout;
use crate::protocol::{
    self, ConnectAccepted, ConnectRequest, LogLevel, Logs, MessageCode, RunStatus, LINK_RUN_STATE,
};
use crate::storage::Storage;
use crate::task::{TaskQueue, WriteFileTask};
use crate::transport::{self, Frame, LinkedRunState, MessageQueue};

use runner::GameRunner;

/// Send a keep-alive every this many pulse ticks (~seconds).
const KEEP_ALIVE_TICKS: u32 = 10;

struct ClientState {
    layout: Option<Arc<FileLayout>>,
    layout_dirty: bool,
    write_files: BTreeMap<String, Arc<WriteFileTask>>,
}

/// Client-side peer of the launcher protocol.
pub struct LauncherClient {
    name: String,
    pub(crate) storage: Storage,
    pub(crate) config: ClientConfig,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) outbound: Arc<MessageQueue>,
    pub(crate) run_state: LinkedRunState,
    pub(crate) runner: Mutex<Box<dyn GameRunner>>,
    state: Mutex<ClientState>,
    /// Lock-free mirror of `state.layout.is_some()` for the scheduling
    /// predicate.
    has_layout: AtomicBool,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl LauncherClient {
    /// Connect to the server and complete the handshake. Workers, the
    /// transport tasks and the pulse loop start once the server accepts.
    pub async fn connect(config: ClientConfig, runner: Box<dyn GameRunner>) -> Result<Arc<Self>> {
        config.validate()?;
        let address = resolve_address(&config.connect_address)?;
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        let (mut rd, mut wr) = stream.into_split();

        wr.write_all(&ConnectRequest::new(config.client_name.clone()).encode())
            .await?;
        wr.flush().await?;

        // The first answer must be a connect acceptance with the right
        // signature; otherwise drop the connection.
        let frame = transport::read_frame(&mut rd).await?;
        let mut payload = match frame {
            Frame::Message(payload) => payload,
            _ => return Err(Error::Protocol("expected connect acceptance".into())),
        };
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty first message".into()));
        }
        if MessageCode::from_u8(payload.get_u8()) != Some(MessageCode::ConnectAccepted) {
            return Err(Error::Protocol(
                "server answered with message other than connect acceptance".into(),
            ));
        }
        let accepted = ConnectAccepted::decode(payload)?;
        if &accepted.signature != protocol::SIGNATURE_SERVER {
            return Err(Error::Protocol(
                "server answered with wrong signature".into(),
            ));
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        let client = Arc::new(Self {
            name: config.client_name.clone(),
            storage: Storage::new(&config.base_dir),
            config,
            queue: Arc::new(TaskQueue::new()),
            outbound: Arc::new(MessageQueue::new()),
            run_state: LinkedRunState::new(),
            runner: Mutex::new(runner),
            state: Mutex::new(ClientState {
                layout: None,
                layout_dirty: false,
                write_files: BTreeMap::new(),
            }),
            has_layout: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_tx,
            closed_rx,
        });

        processor::spawn_workers(&client);
        tokio::spawn(transport::run_writer(client.outbound.clone(), wr));
        tokio::spawn(read_loop(client.clone(), rd));
        tokio::spawn(pulse_loop(client.clone()));

        info!(%address, client = %client.name, "connected to server");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_status(&self) -> RunStatus {
        self.run_state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the connection is gone.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop the connection. Idempotent. A running game is left running.
    pub fn disconnect(&self) {
        self.on_connection_closed();
    }

    /// Forward a log record to the server and emit it locally.
    pub fn send_log(&self, level: LogLevel, source: &str, message: &str) {
        match level {
            LogLevel::Error => error!(%source, "{message}"),
            LogLevel::Warning => warn!(%source, "{message}"),
            LogLevel::Info => info!(%source, "{message}"),
        }
        let _ = self.send(
            Logs {
                level,
                source: source.to_string(),
                message: message.to_string(),
            }
            .encode(),
        );
    }

    pub(crate) fn send(&self, frame: bytes::Bytes) -> Result<()> {
        if self.outbound.push(frame) {
            Ok(())
        } else {
            Err(Error::TransportClosed)
        }
    }

    // -------------------------------------------------------------------------
    // Layout access
    // -------------------------------------------------------------------------

    pub(crate) fn layout(&self) -> Option<Arc<FileLayout>> {
        self.state.lock().unwrap().layout.clone()
    }

    pub(crate) fn has_layout(&self) -> bool {
        self.has_layout.load(Ordering::Acquire)
    }

    /// Layout together with its dirty flag.
    pub(crate) fn layout_state(&self) -> (Option<Arc<FileLayout>>, bool) {
        let state = self.state.lock().unwrap();
        (state.layout.clone(), state.layout_dirty)
    }

    /// Replace the layout wholesale after a scan; clears the dirty flag.
    pub(crate) fn set_layout(&self, layout: Arc<FileLayout>) {
        {
            let mut state = self.state.lock().unwrap();
            state.layout = Some(layout);
            state.layout_dirty = false;
        }
        self.has_layout.store(true, Ordering::Release);
        // Layout-dependent tasks may have become runnable.
        self.queue.notify();
    }

    /// Mark the layout as stale after a failed operation; the next layout
    /// request triggers a re-scan.
    pub(crate) fn mark_layout_dirty(&self) {
        self.state.lock().unwrap().layout_dirty = true;
    }

    // -------------------------------------------------------------------------
    // Write task map
    // -------------------------------------------------------------------------

    pub(crate) fn insert_write_task(&self, task: Arc<WriteFileTask>) {
        self.state
            .lock()
            .unwrap()
            .write_files
            .insert(task.path.clone(), task);
    }

    pub(crate) fn write_task(&self, path: &str) -> Option<Arc<WriteFileTask>> {
        self.state.lock().unwrap().write_files.get(path).cloned()
    }

    pub(crate) fn remove_write_task(&self, path: &str) {
        self.state.lock().unwrap().write_files.remove(path);
    }

    // -------------------------------------------------------------------------
    // Run state
    // -------------------------------------------------------------------------

    /// Write the linked run-state value; observers on the server side are
    /// notified through the link channel.
    pub(crate) fn set_run_status(&self, status: RunStatus) {
        if self.run_state.set(status) {
            info!(?status, "run status changed");
            let _ = self.send(transport::link_update_frame(LINK_RUN_STATE, status as u8));
        }
    }

    pub(crate) fn poll_runner(&self) {
        let status = self.runner.lock().unwrap().poll();
        self.set_run_status(status);
    }

    pub(crate) fn on_connection_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound.close();
        self.queue.shutdown();
        self.state.lock().unwrap().write_files.clear();
        info!(client = %self.name, "connection closed");
        let _ = self.closed_tx.send(true);
    }
}

async fn read_loop(client: Arc<LauncherClient>, mut rd: OwnedReadHalf) {
    let mut closed_rx = client.closed_rx.clone();
    loop {
        tokio::select! {
            frame = transport::read_frame(&mut rd) => match frame {
                Ok(Frame::Message(payload)) => {
                    if let Err(e) = connection::dispatch(&client, payload) {
                        error!(error = %e, "disconnecting from server");
                        break;
                    }
                }
                Ok(Frame::LinkState { code, value }) => {
                    if code == LINK_RUN_STATE {
                        client.run_state.link(RunStatus::from_u8(value));
                        info!("run state linked");
                    } else {
                        warn!(code, "ignoring unknown link state");
                    }
                }
                Ok(Frame::LinkUpdate { code, .. }) => {
                    warn!(code, "server may not write link states");
                }
                Err(Error::TransportClosed) => break,
                Err(e) => {
                    error!(error = %e, "read failed");
                    break;
                }
            },
            _ = closed_rx.changed() => break,
        }
    }
    client.on_connection_closed();
}

/// Background pulse: polls the game runner at ~1 Hz so a stopped game
/// flips the linked run status, and keeps the transport alive.
async fn pulse_loop(client: Arc<LauncherClient>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = 0u32;
    loop {
        interval.tick().await;
        if client.is_closed() {
            return;
        }
        client.poll_runner();
        ticks += 1;
        if ticks % KEEP_ALIVE_TICKS == 0 {
            let _ = client.send(protocol::keep_alive_frame());
        }
    }
}
