//! Distribution server.
//!
//! Listens for launcher clients, enforces the connect handshake and owns
//! one [`RemoteClient`] peer per accepted connection. Each peer runs its
//! own worker threads, outbound queue and sync state machine.

pub mod connection;
pub mod processor;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Buf;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::client::runner::RunParameters;
use crate::config::{resolve_address, ServerConfig};
use crate::error::{Error, Result};
use crate::layout::FileLayout;
use crate::protocol::{
    self, ConnectAccepted, ConnectRequest, MessageCode, RunStatus, StartApplication,
    StopApplication, StopMode, LINK_RUN_STATE,
};
use crate::storage::Storage;
use crate::task::{SyncPhase, SyncTask, Task, TaskQueue};
use crate::transport::{self, Frame, LinkedRunState, MessageQueue};

/// Result of one synchronization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Failure(String),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }
}

/// Event hooks the embedder supplies at construction. All methods have
/// default no-op bodies.
pub trait ServerHandler: Send + Sync {
    fn connection_established(&self, _client: &str) {}
    fn connection_closed(&self, _client: &str) {}
    fn synchronize_finished(&self, _client: &str, _outcome: &SyncOutcome) {}
    fn run_status_changed(&self, _client: &str, _status: RunStatus) {}
}

/// Handler that reacts to nothing.
pub struct NullHandler;

impl ServerHandler for NullHandler {}

/// Listening server endpoint.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
}

impl Server {
    /// Bind the listen address. A bare `"host"` binds the default port 3413.
    pub async fn bind(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Result<Self> {
        config.validate()?;
        let address = resolve_address(&config.listen_address)?;
        let listener = TcpListener::bind(&address).await?;
        info!(%address, base_dir = %config.base_dir.display(), "server listening");
        Ok(Self {
            listener,
            config,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next client that completes the handshake. Connections
    /// failing the handshake are dropped and accepting continues.
    pub async fn accept(&self) -> Result<Arc<RemoteClient>> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match self.handshake(stream).await {
                Ok(client) => return Ok(client),
                Err(e) => warn!(%peer, error = %e, "rejected connection"),
            }
        }
    }

    async fn handshake(&self, stream: TcpStream) -> Result<Arc<RemoteClient>> {
        stream.set_nodelay(true)?;
        let (mut rd, mut wr) = stream.into_split();

        // The first message must be a connect request with the right
        // signature; anything else drops the connection unanswered.
        let frame = transport::read_frame(&mut rd).await?;
        let mut payload = match frame {
            Frame::Message(payload) => payload,
            _ => return Err(Error::Protocol("expected connect request".into())),
        };
        if payload.remaining() < 1 {
            return Err(Error::Protocol("empty first message".into()));
        }
        if MessageCode::from_u8(payload.get_u8()) != Some(MessageCode::ConnectRequest) {
            return Err(Error::Protocol(
                "client sent request other than connect request".into(),
            ));
        }
        let request = ConnectRequest::decode(payload)?;
        if &request.signature != protocol::SIGNATURE_CLIENT {
            return Err(Error::Protocol(
                "client requested with wrong signature".into(),
            ));
        }

        let enabled_features = request.features & protocol::SUPPORTED_FEATURES;
        wr.write_all(&ConnectAccepted::new(enabled_features).encode())
            .await?;
        // Create the shared run-state value; the client holds write access.
        wr.write_all(&transport::link_state_frame(
            LINK_RUN_STATE,
            RunStatus::Stopped as u8,
        ))
        .await?;
        wr.flush().await?;

        let client = Arc::new(RemoteClient::new(
            request.client_name,
            self.config.clone(),
            self.handler.clone(),
        ));
        client.run_state.link(RunStatus::Stopped);
        processor::spawn_workers(&client);

        tokio::spawn(transport::run_writer(client.outbound.clone(), wr));
        tokio::spawn(read_loop(client.clone(), rd));

        info!(client = %client.name, "connection established");
        self.handler.connection_established(&client.name);
        Ok(client)
    }
}

async fn read_loop(client: Arc<RemoteClient>, mut rd: OwnedReadHalf) {
    let mut closed_rx = client.closed_rx.clone();
    loop {
        tokio::select! {
            frame = transport::read_frame(&mut rd) => match frame {
                Ok(Frame::Message(payload)) => {
                    if let Err(e) = connection::dispatch(&client, payload) {
                        error!(client = %client.name, error = %e, "disconnecting peer");
                        break;
                    }
                }
                Ok(Frame::LinkUpdate { code, value }) => {
                    connection::handle_link_update(&client, code, value);
                }
                Ok(Frame::LinkState { .. }) => {
                    warn!(client = %client.name, "client may not create link states");
                }
                Err(Error::TransportClosed) => break,
                Err(e) => {
                    error!(client = %client.name, error = %e, "read failed");
                    break;
                }
            },
            _ = closed_rx.changed() => break,
        }
    }
    client.on_connection_closed();
}

struct PeerState {
    layout_server: Option<Arc<FileLayout>>,
    layout_client: Option<Arc<FileLayout>>,
    sync: Option<Arc<SyncTask>>,
}

/// Server-side view of one connected launcher client.
pub struct RemoteClient {
    name: String,
    pub(crate) storage: Storage,
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) outbound: Arc<MessageQueue>,
    pub(crate) run_state: LinkedRunState,
    state: Mutex<PeerState>,
    pub(crate) in_flight_files: AtomicU32,
    pub(crate) in_flight_blocks: AtomicU32,
    last_outcome: Mutex<Option<SyncOutcome>>,
    sync_notify: Notify,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl RemoteClient {
    fn new(name: String, config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            storage: Storage::new(&config.base_dir),
            name,
            config,
            handler,
            queue: Arc::new(TaskQueue::new()),
            outbound: Arc::new(MessageQueue::new()),
            run_state: LinkedRunState::new(),
            state: Mutex::new(PeerState {
                layout_server: None,
                layout_client: None,
                sync: None,
            }),
            in_flight_files: AtomicU32::new(0),
            in_flight_blocks: AtomicU32::new(0),
            last_outcome: Mutex::new(None),
            sync_notify: Notify::new(),
            closed: AtomicBool::new(false),
            closed_tx,
            closed_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last observed run status of the game on the client.
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

    /// Begin a synchronization run: scan the local layout and request the
    /// client's. Fails if a run is already in progress.
    pub fn start_sync(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.sync.is_some() {
                return Err(Error::Config("synchronization already running".into()));
            }
            state.layout_server = None;
            state.layout_client = None;
            state.sync = Some(Arc::new(SyncTask::new()));
        }
        self.in_flight_files.store(0, Ordering::Release);
        self.in_flight_blocks.store(0, Ordering::Release);
        *self.last_outcome.lock().unwrap() = None;
        self.queue.push(Task::Layout);
        connection::send_request_layout(self)
    }

    /// Run a full synchronization and wait for its outcome.
    pub async fn synchronize(&self) -> Result<SyncOutcome> {
        self.start_sync()?;
        loop {
            if let Some(outcome) = self.last_outcome.lock().unwrap().take() {
                return Ok(outcome);
            }
            self.sync_notify.notified().await;
        }
    }

    /// Instruct the client to launch the game with the given profile.
    pub fn start_application(&self, params: &RunParameters) -> Result<()> {
        info!(client = %self.name, profile = %params.profile_name, "start application");
        self.send(
            StartApplication {
                game_config: params.game_config.clone(),
                profile_name: params.profile_name.clone(),
                arguments: params.arguments.clone(),
            }
            .encode(),
        )
    }

    /// Instruct the client to stop or kill the running game.
    pub fn stop_application(&self, mode: StopMode) -> Result<()> {
        info!(client = %self.name, ?mode, "stop application");
        self.send(StopApplication { mode }.encode())
    }

    /// Drop the connection. Idempotent.
    pub fn disconnect(&self) {
        self.on_connection_closed();
    }

    pub(crate) fn send(&self, frame: bytes::Bytes) -> Result<()> {
        if self.outbound.push(frame) {
            Ok(())
        } else {
            Err(Error::TransportClosed)
        }
    }

    pub(crate) fn sync_task(&self) -> Option<Arc<SyncTask>> {
        self.state.lock().unwrap().sync.clone()
    }

    pub(crate) fn layouts(&self) -> (Option<Arc<FileLayout>>, Option<Arc<FileLayout>>) {
        let state = self.state.lock().unwrap();
        (state.layout_server.clone(), state.layout_client.clone())
    }

    pub(crate) fn set_layout_server(&self, layout: Arc<FileLayout>) {
        self.state.lock().unwrap().layout_server = Some(layout);
    }

    pub(crate) fn set_layout_client(&self, layout: Arc<FileLayout>) {
        self.state.lock().unwrap().layout_client = Some(layout);
    }

    pub(crate) fn succeed_sync(&self) {
        let sync = self.state.lock().unwrap().sync.take();
        if sync.is_none() {
            return;
        }
        info!(client = %self.name, "synchronize succeeded");
        self.finish_sync(SyncOutcome::Success);
    }

    /// Fail the current sync run, dropping all in-flight sub-tasks.
    pub(crate) fn fail_sync(&self, message: String) {
        let sync = self.state.lock().unwrap().sync.take();
        let Some(sync) = sync else {
            return;
        };
        {
            let mut state = sync.state.lock().unwrap();
            sync.set_phase(SyncPhase::Failure);
            state.error = Some(message.clone());
            state.block_hashes.clear();
            state.delete_files.clear();
            state.write_files.clear();
        }
        error!(client = %self.name, %message, "synchronize failed");
        self.finish_sync(SyncOutcome::Failure(message));
    }

    fn finish_sync(&self, outcome: SyncOutcome) {
        *self.last_outcome.lock().unwrap() = Some(outcome.clone());
        self.sync_notify.notify_one();
        self.handler.synchronize_finished(&self.name, &outcome);
    }

    pub(crate) fn on_connection_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound.close();
        self.queue.shutdown();

        // Abandon the current sync run, if any.
        let sync = self.state.lock().unwrap().sync.take();
        if let Some(sync) = sync {
            {
                let mut state = sync.state.lock().unwrap();
                if !matches!(sync.phase(), SyncPhase::Success | SyncPhase::Failure) {
                    sync.set_phase(SyncPhase::Failure);
                    state.error = Some("connection closed".into());
                }
            }
            *self.last_outcome.lock().unwrap() =
                Some(SyncOutcome::Failure("connection closed".into()));
            self.sync_notify.notify_one();
        }

        info!(client = %self.name, "connection closed");
        self.handler.connection_closed(&self.name);
        let _ = self.closed_tx.send(true);
    }
}
