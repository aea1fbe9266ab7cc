//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! manager, binds the IPC socket and serves every UI connection: requests go
//! through the [`RequestRouter`], and subscribed connections receive output
//! events on the same socket.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{ErrorCode, OutputEvent, Request, Response, ServerMessage};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{pidfile, IpcConnection, IpcError, IpcServer};
use crate::router::RequestRouter;
use crate::session::{ListenerId, SessionManager, SessionSettings};

/// How long shutdown waits for connections to flush.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A UI client connected.
    ClientConnected { connection_id: u64 },
    /// A UI client disconnected.
    ClientDisconnected { connection_id: u64 },
    /// A client asked the daemon to exit.
    ShutdownRequested,
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ConnectionContext {
    manager: Arc<SessionManager>,
    router: Arc<RequestRouter>,
    shutdown_token: CancellationToken,
    shutdown_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    connections: Arc<AtomicUsize>,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session manager for PTY sessions.
    session_manager: Arc<SessionManager>,
    /// Request router.
    router: Arc<RequestRouter>,
    /// Where the IPC socket is bound.
    socket_path: PathBuf,
    /// Whether to maintain the PID file.
    manage_pid_file: bool,
    /// Number of open connections.
    connections: Arc<AtomicUsize>,
    /// Connection tasks, awaited on shutdown.
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Cancelled when a client sends a shutdown request.
    shutdown_requested: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let settings = SessionSettings::from(&config.session);
        let session_manager = Arc::new(SessionManager::new(settings));
        let router = Arc::new(RequestRouter::new(Arc::clone(&session_manager)));
        let socket_path = config.socket_path();
        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            router,
            socket_path,
            manage_pid_file: false,
            connections: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            accept_task: None,
            shutdown_token: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Write the PID file on start and remove it on stop.
    pub fn with_pid_file(mut self, enabled: bool) -> Self {
        self.manage_pid_file = enabled;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(socket = %self.socket_path.display(), "Starting daemon orchestrator...");

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind socket: {}", self.socket_path.display())
                });
            }
        };

        if self.manage_pid_file {
            match pidfile::write_pid_file() {
                Ok(path) => debug!(path = %path.display(), "Wrote PID file"),
                Err(e) => {
                    drop(server);
                    self.remove_socket_file();
                    *self.state.write().await = OrchestratorState::Stopped;
                    return Err(e).context("Failed to write PID file");
                }
            }
        }

        let context = ConnectionContext {
            manager: Arc::clone(&self.session_manager),
            router: Arc::clone(&self.router),
            shutdown_token: self.shutdown_token.clone(),
            shutdown_requested: self.shutdown_requested.clone(),
            event_tx: self.event_tx.clone(),
            connections: Arc::clone(&self.connections),
        };
        let tracker = self.tracker.clone();
        self.accept_task = Some(tokio::spawn(Self::accept_loop(server, context, tracker)));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Accepts connections until shutdown.
    async fn accept_loop(server: IpcServer, context: ConnectionContext, tracker: TaskTracker) {
        let mut next_connection_id = 0u64;

        loop {
            tokio::select! {
                _ = context.shutdown_token.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        next_connection_id += 1;
                        tracker.spawn(Self::handle_connection(
                            conn,
                            next_connection_id,
                            context.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept IPC connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        debug!("Accept loop finished");
    }

    /// Serves one UI connection until it closes or the daemon stops.
    async fn handle_connection(conn: IpcConnection, connection_id: u64, context: ConnectionContext) {
        context.connections.fetch_add(1, Ordering::SeqCst);
        let _ = context
            .event_tx
            .send(OrchestratorEvent::ClientConnected { connection_id });
        debug!(connection_id = connection_id, "Client connected");

        let (mut reader, mut writer) = conn.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

        // Single writer so responses and output events never interleave.
        let writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = writer.send(&message).await {
                    debug!(connection_id = connection_id, error = %e, "Connection write failed");
                    break;
                }
            }
        });

        let mut subscription: Option<ListenerId> = None;

        loop {
            let read = tokio::select! {
                _ = context.shutdown_token.cancelled() => break,
                read = reader.read_request() => read,
            };

            let envelope = match read {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(IpcError::Malformed(e)) => {
                    debug!(connection_id = connection_id, error = %e, "Malformed request");
                    let _ = out_tx.send(ServerMessage::Response {
                        id: 0,
                        response: Response::failure(ErrorCode::InvalidRequest, e.to_string()),
                    });
                    continue;
                }
                Err(e) => {
                    debug!(connection_id = connection_id, error = %e, "Connection read failed");
                    break;
                }
            };

            let response = match envelope.request {
                Request::Subscribe => match &subscription {
                    Some(listener_id) => Response::Subscribed {
                        listener_id: listener_id.clone(),
                    },
                    None => {
                        let listener_id = Self::forward_output(&context.manager, out_tx.clone()).await;
                        subscription = Some(listener_id.clone());
                        Response::Subscribed { listener_id }
                    }
                },
                Request::Unsubscribe => {
                    if let Some(listener_id) = subscription.take() {
                        context.manager.unregister(&listener_id).await;
                    }
                    Response::ok()
                }
                Request::Shutdown => {
                    info!(connection_id = connection_id, "Shutdown requested by client");
                    let _ = context.event_tx.send(OrchestratorEvent::ShutdownRequested);
                    context.shutdown_requested.cancel();
                    Response::ShuttingDown
                }
                request => context.router.handle(request).await,
            };

            if out_tx
                .send(ServerMessage::Response {
                    id: envelope.id,
                    response,
                })
                .is_err()
            {
                break;
            }
        }

        if let Some(listener_id) = subscription.take() {
            context.manager.unregister(&listener_id).await;
        }
        drop(out_tx);
        let _ = writer_task.await;

        context.connections.fetch_sub(1, Ordering::SeqCst);
        let _ = context
            .event_tx
            .send(OrchestratorEvent::ClientDisconnected { connection_id });
        debug!(connection_id = connection_id, "Client disconnected");
    }

    /// Registers a listener and forwards its chunks as output events.
    async fn forward_output(
        manager: &SessionManager,
        out_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> ListenerId {
        let (listener_id, mut rx) = manager.register().await;

        // Ends once the listener is unregistered and drained.
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let event = ServerMessage::Output(OutputEvent {
                    session_id: chunk.session_id,
                    data: chunk.data,
                });
                if out_tx.send(event).is_err() {
                    break;
                }
            }
        });

        listener_id
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        self.session_manager.shutdown();

        self.tracker.close();
        if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for connections to close");
        }

        self.remove_socket_file();

        if self.manage_pid_file {
            pidfile::remove_pid_file();
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn remove_socket_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove socket file");
            }
        }
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Cancelled when a client asks the daemon to exit.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_requested.clone()
    }
}
