//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! Requests are tagged with increasing ids and may be in flight concurrently.
//! A background task reads every line the daemon sends: responses complete
//! the pending request with the same id, output events go to the channel
//! returned by [`IpcClient::take_events`].

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::{
    ErrorCode, LineCodec, OpResult, OutputEvent, Request, RequestEnvelope, Response,
    ServerMessage, SessionSummary,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::server::{read_line, IpcError};
use crate::config::MAX_ENV_TIMEOUT_SECS;
use crate::session::{SessionControl, SessionError, SessionId, StartOptions};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Lower bound on how long a start request may take. The daemon resolves the
/// login environment before spawning, which alone may take up to
/// [`MAX_ENV_TIMEOUT_SECS`].
const START_TIMEOUT: Duration = Duration::from_secs(MAX_ENV_TIMEOUT_SECS + 30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<OutputEvent>>>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
    codec: LineCodec,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the daemon with a custom timeout for connecting and for
    /// every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })??;

        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let codec = LineCodec::new();
        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            read_half,
            codec,
            Arc::clone(&pending),
            events_tx,
        ));

        Self {
            writer: Mutex::new(write_half),
            pending,
            events: std::sync::Mutex::new(Some(events_rx)),
            next_id: AtomicU64::new(1),
            reader_task,
            codec,
            timeout,
        }
    }

    /// Takes the receiver for pushed output events.
    ///
    /// Events only arrive after [`subscribe`](Self::subscribe). Returns `None`
    /// if the receiver was already taken.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<OutputEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Send a request to the daemon and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent, the connection closes
    /// first, or no response arrives within the timeout.
    pub async fn send(&self, request: Request) -> Result<Response, IpcError> {
        if self.reader_task.is_finished() {
            return Err(IpcError::ConnectionClosed);
        }

        let limit = self.timeout_for(&request);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = self.codec.encode(&RequestEnvelope::new(id, request))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(IpcError::Timeout(limit))
            }
        }
    }

    /// How long to wait for the answer to `request`.
    ///
    /// A start only answers once the shell is spawned, so giving up earlier
    /// would report a failure for a session the daemon goes on to create.
    fn timeout_for(&self, request: &Request) -> Duration {
        match request {
            Request::Start { .. } => self.timeout.max(START_TIMEOUT),
            _ => self.timeout,
        }
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), IpcError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_op(&self, request: Request) -> Result<OpResult, IpcError> {
        match self.send(request).await? {
            Response::Result(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Send a ping request to check if the daemon is responsive.
    ///
    /// Returns the daemon's protocol version.
    pub async fn ping(&self) -> Result<u8, IpcError> {
        match self.send(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Start a session.
    pub async fn start_session(
        &self,
        session_id: &str,
        options: StartOptions,
    ) -> Result<OpResult, IpcError> {
        self.send_op(Request::Start {
            session_id: session_id.to_string(),
            working_directory: options.working_directory,
            initial_input: options.initial_input,
        })
        .await
    }

    /// Forward input to a session.
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<OpResult, IpcError> {
        self.send_op(Request::write(session_id, data)).await
    }

    /// Resize a session.
    pub async fn resize_session(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<OpResult, IpcError> {
        self.send_op(Request::Resize {
            session_id: session_id.to_string(),
            cols,
            rows,
        })
        .await
    }

    /// Stop a session.
    pub async fn stop_session(&self, session_id: &str) -> Result<OpResult, IpcError> {
        self.send_op(Request::Stop {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// List all live sessions.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.send(Request::ListSessions).await? {
            Response::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Start receiving output events on this connection.
    ///
    /// Returns the listener id the daemon registered.
    pub async fn subscribe(&self) -> Result<String, IpcError> {
        match self.send(Request::Subscribe).await? {
            Response::Subscribed { listener_id } => Ok(listener_id),
            other => Err(unexpected(other)),
        }
    }

    /// Stop receiving output events.
    pub async fn unsubscribe(&self) -> Result<OpResult, IpcError> {
        self.send_op(Request::Unsubscribe).await
    }

    /// Request the daemon to stop.
    pub async fn shutdown(&self) -> Result<(), IpcError> {
        match self.send(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn unexpected(response: Response) -> IpcError {
    IpcError::UnexpectedResponse(format!("{response:?}"))
}

/// Routes everything the daemon sends until the connection closes.
async fn read_loop(
    read_half: OwnedReadHalf,
    codec: LineCodec,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<OutputEvent>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        let line = match read_line(&mut reader, codec.max_line_size()).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "IPC read failed");
                break;
            }
        };

        let message: ServerMessage = match codec.decode(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable message from daemon");
                continue;
            }
        };

        match message {
            ServerMessage::Response { id, response } => {
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::warn!(id = id, response = ?response, "Response for unknown request"),
                }
            }
            ServerMessage::Output(event) => {
                let _ = events_tx.send(event);
            }
        }
    }

    // Dropping the senders fails every request still waiting.
    pending.lock().await.clear();
}

/// Maps a failed result onto the session error it describes.
fn into_session_result(session_id: &str, result: OpResult) -> Result<(), SessionError> {
    if result.success {
        return Ok(());
    }

    let message = result.error.unwrap_or_else(|| "unknown error".to_string());
    Err(match result.code {
        Some(ErrorCode::NotRunning) => SessionError::NotRunning(session_id.to_string()),
        Some(ErrorCode::SpawnFailed) => SessionError::SpawnFailed(message),
        _ => SessionError::Rejected(message),
    })
}

fn transport(e: IpcError) -> SessionError {
    SessionError::Transport(e.to_string())
}

impl SessionControl for IpcClient {
    async fn start(
        &self,
        session_id: &SessionId,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        let result = self
            .start_session(session_id, options)
            .await
            .map_err(transport)?;
        into_session_result(session_id, result)
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let result = self.send_input(session_id, data).await.map_err(transport)?;
        into_session_result(session_id, result)
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        let result = self
            .resize_session(session_id, cols, rows)
            .await
            .map_err(transport)?;
        into_session_result(session_id, result)
    }

    async fn stop(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let result = self.stop_session(session_id).await.map_err(transport)?;
        into_session_result(session_id, result)
    }
}
