//! Message definitions for the termhost wire protocol.
//!
//! UI clients send [`RequestEnvelope`]s; the daemon answers each one with a
//! [`ServerMessage::Response`] carrying the same id, and pushes
//! [`ServerMessage::Output`] events to connections that subscribed.
//! Byte payloads travel as base64 strings so that partial UTF-8 sequences
//! split across PTY reads survive intact.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Caller-chosen identifier of a terminal session.
pub type SessionId = String;

/// A request tagged with a caller-assigned id.
///
/// The id is echoed back in the matching response so clients can keep
/// several requests in flight on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Request id, unique per connection.
    pub id: u64,
    /// The request itself.
    pub request: Request,
}

impl RequestEnvelope {
    /// Wrap a request with the given id.
    pub fn new(id: u64, request: Request) -> Self {
        Self { id, request }
    }
}

/// Requests a UI client can send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Start (or restart) a session under a caller-chosen id.
    Start {
        session_id: SessionId,
        /// Working directory; the daemon's own cwd when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
        /// Input written to the session shortly after it spawns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_input: Option<String>,
    },
    /// Forward input bytes to a session.
    Write {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Change a session's terminal dimensions.
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    /// Terminate a session.
    Stop { session_id: SessionId },
    /// List live sessions.
    ListSessions,
    /// Start receiving output events on this connection.
    Subscribe,
    /// Stop receiving output events on this connection.
    Unsubscribe,
    /// Ask the daemon to exit.
    Shutdown,
}

impl Request {
    /// Build a write request from raw bytes.
    pub fn write(session_id: impl Into<SessionId>, data: impl Into<Vec<u8>>) -> Self {
        Request::Write {
            session_id: session_id.into(),
            data: data.into(),
        }
    }
}

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No live session under the requested id.
    NotRunning,
    /// The shell could not be launched.
    SpawnFailed,
    /// Malformed request or parameters.
    InvalidRequest,
    /// The session limit was reached.
    LimitReached,
    /// Daemon-side failure.
    Internal,
}

/// The `{success}` / `{success: false, error}` result shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl OpResult {
    /// A successful result.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            code: None,
        }
    }

    /// A failed result with a human-readable reason.
    pub fn failure(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            code: Some(code),
        }
    }

    /// Whether the failure means the target session is not running.
    pub fn is_not_running(&self) -> bool {
        !self.success && self.code == Some(ErrorCode::NotRunning)
    }
}

/// Responses the daemon sends back for requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// Outcome of start, write, resize and stop.
    Result(OpResult),
    /// Answer to ping.
    Pong { version: u8 },
    /// Snapshot of live sessions.
    Sessions { sessions: Vec<SessionSummary> },
    /// This connection now receives output events.
    Subscribed { listener_id: String },
    /// The daemon acknowledged a shutdown request.
    ShuttingDown,
}

impl Response {
    /// Shorthand for a successful result.
    pub fn ok() -> Self {
        Response::Result(OpResult::ok())
    }

    /// Shorthand for a failed result.
    pub fn failure(code: ErrorCode, error: impl Into<String>) -> Self {
        Response::Result(OpResult::failure(code, error))
    }
}

/// Lifecycle state of a session as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
    Killed,
}

/// Information about a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub pid: Option<u32>,
    pub working_directory: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    /// Unix timestamp (seconds) when the session was spawned.
    pub started_at: u64,
}

/// A chunk of session output pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub session_id: SessionId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Everything the daemon writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to the request with the same id.
    Response { id: u64, response: Response },
    /// Pushed output event.
    Output(OutputEvent),
}

/// Serde adapter encoding byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
