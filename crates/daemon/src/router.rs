//! Request router for dispatching session requests to the session manager.
//!
//! The router turns protocol [`Request`]s into session manager calls and
//! folds every outcome, including failures, into a [`Response`]. Requests
//! that concern the connection itself (subscribe, unsubscribe, shutdown) are
//! handled by the orchestrator before they get here.

use std::sync::Arc;

use protocol::{ErrorCode, Request, Response, PROTOCOL_VERSION};
use tracing::{debug, warn};

use crate::session::{SessionError, SessionManager, StartOptions};

/// Result type for router operations.
pub type RouterResult = Result<Response, RouterError>;

/// Errors that can occur during request routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request is not handled by the router.
    #[error("unsupported request: {0}")]
    Unsupported(&'static str),
}

impl RouterError {
    /// Machine-readable classification of the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::Session(e) => match e {
                SessionError::NotRunning(_) => ErrorCode::NotRunning,
                SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
                SessionError::InvalidSessionId(_) | SessionError::InvalidSize { .. } => {
                    ErrorCode::InvalidRequest
                }
                SessionError::LimitReached(_) => ErrorCode::LimitReached,
                SessionError::ResizeFailed(_)
                | SessionError::KillFailed(_)
                | SessionError::Transport(_)
                | SessionError::Rejected(_)
                | SessionError::Io(_) => ErrorCode::Internal,
            },
            RouterError::Unsupported(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Convert the error to a failed result response.
    pub fn to_response(&self) -> Response {
        Response::failure(self.code(), self.to_string())
    }
}

/// Dispatches session requests to a [`SessionManager`].
pub struct RequestRouter {
    manager: Arc<SessionManager>,
}

impl RequestRouter {
    /// Create a router over the given manager.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Routes a request and always produces a response.
    pub async fn handle(&self, request: Request) -> Response {
        self.route(request).await.unwrap_or_else(|e| {
            match &e {
                RouterError::Session(SessionError::NotRunning(_)) => debug!(error = %e, "Request failed"),
                _ => warn!(error = %e, "Request failed"),
            }
            e.to_response()
        })
    }

    /// Routes a request to the session manager.
    pub async fn route(&self, request: Request) -> RouterResult {
        match request {
            Request::Ping => Ok(Response::Pong {
                version: PROTOCOL_VERSION,
            }),
            Request::Start {
                session_id,
                working_directory,
                initial_input,
            } => {
                let options = StartOptions {
                    working_directory,
                    initial_input,
                };
                self.manager.start(&session_id, options).await?;
                Ok(Response::ok())
            }
            Request::Write { session_id, data } => {
                self.manager.write(&session_id, &data)?;
                Ok(Response::ok())
            }
            Request::Resize {
                session_id,
                cols,
                rows,
            } => {
                self.manager.resize(&session_id, cols, rows)?;
                Ok(Response::ok())
            }
            Request::Stop { session_id } => {
                self.manager.stop(&session_id);
                Ok(Response::ok())
            }
            Request::ListSessions => Ok(Response::Sessions {
                sessions: self.manager.list(),
            }),
            Request::Subscribe => Err(RouterError::Unsupported("subscribe")),
            Request::Unsubscribe => Err(RouterError::Unsupported("unsubscribe")),
            Request::Shutdown => Err(RouterError::Unsupported("shutdown")),
        }
    }
}
