//! Restart-on-write policy for UI callers.
//!
//! The session manager never restarts a dead session by itself. A UI that
//! wants a terminal to come back when the user types into it wraps its writes
//! in [`write_with_restart`]: when the write fails because the session is not
//! running, the user is told, the session is started again under the same id
//! and the write is retried.

use std::path::PathBuf;

use crate::session::{SessionControl, SessionError, SessionId, StartOptions};

/// Shown to the user before a dead session is restarted.
pub const RECONNECT_NOTICE: &str = "\r\n[Reconnecting terminal...]\r\n";

/// How a write ended up being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The session was live and took the input.
    Delivered,
    /// The session had to be restarted first.
    Restarted,
}

/// Parameters for restarting a session on write.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts attempted per write before giving up.
    pub max_restarts: u32,
    /// Working directory for restarted sessions.
    pub working_directory: Option<PathBuf>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 1,
            working_directory: None,
        }
    }
}

/// Writes `data`, restarting the session if it is not running.
///
/// `notify` receives [`RECONNECT_NOTICE`] once per restart so the caller can
/// show it. Errors other than *not running* are returned as-is, as is the
/// last *not running* error once the restart budget is spent.
pub async fn write_with_restart<C, F>(
    control: &C,
    session_id: &SessionId,
    data: &[u8],
    policy: &RestartPolicy,
    mut notify: F,
) -> Result<WriteOutcome, SessionError>
where
    C: SessionControl,
    F: FnMut(&str),
{
    let mut restarts = 0;

    loop {
        match control.write(session_id, data).await {
            Ok(()) if restarts == 0 => return Ok(WriteOutcome::Delivered),
            Ok(()) => return Ok(WriteOutcome::Restarted),
            Err(SessionError::NotRunning(_)) if restarts < policy.max_restarts => {
                restarts += 1;
                tracing::info!(session_id = %session_id, attempt = restarts, "Restarting session on write");
                notify(RECONNECT_NOTICE);

                let options = StartOptions {
                    working_directory: policy.working_directory.clone(),
                    initial_input: None,
                };
                control.start(session_id, options).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
