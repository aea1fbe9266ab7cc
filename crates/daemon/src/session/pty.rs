//! PTY session management.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A session represents a single terminal session with a shell process,
//! identified by a caller-chosen id.
//!
//! Spawning goes through the [`PtySystem`] capability so the manager can be
//! exercised against something other than real pseudo-terminals; the
//! production implementation is [`NativePtySystem`], backed by `portable-pty`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionState, SessionSummary};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use protocol::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No live session exists under the id.
    #[error("{0} not running")]
    NotRunning(SessionId),

    /// The session id is empty or otherwise unusable.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Terminal dimensions must be positive.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// The manager already holds the maximum number of sessions.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// A remote session manager could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote session manager refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Spawned, I/O threads not yet wired to listeners.
    Starting,
    /// Session is running.
    Running,
    /// The shell exited on its own with a code.
    Exited(u32),
    /// Session was stopped or replaced.
    Killed,
}

impl SessionStatus {
    /// Wire representation of the status.
    pub fn state(self) -> SessionState {
        match self {
            SessionStatus::Starting => SessionState::Starting,
            SessionStatus::Running => SessionState::Running,
            SessionStatus::Exited(_) => SessionState::Exited,
            SessionStatus::Killed => SessionState::Killed,
        }
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Everything needed to launch a shell on a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Shell executable.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Complete environment; the child inherits nothing else.
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Control half of a spawned pseudo-terminal process.
pub trait PtyProcess: Send + Sync {
    /// Process id of the child, if known.
    fn pid(&self) -> Option<u32>;

    /// Propagate new dimensions to the terminal.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Terminate the child and everything in its process group.
    fn kill(&self) -> Result<(), SessionError>;
}

/// Blocks until the child exits and returns its exit code.
pub type ExitWaiter = Box<dyn FnOnce() -> Option<u32> + Send>;

/// A freshly spawned process with its I/O streams.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub wait: ExitWaiter,
}

/// Capability to spawn processes attached to pseudo-terminals.
pub trait PtySystem: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, SessionError>;
}

/// [`PtySystem`] backed by the platform's native pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySystem;

impl PtySystem for NativePtySystem {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| SessionError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {e}", request.shell)))?;

        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let mut child = child;
        let wait: ExitWaiter = Box::new(move || match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reap PTY child");
                None
            }
        });

        Ok(SpawnedPty {
            process: Box::new(NativePtyProcess {
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                pid,
            }),
            reader,
            writer,
            wait,
        })
    }
}

struct NativePtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyProcess for NativePtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SessionError::ResizeFailed("PTY master lock poisoned".to_string()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn kill(&self) -> Result<(), SessionError> {
        if let Some(result) = self.pid.and_then(signal_kill) {
            return result;
        }

        let mut killer = self
            .killer
            .lock()
            .map_err(|_| SessionError::KillFailed("child killer lock poisoned".to_string()))?;
        killer
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))
    }
}

/// Sends SIGKILL to the shell's process group.
///
/// `portable-pty` starts the shell in a new session, so its pid is also its
/// group id. A group that is already gone counts as killed.
#[cfg(unix)]
fn signal_kill(pid: u32) -> Option<Result<(), SessionError>> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(i32::try_from(pid).ok()?);
    let result = match killpg(pid, Signal::SIGKILL) {
        Err(Errno::ESRCH) => kill(pid, Signal::SIGKILL),
        other => other,
    };
    Some(match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::KillFailed(e.to_string())),
    })
}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) -> Option<Result<(), SessionError>> {
    None
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the current Unix timestamp in seconds.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Channels and waiters handed to whoever drives a session's lifecycle.
pub struct SessionIo {
    /// Output chunks in the order the process produced them. Closes on EOF.
    pub output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Reaps the child once output is drained.
    pub wait: ExitWaiter,
}

/// A PTY session with a shell process.
///
/// The session owns the process handle and the input queue. Output is read
/// on a dedicated thread and handed out through [`SessionIo`].
pub struct Session {
    /// Caller-chosen identifier.
    id: SessionId,

    /// Distinguishes successive sessions that reuse the same id.
    instance: u64,

    /// Working directory at spawn time.
    cwd: PathBuf,

    /// Unix timestamp when the session was spawned.
    started_at: u64,

    /// Current terminal size (cols, rows).
    size: Mutex<(u16, u16)>,

    status: Mutex<SessionStatus>,

    process: Box<dyn PtyProcess>,

    /// Input queue drained by the writer thread.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Flag indicating if the session is still running.
    running: Arc<AtomicBool>,

    /// Cancelled when the session is stopped or replaced rather than exiting.
    stopped: CancellationToken,
}

impl Session {
    /// Wraps a spawned process and starts its reader and writer threads.
    pub fn start(
        id: SessionId,
        instance: u64,
        request: &SpawnRequest,
        spawned: SpawnedPty,
    ) -> Result<(Self, SessionIo), SessionError> {
        let SpawnedPty {
            process,
            reader,
            writer,
            wait,
        } = spawned;

        let running = Arc::new(AtomicBool::new(true));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        spawn_writer_thread(&id, writer, input_rx, Arc::clone(&running))?;
        spawn_reader_thread(&id, reader, output_tx)?;

        let session = Session {
            id,
            instance,
            cwd: request.cwd.clone(),
            started_at: now_secs(),
            size: Mutex::new((request.cols, request.rows)),
            status: Mutex::new(SessionStatus::Starting),
            process,
            input_tx,
            running,
            stopped: CancellationToken::new(),
        };

        Ok((session, SessionIo { output_rx, wait }))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the instance number assigned by the manager.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Returns the working directory the shell was spawned in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|size| *size).unwrap_or((0, 0))
    }

    /// Returns the current status.
    pub fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(SessionStatus::Killed)
    }

    /// Returns whether the session is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns whether the session ended through stop or replacement.
    pub fn was_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Token cancelled once the session is stopped or replaced.
    ///
    /// Processes that outlive the shell can keep the terminal open; whoever
    /// drains the output must stop forwarding once this fires.
    pub fn stop_token(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Marks a freshly started session as running.
    pub fn mark_running(&self) {
        self.set_status(SessionStatus::Running);
    }

    /// Queues input for the shell.
    ///
    /// Returns as soon as the bytes are queued; the writer thread applies
    /// queued writes in order.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning(self.id.clone()));
        }

        self.input_tx
            .send(data.to_vec())
            .map_err(|_| SessionError::NotRunning(self.id.clone()))
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning(self.id.clone()));
        }

        self.process.resize(cols, rows)?;
        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Kills the shell. Exit handling will not report this as unexpected.
    ///
    /// Killing a session that already exited is a no-op.
    pub fn terminate(&self) -> Result<(), SessionError> {
        self.stopped.cancel();

        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.set_status(SessionStatus::Killed);
        let result = self.process.kill();

        tracing::info!(
            session_id = %self.id,
            instance = self.instance,
            pid = ?self.process.pid(),
            "Session killed"
        );

        result
    }

    /// Records that the process has been reaped.
    pub fn mark_exited(&self, code: Option<u32>) {
        self.running.store(false, Ordering::SeqCst);
        if !self.was_stopped() {
            self.set_status(SessionStatus::Exited(code.unwrap_or(0)));
        }
    }

    /// Snapshot for listing over the wire.
    pub fn summary(&self) -> SessionSummary {
        let (cols, rows) = self.size();
        SessionSummary {
            session_id: self.id.clone(),
            pid: self.pid(),
            working_directory: self.cwd.clone(),
            cols,
            rows,
            state: self.status().state(),
            started_at: self.started_at,
        }
    }

    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }
}

/// Reads PTY output on a dedicated thread until EOF or error.
fn spawn_reader_thread(
    session_id: &SessionId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), SessionError> {
    let session_id = session_id.clone();
    std::thread::Builder::new()
        .name(format!("pty-reader-{session_id}"))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        if output_tx.send(buffer[..n].to_vec()).is_err() {
                            tracing::trace!(session_id = %session_id, "Output pump gone");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side has closed.
                        tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Drains the input queue into the PTY on a dedicated thread.
fn spawn_writer_thread(
    session_id: &SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> Result<(), SessionError> {
    let session_id = session_id.clone();
    std::thread::Builder::new()
        .name(format!("pty-writer-{session_id}"))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                let result = writer.write_all(&data).and_then(|()| writer.flush());
                if let Err(e) = result {
                    if running.load(Ordering::SeqCst) {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to write to PTY");
                    }
                    break;
                }
            }
        })?;
    Ok(())
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
