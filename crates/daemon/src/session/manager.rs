//! Session manager for named PTY sessions.
//!
//! The manager owns the map from caller-chosen ids to live sessions. It
//! routes input and control requests by id, pumps every session's output into
//! the shared [`OutputBroadcaster`], and reports sessions that die on their
//! own. It never restarts anything by itself; see [`crate::reconnect`] for the
//! caller-side policy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use protocol::SessionSummary;
use tokio::sync::mpsc;

use super::env::{EnvResolver, DEFAULT_PATH_DIRS};
use super::multiplexer::{ListenerId, OutputBroadcaster, OutputChunk};
use super::pty::{
    detect_shell, NativePtySystem, PtySystem, Session, SessionError, SessionId, SessionIo,
    SpawnRequest,
};

/// Session control operations shared by the in-process manager and remote
/// clients.
#[allow(async_fn_in_trait)]
pub trait SessionControl: Send + Sync {
    /// Starts a session, replacing any live session with the same id.
    async fn start(&self, session_id: &SessionId, options: StartOptions)
        -> Result<(), SessionError>;

    /// Queues input for a live session.
    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session. Missing sessions are ignored.
    async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16)
        -> Result<(), SessionError>;

    /// Stops a session if it exists.
    async fn stop(&self, session_id: &SessionId) -> Result<(), SessionError>;
}

/// Optional parameters for [`SessionControl::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Directory the shell starts in; the daemon's cwd when absent.
    pub working_directory: Option<PathBuf>,
    /// Written to the session once it has had time to start.
    pub initial_input: Option<String>,
}

/// Knobs that shape every session the manager spawns.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: String,
    /// Value of `TERM` in the session environment.
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub max_sessions: usize,
    pub resolve_login_env: bool,
    /// Limit on login environment resolution; zero disables it.
    pub env_timeout: Duration,
    /// Directories guaranteed to be on `PATH`.
    pub path_dirs: Vec<String>,
    pub initial_input_delay: Duration,
    /// Append a notice to the output when a shell exits on its own.
    pub exit_notice: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: detect_shell(None),
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            max_sessions: 64,
            resolve_login_env: true,
            env_timeout: Duration::from_secs(5),
            path_dirs: DEFAULT_PATH_DIRS.iter().map(|d| d.to_string()).collect(),
            initial_input_delay: Duration::from_millis(500),
            exit_notice: true,
        }
    }
}

/// Text appended to a session's output when its shell exits on its own.
pub fn exit_notice(code: Option<u32>) -> String {
    match code {
        Some(code) => format!("\r\nTerminal session ended (code {code})\r\n"),
        None => "\r\nTerminal session ended (code unknown)\r\n".to_string(),
    }
}

/// Ids with a start in flight, and how many starts each has.
type PendingStarts = Arc<Mutex<HashMap<SessionId, usize>>>;

/// Thread-safe session manager using DashMap.
pub struct SessionManager {
    /// Map of session ID to the live session under it.
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    /// Starts that hold a slot against `max_sessions` but are not in the map yet.
    pending: PendingStarts,
    broadcaster: OutputBroadcaster,
    pty_system: Arc<dyn PtySystem>,
    env: EnvResolver,
    settings: SessionSettings,
    next_instance: AtomicU64,
}

impl SessionManager {
    /// Creates a manager that spawns native pseudo-terminals.
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_pty_system(settings, Arc::new(NativePtySystem))
    }

    /// Creates a manager with a custom spawning capability.
    pub fn with_pty_system(settings: SessionSettings, pty_system: Arc<dyn PtySystem>) -> Self {
        let mut env = EnvResolver::new(
            settings.shell.clone(),
            settings.env_timeout,
            settings.path_dirs.clone(),
        );
        if !settings.resolve_login_env {
            env = env.without_login_env();
        }

        Self {
            sessions: Arc::new(DashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            broadcaster: OutputBroadcaster::new(),
            pty_system,
            env,
            settings,
            next_instance: AtomicU64::new(0),
        }
    }

    /// Returns the settings sessions are spawned with.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Registers an output listener. It receives every chunk of every session.
    pub async fn register(&self) -> (ListenerId, mpsc::UnboundedReceiver<OutputChunk>) {
        self.broadcaster.register().await
    }

    /// Stops delivery to a listener.
    pub async fn unregister(&self, listener_id: &str) {
        self.broadcaster.unregister(listener_id).await;
    }

    /// Starts a session under `session_id`.
    ///
    /// A live session with the same id is killed first; it emits no exit
    /// notice. Returns once the process handle exists.
    pub async fn start(
        &self,
        session_id: &SessionId,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        if session_id.is_empty() {
            return Err(SessionError::InvalidSessionId(session_id.clone()));
        }

        if let Some((_, previous)) = self.sessions.remove(session_id) {
            retire(&previous, "replaced");
        }

        // Held until the session is in the map or the start has failed.
        let _slot = self.reserve_slot(session_id)?;

        let cwd = match options.working_directory {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory {} does not exist",
                cwd.display()
            )));
        }

        let mut env = self.env.resolve().await;
        env.insert("TERM".to_string(), self.settings.term.clone());

        let request = SpawnRequest {
            shell: self.settings.shell.clone(),
            args: Vec::new(),
            cwd,
            env: env.into_iter().collect(),
            cols: self.settings.cols,
            rows: self.settings.rows,
        };

        let spawned = self.pty_system.spawn(&request)?;
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let (session, io) = Session::start(session_id.clone(), instance, &request, spawned)?;
        let session = Arc::new(session);

        // A concurrent start for the same id may have landed in between.
        if let Some(replaced) = self.sessions.insert(session_id.clone(), Arc::clone(&session)) {
            retire(&replaced, "replaced");
        }
        session.mark_running();

        tracing::info!(
            session_id = %session_id,
            instance = instance,
            pid = ?session.pid(),
            cwd = %request.cwd.display(),
            cols = request.cols,
            rows = request.rows,
            "Started session"
        );

        self.spawn_pump(Arc::clone(&session), io);

        if let Some(input) = options.initial_input {
            self.schedule_initial_input(session_id.clone(), instance, input);
        }

        Ok(())
    }

    /// Queues `data` for the session's shell.
    pub fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        self.lookup(session_id)
            .ok_or_else(|| SessionError::NotRunning(session_id.clone()))?
            .write(data)
    }

    /// Resizes a live session. Unknown or exited sessions are a no-op.
    pub fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }

        let Some(session) = self.lookup(session_id) else {
            tracing::debug!(session_id = %session_id, "Resize for unknown session ignored");
            return Ok(());
        };

        match session.resize(cols, rows) {
            Err(SessionError::NotRunning(_)) => Ok(()),
            other => other,
        }
    }

    /// Removes and kills a session. Always succeeds.
    pub fn stop(&self, session_id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            retire(&session, "stopped");
        }
    }

    /// Stops every session.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.stop(id);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Stopped all sessions");
        }
    }

    /// Lists live sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions.iter().map(|e| e.value().summary()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Gets information about a specific session.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionSummary> {
        self.lookup(session_id).map(|s| s.summary())
    }

    /// Checks if a session exists and is running.
    pub fn exists(&self, session_id: &SessionId) -> bool {
        self.lookup(session_id).is_some_and(|s| s.is_running())
    }

    /// Returns the number of sessions in the map.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Claims a slot for `session_id` against the session limit.
    ///
    /// Live sessions and in-flight starts are counted together, one slot per
    /// distinct id, so concurrent starts cannot overshoot the limit while they
    /// wait on the environment.
    fn reserve_slot(&self, session_id: &SessionId) -> Result<SlotReservation, SessionError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let known = self.sessions.contains_key(session_id) || pending.contains_key(session_id);
        if !known {
            let in_flight = pending
                .keys()
                .filter(|id| !self.sessions.contains_key(*id))
                .count();
            let max_sessions = self.settings.max_sessions;
            if self.sessions.len() + in_flight >= max_sessions {
                return Err(SessionError::LimitReached(max_sessions));
            }
        }

        *pending.entry(session_id.clone()).or_insert(0) += 1;
        Ok(SlotReservation {
            pending: Arc::clone(&self.pending),
            session_id: session_id.clone(),
        })
    }

    fn lookup(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Forwards output to the broadcaster, then handles the exit.
    fn spawn_pump(&self, session: Arc<Session>, io: SessionIo) {
        let sessions = Arc::clone(&self.sessions);
        let broadcaster = self.broadcaster.clone();
        let exit_notice_enabled = self.settings.exit_notice;

        tokio::spawn(async move {
            let SessionIo {
                mut output_rx,
                wait,
            } = io;
            let session_id = session.id().clone();
            let stopped = session.stop_token();

            loop {
                let data = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    data = output_rx.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                broadcaster.broadcast(&session_id, data).await;
            }
            // Leftover children may still hold the terminal; their output goes nowhere.
            drop(output_rx);

            let code = match tokio::task::spawn_blocking(wait).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Exit waiter failed");
                    None
                }
            };

            let unexpected = !session.was_stopped();
            session.mark_exited(code);

            if unexpected {
                tracing::info!(session_id = %session_id, code = ?code, "Session exited");
                if exit_notice_enabled {
                    broadcaster
                        .broadcast(&session_id, exit_notice(code).into_bytes())
                        .await;
                }
            }

            let instance = session.instance();
            if sessions
                .remove_if(&session_id, |_, current| current.instance() == instance)
                .is_some()
            {
                tracing::debug!(session_id = %session_id, instance = instance, "Removed exited session");
            }
        });
    }

    fn schedule_initial_input(&self, session_id: SessionId, instance: u64, input: String) {
        let sessions = Arc::clone(&self.sessions);
        let delay = self.settings.initial_input_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let session = sessions
                .get(&session_id)
                .map(|entry| Arc::clone(entry.value()))
                .filter(|s| s.instance() == instance);

            match session {
                Some(session) => {
                    if let Err(e) = session.write(input.as_bytes()) {
                        tracing::debug!(session_id = %session_id, error = %e, "Initial input not delivered");
                    }
                }
                None => {
                    tracing::debug!(session_id = %session_id, "Session gone before initial input");
                }
            }
        });
    }
}

/// Slot held by a start that has not reached the session map yet.
struct SlotReservation {
    pending: PendingStarts,
    session_id: SessionId,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pending.get_mut(&self.session_id) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&self.session_id);
            }
        }
    }
}

/// Kills a session that has left the map.
fn retire(session: &Session, reason: &str) {
    if let Err(e) = session.terminate() {
        tracing::debug!(
            session_id = %session.id(),
            instance = session.instance(),
            error = %e,
            "Ignoring kill failure for {reason} session"
        );
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl SessionControl for SessionManager {
    async fn start(
        &self,
        session_id: &SessionId,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        SessionManager::start(self, session_id, options).await
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        SessionManager::write(self, session_id, data)
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        SessionManager::resize(self, session_id, cols, rows)
    }

    async fn stop(&self, session_id: &SessionId) -> Result<(), SessionError> {
        SessionManager::stop(self, session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::{PtyProcess, SpawnedPty};
    use protocol::SessionState;
    use tokio::time::timeout;

    fn test_settings() -> SessionSettings {
        SessionSettings {
            shell: "/bin/sh".to_string(),
            resolve_login_env: false,
            initial_input_delay: Duration::from_millis(50),
            ..SessionSettings::default()
        }
    }

    fn sid(id: &str) -> SessionId {
        id.to_string()
    }

    /// Collects output for one session until `needle` shows up or time runs out.
    async fn output_until(
        rx: &mut mpsc::UnboundedReceiver<OutputChunk>,
        session_id: &str,
        needle: &str,
    ) -> String {
        let mut output = Vec::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(chunk) = rx.recv().await {
                if chunk.session_id == session_id {
                    output.extend_from_slice(&chunk.data);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
            }
        })
        .await;
        String::from_utf8_lossy(&output).into_owned()
    }

    async fn wait_until_gone(manager: &SessionManager, session_id: &SessionId) -> bool {
        for _ in 0..100 {
            if manager.get(session_id).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(unix)]
    async fn wait_for_pid_exit(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        for _ in 0..100 {
            if kill(Pid::from_raw(pid as i32), None).is_err() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_exit_notice_text() {
        assert_eq!(
            exit_notice(Some(0)),
            "\r\nTerminal session ended (code 0)\r\n"
        );
        assert_eq!(
            exit_notice(None),
            "\r\nTerminal session ended (code unknown)\r\n"
        );
    }

    #[tokio::test]
    async fn test_manager_new() {
        let manager = SessionManager::new(test_settings());
        assert_eq!(manager.count(), 0);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_echo() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        assert!(manager.exists(&sid("t1")));
        assert_eq!(manager.count(), 1);

        manager.write(&sid("t1"), b"echo hi_from_t1\n").unwrap();
        let output = output_until(&mut rx, "t1", "hi_from_t1\r\n").await;
        assert!(output.contains("hi_from_t1"), "got: {output}");

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_start_rejects_empty_id() {
        let manager = SessionManager::new(test_settings());
        let result = manager.start(&sid(""), StartOptions::default()).await;
        assert!(matches!(result, Err(SessionError::InvalidSessionId(_))));
    }

    #[tokio::test]
    async fn test_start_missing_working_directory() {
        let manager = SessionManager::new(test_settings());
        let options = StartOptions {
            working_directory: Some(PathBuf::from("/nonexistent/termhost/dir")),
            initial_input: None,
        };
        let result = manager.start(&sid("t1"), options).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert!(!manager.exists(&sid("t1")));
    }

    #[tokio::test]
    async fn test_start_with_bad_shell() {
        let settings = SessionSettings {
            shell: "/nonexistent/shell".to_string(),
            ..test_settings()
        };
        let manager = SessionManager::new(settings);
        let result = manager.start(&sid("t1"), StartOptions::default()).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_working_directory_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        let options = StartOptions {
            working_directory: Some(cwd.clone()),
            initial_input: None,
        };
        manager.start(&sid("t1"), options).await.unwrap();
        assert_eq!(manager.get(&sid("t1")).unwrap().working_directory, cwd);

        manager.write(&sid("t1"), b"pwd\n").unwrap();
        let expected = cwd.to_string_lossy().into_owned();
        let output = output_until(&mut rx, "t1", &expected).await;
        assert!(output.contains(&expected), "got: {output}");

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_term_is_set() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.write(&sid("t1"), b"echo term=$TERM\n").unwrap();
        let output = output_until(&mut rx, "t1", "term=xterm-256color").await;
        assert!(output.contains("term=xterm-256color"), "got: {output}");

        manager.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_double_start_leaves_one_process() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        let first_pid = manager.get(&sid("t1")).unwrap().pid.unwrap();

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        let second_pid = manager.get(&sid("t1")).unwrap().pid.unwrap();

        assert_ne!(first_pid, second_pid);
        assert_eq!(manager.count(), 1);
        assert!(wait_for_pid_exit(first_pid).await, "first shell survived");

        // The replaced session's cleanup must not evict the new one.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.exists(&sid("t1")));

        manager.write(&sid("t1"), b"echo still_alive\n").unwrap();
        let output = output_until(&mut rx, "t1", "still_alive\r\n").await;
        assert!(output.contains("still_alive"));
        assert!(!output.contains("Terminal session ended"));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_write_to_missing_session() {
        let manager = SessionManager::new(test_settings());
        let err = manager.write(&sid("ghost"), b"ls\n").unwrap_err();
        assert!(matches!(err, SessionError::NotRunning(_)));
        assert_eq!(err.to_string(), "ghost not running");
    }

    #[tokio::test]
    async fn test_resize_missing_session_is_noop() {
        let manager = SessionManager::new(test_settings());
        assert!(manager.resize(&sid("ghost"), 100, 30).is_ok());
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let manager = SessionManager::new(test_settings());
        let result = manager.resize(&sid("ghost"), 0, 30);
        assert!(matches!(result, Err(SessionError::InvalidSize { .. })));
    }

    #[tokio::test]
    async fn test_resize_updates_size() {
        let manager = SessionManager::new(test_settings());
        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();

        manager.resize(&sid("t1"), 132, 43).unwrap();
        let info = manager.get(&sid("t1")).unwrap();
        assert_eq!((info.cols, info.rows), (132, 43));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_stop_then_restart() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.stop(&sid("t1"));
        assert!(!manager.exists(&sid("t1")));

        let result = manager.write(&sid("t1"), b"echo x\n");
        assert!(matches!(result, Err(SessionError::NotRunning(_))));

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.write(&sid("t1"), b"echo back_again\n").unwrap();
        let output = output_until(&mut rx, "t1", "back_again\r\n").await;
        assert!(output.contains("back_again"));
        assert!(!output.contains("Terminal session ended"));

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = SessionManager::new(test_settings());
        manager.stop(&sid("never-started"));

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.stop(&sid("t1"));
        manager.stop(&sid("t1"));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_exit_emits_notice_and_removes() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.write(&sid("t1"), b"exit 7\n").unwrap();

        let output = output_until(&mut rx, "t1", "Terminal session ended (code 7)").await;
        assert!(
            output.contains("\r\nTerminal session ended (code 7)\r\n"),
            "got: {output}"
        );

        assert!(wait_until_gone(&manager, &sid("t1")).await);
        let result = manager.write(&sid("t1"), b"echo x\n");
        assert!(matches!(result, Err(SessionError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_exit_notice_can_be_disabled() {
        let settings = SessionSettings {
            exit_notice: false,
            ..test_settings()
        };
        let manager = SessionManager::new(settings);
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.write(&sid("t1"), b"exit 0\n").unwrap();
        assert!(wait_until_gone(&manager, &sid("t1")).await);

        let output = output_until(&mut rx, "t1", "Terminal session ended").await;
        assert!(!output.contains("Terminal session ended"));
    }

    /// Lines printed between two markers, without terminal line endings.
    fn lines_between(output: &[u8], begin: &str, end: &str) -> Vec<String> {
        let text = String::from_utf8_lossy(output);
        let from = text.find(begin).map(|i| i + begin.len()).unwrap_or(0);
        let to = text[from..].find(end).map(|i| from + i).unwrap_or(text.len());
        text[from..to]
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_sessions_keep_their_own_order() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("left"), StartOptions::default()).await.unwrap();
        manager.start(&sid("right"), StartOptions::default()).await.unwrap();

        // Far more than one read's worth, so ordering spans many chunks.
        manager
            .write(&sid("left"), b"echo begin_$((1+1)); seq 1 20000; echo end_$((2+2))\n")
            .unwrap();
        manager
            .write(&sid("right"), b"echo begin_$((1+1)); seq 20001 40000; echo end_$((2+2))\n")
            .unwrap();

        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut left_chunks = 0;
        let _ = timeout(Duration::from_secs(20), async {
            while let Some(chunk) = rx.recv().await {
                match chunk.session_id.as_str() {
                    "left" => {
                        left_chunks += 1;
                        left.extend_from_slice(&chunk.data);
                    }
                    "right" => right.extend_from_slice(&chunk.data),
                    other => panic!("unexpected session {other}"),
                }
                if String::from_utf8_lossy(&left).contains("end_4")
                    && String::from_utf8_lossy(&right).contains("end_4")
                {
                    break;
                }
            }
        })
        .await;

        assert!(left_chunks > 1, "sequence fit in a single chunk");

        let expected_left: Vec<String> = (1..=20000).map(|i| i.to_string()).collect();
        let expected_right: Vec<String> = (20001..=40000).map(|i| i.to_string()).collect();
        assert!(
            lines_between(&left, "begin_2\r\n", "end_4") == expected_left,
            "left sequence garbled"
        );
        assert!(
            lines_between(&right, "begin_2\r\n", "end_4") == expected_right,
            "right sequence garbled"
        );

        manager.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stopped_session_output_stays_out_of_successor() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager
            .write(
                &sid("t1"),
                b"trap '' HUP; (sleep 1; echo leftover_$((40+2))) & echo armed_$((1+1))\n",
            )
            .unwrap();
        let output = output_until(&mut rx, "t1", "armed_2").await;
        assert!(output.contains("armed_2"), "got: {output}");

        manager.stop(&sid("t1"));
        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();

        // Outlives the background job of the stopped shell.
        manager
            .write(&sid("t1"), b"sleep 2; echo fresh_$((2+3))\n")
            .unwrap();
        let output = output_until(&mut rx, "t1", "fresh_5").await;
        assert!(output.contains("fresh_5"), "got: {output}");
        assert!(!output.contains("leftover_42"), "stopped session leaked: {output}");

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_session_limit() {
        let settings = SessionSettings {
            max_sessions: 1,
            ..test_settings()
        };
        let manager = SessionManager::new(settings);

        manager.start(&sid("a"), StartOptions::default()).await.unwrap();
        let result = manager.start(&sid("b"), StartOptions::default()).await;
        assert!(matches!(result, Err(SessionError::LimitReached(1))));

        // Replacing an existing id does not count against the limit.
        manager.start(&sid("a"), StartOptions::default()).await.unwrap();
        assert_eq!(manager.count(), 1);

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_initial_input() {
        let manager = SessionManager::new(test_settings());
        let (_listener, mut rx) = manager.register().await;

        let options = StartOptions {
            working_directory: None,
            initial_input: Some("echo initial_marker\n".to_string()),
        };
        manager.start(&sid("t1"), options).await.unwrap();

        let output = output_until(&mut rx, "t1", "initial_marker\r\n").await;
        assert!(output.contains("initial_marker"), "got: {output}");

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let manager = SessionManager::new(test_settings());
        manager.start(&sid("b"), StartOptions::default()).await.unwrap();
        manager.start(&sid("a"), StartOptions::default()).await.unwrap();

        let list = manager.list();
        let ids: Vec<&str> = list.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(list.iter().all(|s| s.state == SessionState::Running));
        assert!(list.iter().all(|s| (s.cols, s.rows) == (80, 24)));

        assert!(manager.get(&sid("a")).is_some());
        assert!(manager.get(&sid("zzz")).is_none());

        manager.shutdown();
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_listener_stops_receiving() {
        let manager = SessionManager::new(test_settings());
        let (listener, mut rx) = manager.register().await;
        manager.unregister(&listener).await;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        manager.write(&sid("t1"), b"echo x\n").unwrap();

        let next = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(next, Ok(None)));

        manager.shutdown();
    }

    /// Reader that blocks until the owning process handle is dropped.
    struct IdleReader(std::sync::mpsc::Receiver<Vec<u8>>);

    impl std::io::Read for IdleReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.recv() {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    /// A process that has already died; killing it fails.
    struct VanishedProcess {
        pid: u32,
        _output: std::sync::mpsc::Sender<Vec<u8>>,
    }

    impl PtyProcess for VanishedProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
            Ok(())
        }

        fn kill(&self) -> Result<(), SessionError> {
            Err(SessionError::KillFailed("no such process".to_string()))
        }
    }

    #[derive(Default)]
    struct FakePtySystem {
        spawned: AtomicU64,
        refuse: bool,
    }

    impl PtySystem for FakePtySystem {
        fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedPty, SessionError> {
            if self.refuse {
                return Err(SessionError::SpawnFailed("no pty available".to_string()));
            }

            let pid = 40_000 + self.spawned.fetch_add(1, Ordering::SeqCst) as u32;
            let (output_tx, output_rx) = std::sync::mpsc::channel();
            Ok(SpawnedPty {
                process: Box::new(VanishedProcess {
                    pid,
                    _output: output_tx,
                }),
                reader: Box::new(IdleReader(output_rx)),
                writer: Box::new(std::io::sink()),
                wait: Box::new(|| Some(0)),
            })
        }
    }

    #[tokio::test]
    async fn test_replace_ignores_kill_failure() {
        let pty = Arc::new(FakePtySystem::default());
        let manager = SessionManager::with_pty_system(test_settings(), pty.clone());

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        let first_pid = manager.get(&sid("t1")).unwrap().pid;

        manager.start(&sid("t1"), StartOptions::default()).await.unwrap();
        assert_eq!(pty.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(manager.count(), 1);
        assert_ne!(manager.get(&sid("t1")).unwrap().pid, first_pid);

        // The replaced session winds down without evicting its successor.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.exists(&sid("t1")));
        manager.write(&sid("t1"), b"ls\n").unwrap();

        manager.stop(&sid("t1"));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_slot() {
        let pty = Arc::new(FakePtySystem {
            refuse: true,
            ..FakePtySystem::default()
        });
        let settings = SessionSettings {
            max_sessions: 1,
            ..test_settings()
        };
        let manager = SessionManager::with_pty_system(settings, pty);

        for id in ["a", "b"] {
            let result = manager.start(&sid(id), StartOptions::default()).await;
            assert!(
                matches!(result, Err(SessionError::SpawnFailed(_))),
                "{id}: {result:?}"
            );
        }
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_respect_limit() {
        let settings = SessionSettings {
            max_sessions: 1,
            // Resolution runs a real shell, so the starts overlap while waiting on it.
            resolve_login_env: true,
            ..test_settings()
        };
        let manager = SessionManager::with_pty_system(settings, Arc::new(FakePtySystem::default()));

        let (id_a, id_b, id_c) = (sid("a"), sid("b"), sid("c"));
        let (a, b, c) = tokio::join!(
            manager.start(&id_a, StartOptions::default()),
            manager.start(&id_b, StartOptions::default()),
            manager.start(&id_c, StartOptions::default()),
        );
        let results = [a, b, c];

        let started = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(SessionError::LimitReached(1))))
            .count();
        assert_eq!((started, refused), (1, 2), "{results:?}");
        assert_eq!(manager.count(), 1);

        manager.shutdown();
    }
}
