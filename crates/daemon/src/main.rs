//! termhost
//!
//! Host-side terminal service and its command-line client.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_daemon_pid, is_daemon_running, IpcClient};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::protocol::{OpResult, SessionState, SessionSummary};
use daemon::reconnect::{write_with_restart, RestartPolicy, WriteOutcome};
use daemon::session::StartOptions;
use tokio::io::AsyncReadExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Timeout for connecting to the daemon socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ctrl-] detaches from an attached session.
const DETACH_KEY: u8 = 0x1d;

/// termhost - named pseudo-terminal sessions that outlive their UI.
#[derive(Parser, Debug)]
#[command(name = "termhost")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Daemon socket path (overrides config and TERMHOST_SOCKET)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve,

    /// Show daemon status
    Status,

    /// Start (or replace) a session
    Start {
        /// Session ID
        session_id: String,

        /// Working directory for the shell
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Text typed into the shell once it is up
        #[arg(long, short)]
        input: Option<String>,
    },

    /// Type a line into a session, restarting it if it has exited
    Send {
        /// Session ID
        session_id: String,

        /// Text to send
        text: String,

        /// Do not press Enter after the text
        #[arg(long, short = 'n')]
        no_enter: bool,

        /// Working directory used if the session has to be restarted
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Attach this terminal to a session (Ctrl-] detaches)
    Attach {
        /// Session ID
        session_id: String,

        /// Working directory if the session has to be started
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Manage active sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Ask the daemon to stop every session and exit
    Shutdown,
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Stop an active session
    Stop {
        /// Session ID to stop
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides, then the command line
    config.apply_env_overrides();
    if let Some(socket) = &cli.socket {
        config.daemon.socket_path = Some(socket.clone());
    }

    config.validate()?;

    let is_serve = matches!(cli.command, Commands::Serve);
    let _log_guard = init_logging(&config, cli.verbose, is_serve)?;

    let socket_path = config.socket_path();

    match cli.command {
        Commands::Serve => {
            // Check for existing daemon BEFORE starting
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termhost shutdown");
                std::process::exit(1);
            }

            tracing::info!("termhost daemon starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?.with_pid_file(true);
            run_daemon(&mut orchestrator).await?;
        }
        Commands::Status => {
            let pid = get_daemon_pid();
            match connect(&socket_path).await {
                Ok(client) => {
                    let version = client.ping().await?;
                    let sessions = client.list_sessions().await?;
                    println!("Daemon Status: running");
                    match pid {
                        Some(pid) => println!("  PID:      {}", pid),
                        None => println!("  PID:      unknown"),
                    }
                    println!("  Socket:   {}", socket_path.display());
                    println!("  Protocol: v{}", version);
                    println!("  Sessions: {}", sessions.len());
                }
                Err(e) => {
                    eprintln!("Daemon is not running: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Start {
            session_id,
            cwd,
            input,
        } => {
            let client = connect(&socket_path).await?;
            let options = StartOptions {
                working_directory: cwd,
                initial_input: input.map(with_enter),
            };
            let result = client.start_session(&session_id, options).await?;
            check_result(result, &format!("start session {}", session_id))?;
            println!("Session {} started", session_id);
        }
        Commands::Send {
            session_id,
            text,
            no_enter,
            cwd,
        } => {
            let client = connect(&socket_path).await?;
            let mut data = text.into_bytes();
            if !no_enter {
                data.push(b'\r');
            }

            let policy = RestartPolicy {
                working_directory: cwd,
                ..RestartPolicy::default()
            };
            let outcome = write_with_restart(&client, &session_id, &data, &policy, |notice| {
                eprint!("{}", notice);
            })
            .await
            .with_context(|| format!("Failed to write to session {}", session_id))?;

            if outcome == WriteOutcome::Restarted {
                tracing::warn!(session_id = %session_id, "Session was restarted before the write");
            }
        }
        Commands::Attach { session_id, cwd } => {
            let result = attach(&socket_path, session_id, cwd).await;
            // The stdin reader thread would keep the runtime alive.
            match result {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("{:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => {
                let client = connect(&socket_path).await?;
                let sessions = client.list_sessions().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
            }
            SessionsCommands::Stop { session_id } => {
                let client = connect(&socket_path).await?;
                let result = client.stop_session(&session_id).await?;
                check_result(result, &format!("stop session {}", session_id))?;
                println!("Session {} stopped", session_id);
            }
        },
        Commands::Shutdown => {
            let client = connect(&socket_path).await?;
            client.shutdown().await?;
            println!("Daemon is shutting down");
        }
    }

    Ok(())
}

/// Set up the tracing subscriber.
///
/// The daemon logs at the configured level, client verbs at `warn` so their
/// output stays readable. `--verbose` forces `debug` for both. The returned
/// guard flushes the optional log file and must live until exit.
fn init_logging(
    config: &Config,
    verbose: bool,
    is_serve: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else if is_serve {
        config.daemon.log_level.as_str()
    } else {
        "warn"
    };
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("Invalid log filter: {}", level))?;

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match (&config.daemon.log_file, is_serve) {
        (Some(log_file), true) => {
            let directory = log_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = log_file
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", log_file.display()))?;
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

/// Connect to the daemon socket.
async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Append a carriage return unless the text already ends a line.
fn with_enter(mut text: String) -> String {
    if !text.ends_with('\n') && !text.ends_with('\r') {
        text.push('\r');
    }
    text
}

/// Turn a failed operation result into an error.
fn check_result(result: OpResult, what: &str) -> anyhow::Result<()> {
    if result.success {
        return Ok(());
    }
    let message = result.error.unwrap_or_else(|| "unknown error".to_string());
    anyhow::bail!("Failed to {}: {}", what, message)
}

/// Run the daemon until a signal or a client asks it to exit.
async fn run_daemon(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;
    tracing::info!(socket = %orchestrator.socket_path().display(), "Daemon ready");

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { connection_id } => {
                    tracing::debug!(connection_id, "Client connected");
                }
                OrchestratorEvent::ClientDisconnected { connection_id } => {
                    tracing::debug!(connection_id, "Client disconnected");
                }
                OrchestratorEvent::ShutdownRequested => {
                    tracing::info!("Shutdown requested by client");
                }
            }
        }
    });

    let shutdown_requested = orchestrator.shutdown_requested();
    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = shutdown_requested.cancelled() => {}
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Attach the local terminal to a session.
///
/// Output of the session is copied to stdout, keystrokes are written back
/// through [`write_with_restart`] so a shell that exited comes back on the
/// next key press. Terminal size changes are forwarded as resizes.
async fn attach(socket_path: &Path, session_id: String, cwd: Option<PathBuf>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let client = connect(socket_path).await?;
    let mut events = client
        .take_events()
        .context("Event stream already taken")?;
    client.subscribe().await?;

    let sessions = client.list_sessions().await?;
    if !sessions.iter().any(|s| s.session_id == session_id) {
        let options = StartOptions {
            working_directory: cwd.clone(),
            initial_input: None,
        };
        let result = client.start_session(&session_id, options).await?;
        check_result(result, &format!("start session {}", session_id))?;
    }

    if let Ok((cols, rows)) = crossterm::terminal::size() {
        client.resize_session(&session_id, cols, rows).await?;
    }

    let policy = RestartPolicy {
        working_directory: cwd,
        ..RestartPolicy::default()
    };
    let mut winch = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];

    let guard = RawModeGuard::enable()?;
    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("Connection to daemon lost");
                    };
                    if event.session_id == session_id {
                        let mut stdout = std::io::stdout().lock();
                        stdout.write_all(&event.data)?;
                        stdout.flush()?;
                    }
                }
                read = stdin.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    let input = &buf[..n];
                    let (input, detach) = match input.iter().position(|&b| b == DETACH_KEY) {
                        Some(pos) => (&input[..pos], true),
                        None => (input, false),
                    };
                    if !input.is_empty() {
                        write_with_restart(&client, &session_id, input, &policy, |notice| {
                            let mut stdout = std::io::stdout().lock();
                            let _ = stdout.write_all(notice.as_bytes());
                            let _ = stdout.flush();
                        })
                        .await?;
                    }
                    if detach {
                        return Ok(());
                    }
                }
                _ = winch.recv() => {
                    if let Ok((cols, rows)) = crossterm::terminal::size() {
                        client.resize_session(&session_id, cols, rows).await?;
                    }
                }
            }
        }
    }
    .await;
    drop(guard);

    println!();
    println!("[detached from {}]", session_id);
    result
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(2)
        .max(2);

    println!(
        "{:<id_width$}  {:>8}  {:>9}  {:<8}  {:>10}  CWD",
        "ID",
        "PID",
        "SIZE",
        "STATE",
        "STARTED",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 48));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:>8}  {:>9}  {:<8}  {:>10}  {}",
            session.session_id,
            pid,
            format!("{}x{}", session.cols, session.rows),
            state_label(session.state),
            format_relative_time(session.started_at),
            session.working_directory.display(),
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Starting => "starting",
        SessionState::Running => "running",
        SessionState::Exited => "exited",
        SessionState::Killed => "killed",
    }
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["termhost", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["termhost", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termhost", "start", "t1"]).unwrap();
        match cli.command {
            Commands::Start {
                session_id,
                cwd,
                input,
            } => {
                assert_eq!(session_id, "t1");
                assert!(cwd.is_none());
                assert!(input.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_cwd_and_input() {
        let cli = Cli::try_parse_from([
            "termhost", "start", "t1", "--cwd", "/tmp", "-i", "echo hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Start { cwd, input, .. } => {
                assert_eq!(cwd, Some(PathBuf::from("/tmp")));
                assert_eq!(input.as_deref(), Some("echo hi"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_requires_id() {
        assert!(Cli::try_parse_from(["termhost", "start"]).is_err());
    }

    #[test]
    fn test_send_command() {
        let cli = Cli::try_parse_from(["termhost", "send", "t1", "ls -la"]).unwrap();
        match cli.command {
            Commands::Send {
                session_id,
                text,
                no_enter,
                cwd,
            } => {
                assert_eq!(session_id, "t1");
                assert_eq!(text, "ls -la");
                assert!(!no_enter);
                assert!(cwd.is_none());
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_send_no_enter() {
        let cli = Cli::try_parse_from(["termhost", "send", "t1", "x", "-n"]).unwrap();
        match cli.command {
            Commands::Send { no_enter, .. } => assert!(no_enter),
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_send_requires_text() {
        assert!(Cli::try_parse_from(["termhost", "send", "t1"]).is_err());
    }

    #[test]
    fn test_attach_command() {
        let cli = Cli::try_parse_from(["termhost", "attach", "work", "--cwd", "/srv"]).unwrap();
        match cli.command {
            Commands::Attach { session_id, cwd } => {
                assert_eq!(session_id, "work");
                assert_eq!(cwd, Some(PathBuf::from("/srv")));
            }
            _ => panic!("Expected Attach command"),
        }
    }

    #[test]
    fn test_sessions_list() {
        let cli = Cli::try_parse_from(["termhost", "sessions", "list"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(!json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["termhost", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_stop() {
        let cli = Cli::try_parse_from(["termhost", "sessions", "stop", "t1"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Stop { session_id }) => {
                assert_eq!(session_id, "t1");
            }
            _ => panic!("Expected Sessions Stop command"),
        }
    }

    #[test]
    fn test_sessions_without_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhost", "sessions"]).is_err());
    }

    #[test]
    fn test_shutdown_command() {
        let cli = Cli::try_parse_from(["termhost", "shutdown"]).unwrap();
        assert!(matches!(cli.command, Commands::Shutdown));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "termhost",
            "-v",
            "-c",
            "/etc/termhost.toml",
            "--socket",
            "/tmp/th.sock",
            "status",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termhost.toml")));
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/th.sock")));
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from(["termhost", "status", "--verbose", "--socket", "/s"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.socket, Some(PathBuf::from("/s")));
    }

    #[test]
    fn test_invalid_command_fails() {
        assert!(Cli::try_parse_from(["termhost", "invalid"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["termhost"]).is_err());
    }

    #[test]
    fn test_help_available() {
        let err = Cli::try_parse_from(["termhost", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_check_result() {
        assert!(check_result(OpResult::ok(), "start").is_ok());

        let failed = OpResult {
            success: false,
            error: Some("t1 not running".to_string()),
            code: None,
        };
        let err = check_result(failed, "write").unwrap_err();
        assert!(err.to_string().contains("t1 not running"));
    }

    #[test]
    fn test_with_enter() {
        assert_eq!(with_enter("ls".to_string()), "ls\r");
        assert_eq!(with_enter("ls\n".to_string()), "ls\n");
        assert_eq!(with_enter("ls\r".to_string()), "ls\r");
    }

    #[test]
    fn test_format_relative_time() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(format_relative_time(now).ends_with("s ago"));
        assert_eq!(format_relative_time(now - 120), "2m ago");
        assert_eq!(format_relative_time(now - 7200), "2h ago");
        assert_eq!(format_relative_time(now - 172_800), "2d ago");
    }

    #[test]
    fn test_state_label() {
        assert_eq!(state_label(SessionState::Running), "running");
        assert_eq!(state_label(SessionState::Exited), "exited");
    }
}
