//! PID file utilities for daemon running detection.
//!
//! ## PID File Location
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/termhost/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/termhost/daemon.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{is_daemon_running, get_daemon_pid};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("termhost").join("daemon.pid")
}

/// Check if a daemon process is currently running.
///
/// Cleans up stale PID files automatically.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Automatically cleans up stale PID files.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Records the current process as the running daemon.
pub fn write_pid_file() -> io::Result<PathBuf> {
    let path = get_pid_file_path();
    write_pid_to(&path, std::process::id())?;
    Ok(path)
}

/// Removes the PID file if it names the current process.
pub fn remove_pid_file() {
    let path = get_pid_file_path();
    if read_pid(&path) == Some(std::process::id()) {
        cleanup_stale_pid_file(&path);
    }
}

fn write_pid_to(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{pid}\n"))
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Reads a PID file and returns the PID if that process is alive.
/// Unparseable or stale files are removed.
fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let Ok(pid) = contents.trim().parse::<u32>() else {
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists.
/// On other Unix systems, this sends signal 0.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}/stat")).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid)
            .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
