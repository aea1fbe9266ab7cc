//! Unix Domain Socket IPC module for UI-daemon communication.
//!
//! ## Overview
//!
//! The IPC system uses the newline-delimited JSON protocol from the
//! `protocol` crate. Clients send request envelopes, the daemon answers each
//! with a response carrying the same id and, once a client subscribes, pushes
//! session output events on the same connection.
//!
//! ## Socket Path
//!
//! The socket path follows the XDG Base Directory Specification:
//! - Primary: `$XDG_RUNTIME_DIR/termhost/daemon.sock`
//! - Fallback: `/tmp/termhost-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = IpcClient::connect(&get_socket_path()).await?;
//!     let version = client.ping().await?;
//!     println!("Daemon is running (protocol v{version})");
//!     Ok(())
//! }
//! ```

mod client;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer, MessageWriter, RequestReader};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// ## Path Resolution
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termhost/daemon.sock`
/// 2. Otherwise: `/tmp/termhost-$UID/daemon.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir)
            .join("termhost")
            .join("daemon.sock"),
        _ => {
            // Get UID by checking metadata of a file we own
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);

            PathBuf::from(format!("/tmp/termhost-{uid}")).join("daemon.sock")
        }
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/termhost-unsupported/daemon.sock")
}
