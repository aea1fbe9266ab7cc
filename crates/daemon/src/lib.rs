//! # termhost Daemon Library
//!
//! This crate provides the host-side terminal service for termhost: a set of
//! named pseudo-terminal sessions whose output streams to every attached UI.
//!
//! ## Overview
//!
//! The daemon owns the shells. UIs come and go over a local socket.
//! It provides:
//!
//! - **PTY Session Management**: Start, write, resize and stop sessions by id
//! - **Login Environment**: Sessions see the user's login shell environment
//! - **Output Fan-out**: Every output chunk reaches every subscribed listener
//! - **IPC Transport**: Newline-delimited JSON over a Unix domain socket
//! - **Restart on Write**: A caller-side helper that revives dead terminals
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │  Login Env   │  │       Output         │  │
//! │  │   Manager    │  │   Resolver   │  │    Broadcaster       │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Request Router                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │              IPC Server (Unix domain socket)               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until a client asks us to exit.
//!     orchestrator.shutdown_requested().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY session creation and management
//! - [`router`]: Request routing to the session manager
//! - [`ipc`]: Socket server, client and PID file
//! - [`reconnect`]: Restart-on-write policy for UI callers
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod reconnect;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    SessionControl, SessionError, SessionId, SessionManager, SessionSettings, SessionStatus,
    StartOptions,
};

pub use router::{RequestRouter, RouterError, RouterResult};

pub use reconnect::{write_with_restart, RestartPolicy, WriteOutcome, RECONNECT_NOTICE};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
