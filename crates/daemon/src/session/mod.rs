//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions are started under caller-chosen ids, written to, resized and
//! stopped; their output fans out to every registered listener.

pub mod env;
pub mod manager;
pub mod multiplexer;
pub mod pty;

pub use env::{EnvError, EnvResolver};
pub use manager::{exit_notice, SessionControl, SessionManager, SessionSettings, StartOptions};
pub use multiplexer::{ListenerId, ListenerStats, OutputBroadcaster, OutputChunk};
pub use pty::{
    NativePtySystem, PtyProcess, PtySystem, Session, SessionError, SessionId, SessionStatus,
    SpawnRequest, SpawnedPty,
};
