//! # termhost Protocol Library
//!
//! This crate defines the messages exchanged between the termhost daemon,
//! which owns pseudo-terminal sessions, and the UI clients that render them.
//!
//! ## Overview
//!
//! - **Requests**: start, write, resize, stop, list, subscribe, shutdown
//! - **Responses**: the `{success, error}` result shape plus a few
//!   request-specific payloads
//! - **Output events**: session-tagged byte chunks pushed to subscribers
//! - **Line codec**: newline-delimited JSON framing with a size limit
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{LineCodec, Request, RequestEnvelope};
//!
//! let codec = LineCodec::new();
//! let line = codec
//!     .encode(&RequestEnvelope::new(1, Request::write("t1", b"ls\n".to_vec())))
//!     .unwrap();
//! let decoded: RequestEnvelope = codec.decode(&line).unwrap();
//! assert_eq!(decoded.id, 1);
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{LineCodec, LINE_DELIMITER, MAX_LINE_SIZE};
pub use messages::{
    ErrorCode, OpResult, OutputEvent, Request, RequestEnvelope, Response, ServerMessage,
    SessionId, SessionState, SessionSummary, PROTOCOL_VERSION,
};
