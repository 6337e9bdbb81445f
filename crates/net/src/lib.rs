//! Network tunnels between clients and the world server.
//!
//! Each logical message is one JSON [`Message`] followed by `\n`. After
//! connecting, both sides write their own 16-byte UUID plus `\n`, then read
//! the peer's. A [`Tunnel`] then exposes an inbound queue, an outbound queue
//! and a closed signal, backed by one reader and one writer thread.
//!
//! # Invariants
//! - A malformed frame is skipped; the connection stays open.
//! - An I/O failure, an oversized frame or an idle timeout ends that
//!   connection only and raises its closed signal.
//! - The idle clock is shared by both directions: any successful read or
//!   write restarts it.

mod codec;
mod message;
mod tunnel;

pub use codec::{DELIMITER, MAX_FRAME_LEN, decode_frame, handshake, write_frame};
pub use message::Message;
pub use tunnel::{Listener, Tunnel, TunnelConfig, dial};

use tileworld_common::DecodeError;

/// Errors from tunnel setup and framing.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("tunnel closed")]
    Closed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
