//! Tile world server: pipeline coordinator and connection sessions.
//!
//! Decoded commands enter a bounded queue. One loop computes each command
//! against the [`WorldStore`](tileworld_kernel::WorldStore) and applies its
//! mutations; a second loop owns the router and fans notifications out to
//! subscribers, which forward mutations to their connection's outgoing queue.
//!
//! # Invariants
//! - At most one mutation is applied at a time.
//! - A failure in one command or one connection never stops the others.
//! - Every queue is bounded; a full queue blocks its producer.

pub mod config;
pub mod pipeline;
pub mod server;
pub mod session;

pub use config::{ConfigError, ServerConfig};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle, RouterEvent};
pub use server::{Server, ServerError, load_world};
pub use session::{Session, SessionError};
