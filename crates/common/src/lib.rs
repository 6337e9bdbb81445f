//! Shared types for the tileworld server: entity identity, tile positions,
//! spatial flags, and the decode error every type-tagged payload shares.

mod decode;
mod types;

pub use decode::DecodeError;
pub use types::{Entity, EntityId, Position, Spatial};
