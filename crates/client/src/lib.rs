//! Client side of the tile world.
//!
//! A client keeps a mirror [`WorldStore`](tileworld_kernel::WorldStore) fed
//! only by mutations the server sends, and derives its next commands from
//! that mirror.
//!
//! # Invariants
//! - The mirror is written by a single loop, in arrival order.
//! - Planning reads the mirror and never writes it.

mod plan;
mod session;

pub use plan::{Direction, ParseDirectionError, Tile, plan_step, render_view};
pub use session::{Client, ClientError};
