//! Commands: client requests that, given read access to the world store,
//! propose mutations and the notifications announcing them.
//!
//! # Invariants
//! - `compute` never writes to the store; the pipeline applies the returned
//!   mutations afterwards, in order.
//! - Invalid input is a `CommandError`, never a panic. Policy refusals (a
//!   blocked tile, a door already in the wanted state) are empty results.

mod command;

pub use command::{
    CloseSpatial, Command, CommandError, Computed, Info, Move, OpenSpatial, PERCEPTION_RADIUS,
    Perceive,
};
