//! World Kernel: the authoritative entity store and the mutation set that
//! changes it.
//!
//! # Invariants
//! - Every entity in the ID index sits in the position bucket equal to its
//!   `position`, and every ID in a bucket resolves to an entity at that
//!   position. Writers restore this before releasing their locks.
//! - Lock order is positions, then entities. Readers of a position bucket
//!   copy the bucket and release it before touching the entity index.
//! - All state changes flow through `Mutation::apply` or the store's
//!   explicit write operations.

pub mod mutation;
pub mod store;

pub use mutation::{
    ClearAllEntities, Mutation, PlaceEntity, Relocation, SetEntity, SetStackability,
    VacatePosition,
};
pub use store::{InvariantViolation, StoreError, WorldStore};
