use std::fmt;
use tileworld_common::{EntityId, Position};
use tileworld_kernel::Mutation;

/// Routing key for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Everyone watching a tile.
    Position(Position),
    /// Whoever controls an entity.
    Entity(EntityId),
    /// Every subscriber that opted into broadcasts.
    Broadcast,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(p) => write!(f, "position{p}"),
            Self::Entity(id) => write!(f, "entity({id})"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

impl From<Position> for Topic {
    fn from(p: Position) -> Self {
        Self::Position(p)
    }
}

impl From<EntityId> for Topic {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

/// Mutations addressed to one topic. Produced by a command, consumed once by
/// the router, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: Topic,
    pub mutations: Vec<Mutation>,
}

impl Notification {
    pub fn new(topic: impl Into<Topic>, mutations: Vec<Mutation>) -> Self {
        Self {
            topic: topic.into(),
            mutations,
        }
    }

    /// A notification carrying a single mutation.
    pub fn single(topic: impl Into<Topic>, mutation: impl Into<Mutation>) -> Self {
        Self::new(topic, vec![mutation.into()])
    }
}
