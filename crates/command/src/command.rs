use serde::{Deserialize, Serialize};
use serde_json::Value;
use tileworld_common::{DecodeError, EntityId, Position};
use tileworld_kernel::{
    ClearAllEntities, Mutation, PlaceEntity, SetEntity, SetStackability, StoreError,
    VacatePosition, WorldStore,
};
use tileworld_pubsub::Notification;

/// Half-width of the square a `Perceive` scans around its source.
pub const PERCEPTION_RADIUS: i32 = 5;

/// Step onto an adjacent tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
    #[serde(rename = "Position")]
    pub position: Position,
}

/// Full resync of everything around the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perceive {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
}

/// Snapshot of the source itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
}

/// Make a toggleable target passable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSpatial {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
    #[serde(rename = "TargetID")]
    pub target_id: EntityId,
}

/// Make a toggleable target blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSpatial {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
    #[serde(rename = "TargetID")]
    pub target_id: EntityId,
}

/// A client request against the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Move(Move),
    Perceive(Perceive),
    Info(Info),
    OpenSpatial(OpenSpatial),
    CloseSpatial(CloseSpatial),
}

/// Why a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("entity {entity} cannot reach {to} from {from}: distance {distance}")]
    TooFar {
        entity: EntityId,
        from: Position,
        to: Position,
        distance: u32,
    },
    #[error("entity {entity} is already at {position}")]
    AlreadyThere { entity: EntityId, position: Position },
    #[error("entity {0} cannot target itself")]
    SelfTarget(EntityId),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::UnknownEntity(id),
            other => Self::Store(other),
        }
    }
}

/// What a command proposes: mutations for the store, notifications for the
/// router. Both empty when the command is a policy no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Computed {
    pub mutations: Vec<Mutation>,
    pub notifications: Vec<Notification>,
}

impl Computed {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.notifications.is_empty()
    }
}

const MOVE: &str = "Move";
const PERCEIVE: &str = "Perceive";
const INFO: &str = "Info";
const OPEN_SPATIAL: &str = "OpenSpatial";
const CLOSE_SPATIAL: &str = "CloseSpatial";

impl Command {
    /// Wire type tag for this variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Move(_) => "commands.Move",
            Self::Perceive(_) => "commands.Perceive",
            Self::Info(_) => "commands.Info",
            Self::OpenSpatial(_) => "commands.OpenSpatial",
            Self::CloseSpatial(_) => "commands.CloseSpatial",
        }
    }

    /// Encode the variant's payload, without the tag.
    pub fn content(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Move(c) => serde_json::to_value(c),
            Self::Perceive(c) => serde_json::to_value(c),
            Self::Info(c) => serde_json::to_value(c),
            Self::OpenSpatial(c) => serde_json::to_value(c),
            Self::CloseSpatial(c) => serde_json::to_value(c),
        }
    }

    /// Decode a payload by its type tag. Accepts `commands.*` and the
    /// client-side `intents.*` spelling of the same variants.
    pub fn decode(tag: &str, content: &Value) -> Result<Self, DecodeError> {
        let variant = tag
            .strip_prefix("commands.")
            .or_else(|| tag.strip_prefix("intents."))
            .ok_or_else(|| DecodeError::UnknownTag(tag.to_owned()))?;

        let decoded = match variant {
            MOVE => Move::deserialize(content).map(Self::Move),
            PERCEIVE => Perceive::deserialize(content).map(Self::Perceive),
            INFO => Info::deserialize(content).map(Self::Info),
            OPEN_SPATIAL => OpenSpatial::deserialize(content).map(Self::OpenSpatial),
            CLOSE_SPATIAL => CloseSpatial::deserialize(content).map(Self::CloseSpatial),
            _ => return Err(DecodeError::UnknownTag(tag.to_owned())),
        };
        decoded.map_err(|e| DecodeError::malformed(tag, e))
    }

    /// The entity issuing the command.
    pub fn source_id(&self) -> EntityId {
        match self {
            Self::Move(c) => c.source_id,
            Self::Perceive(c) => c.source_id,
            Self::Info(c) => c.source_id,
            Self::OpenSpatial(c) => c.source_id,
            Self::CloseSpatial(c) => c.source_id,
        }
    }

    /// Derive mutations and notifications from the current store. Reads only.
    pub fn compute(&self, store: &WorldStore) -> Result<Computed, CommandError> {
        match self {
            Self::Move(c) => c.compute(store),
            Self::Perceive(c) => c.compute(store),
            Self::Info(c) => c.compute(store),
            Self::OpenSpatial(c) => toggle(store, c.source_id, c.target_id, true),
            Self::CloseSpatial(c) => toggle(store, c.source_id, c.target_id, false),
        }
    }
}

impl Move {
    fn compute(&self, store: &WorldStore) -> Result<Computed, CommandError> {
        let source = store.get(self.source_id)?;
        let from = source.position;
        let distance = from.chebyshev(self.position);
        if distance == 0 {
            return Err(CommandError::AlreadyThere {
                entity: source.id,
                position: from,
            });
        }
        if distance > 1 {
            return Err(CommandError::TooFar {
                entity: source.id,
                from,
                to: self.position,
                distance,
            });
        }

        let occupants = store.get_by_position(self.position)?;
        if let Some(blocker) = occupants.iter().find(|e| e.blocks()) {
            tracing::debug!(
                entity = %source.id,
                to = %self.position,
                blocker = %blocker.id,
                "move blocked"
            );
            return Ok(Computed::default());
        }

        let place = Mutation::from(PlaceEntity {
            source_id: source.id,
            position: self.position,
        });
        let vacate = Mutation::from(VacatePosition {
            source_id: source.id,
            position: from,
        });

        Ok(Computed {
            mutations: vec![place, vacate],
            notifications: vec![
                Notification::single(self.position, place),
                Notification::single(from, vacate),
                Notification::new(source.id, vec![place, vacate]),
            ],
        })
    }
}

impl Perceive {
    fn compute(&self, store: &WorldStore) -> Result<Computed, CommandError> {
        let center = store.get(self.source_id)?.position;

        let mut notifications = vec![Notification::single(self.source_id, ClearAllEntities {})];
        let (min_x, max_x) = window(center.x);
        let (min_y, max_y) = window(center.y);
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                for entity in store.get_by_position(Position::new(x, y))? {
                    notifications.push(Notification::single(self.source_id, SetEntity { entity }));
                }
            }
        }

        tracing::trace!(
            entity = %self.source_id,
            visible = notifications.len() - 1,
            "perceived"
        );
        Ok(Computed {
            mutations: Vec::new(),
            notifications,
        })
    }
}

impl Info {
    fn compute(&self, store: &WorldStore) -> Result<Computed, CommandError> {
        let entity = store.get(self.source_id)?;
        Ok(Computed {
            mutations: Vec::new(),
            notifications: vec![Notification::single(entity.id, SetEntity { entity })],
        })
    }
}

/// Inclusive bounds of the perception window along one axis.
fn window(center: i32) -> (i32, i32) {
    (
        center.saturating_sub(PERCEPTION_RADIUS),
        center.saturating_add(PERCEPTION_RADIUS),
    )
}

/// Shared rule for open (`stackable == true`) and close (`false`).
fn toggle(
    store: &WorldStore,
    source_id: EntityId,
    target_id: EntityId,
    stackable: bool,
) -> Result<Computed, CommandError> {
    if source_id == target_id {
        return Err(CommandError::SelfTarget(source_id));
    }
    store.get(source_id)?;
    let target = store.get(target_id)?;

    if !target.spatial.toggleable || target.spatial.stackable == stackable {
        tracing::debug!(
            source = %source_id,
            target = %target_id,
            stackable,
            "toggle skipped"
        );
        return Ok(Computed::default());
    }

    let flip = Mutation::from(SetStackability {
        entity: target,
        value: stackable,
    });
    Ok(Computed {
        mutations: vec![flip],
        notifications: vec![
            Notification::single(target_id, flip),
            Notification::single(source_id, flip),
        ],
    })
}

impl From<Move> for Command {
    fn from(c: Move) -> Self {
        Self::Move(c)
    }
}

impl From<Perceive> for Command {
    fn from(c: Perceive) -> Self {
        Self::Perceive(c)
    }
}

impl From<Info> for Command {
    fn from(c: Info) -> Self {
        Self::Info(c)
    }
}

impl From<OpenSpatial> for Command {
    fn from(c: OpenSpatial) -> Self {
        Self::OpenSpatial(c)
    }
}

impl From<CloseSpatial> for Command {
    fn from(c: CloseSpatial) -> Self {
        Self::CloseSpatial(c)
    }
}
