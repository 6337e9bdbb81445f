use serde::{Deserialize, Serialize};
use serde_json::Value;
use tileworld_common::{DecodeError, Entity, EntityId, Position};

use crate::store::{StoreError, WorldStore};

/// Put an entity on a tile. First half of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceEntity {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
    #[serde(rename = "Position")]
    pub position: Position,
}

/// Drop an entity's entry from a tile it has left. Second half of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacatePosition {
    #[serde(rename = "SourceID")]
    pub source_id: EntityId,
    #[serde(rename = "Position")]
    pub position: Position,
}

/// Full snapshot upsert. Pushes perception results into a client mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetEntity {
    #[serde(rename = "Entity")]
    pub entity: Entity,
}

/// Overwrite `Spatial::stackable` on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStackability {
    #[serde(rename = "Entity")]
    pub entity: Entity,
    #[serde(rename = "Stackable", alias = "Stackability")]
    pub value: bool,
}

/// Forget every entity. Precedes a full perception resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAllEntities {}

/// An authoritative state delta.
///
/// Closed set; each variant is encoded on the wire as its own JSON object
/// next to a type tag from [`Mutation::type_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    PlaceEntity(PlaceEntity),
    VacatePosition(VacatePosition),
    SetEntity(SetEntity),
    SetStackability(SetStackability),
    ClearAllEntities(ClearAllEntities),
}

/// An entity changed tiles as a side effect of applying a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub id: EntityId,
    pub from: Position,
    pub to: Position,
}

const PLACE_ENTITY: &str = "mutations.PlaceEntity";
const VACATE_POSITION: &str = "mutations.VacatePosition";
const SET_ENTITY: &str = "mutations.SetEntity";
const SET_STACKABILITY: &str = "mutations.SetStackability";
const CLEAR_ALL_ENTITIES: &str = "mutations.ClearAllEntities";

impl Mutation {
    /// Wire type tag for this variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::PlaceEntity(_) => PLACE_ENTITY,
            Self::VacatePosition(_) => VACATE_POSITION,
            Self::SetEntity(_) => SET_ENTITY,
            Self::SetStackability(_) => SET_STACKABILITY,
            Self::ClearAllEntities(_) => CLEAR_ALL_ENTITIES,
        }
    }

    /// Encode the variant's payload, without the tag.
    pub fn content(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::PlaceEntity(m) => serde_json::to_value(m),
            Self::VacatePosition(m) => serde_json::to_value(m),
            Self::SetEntity(m) => serde_json::to_value(m),
            Self::SetStackability(m) => serde_json::to_value(m),
            Self::ClearAllEntities(m) => serde_json::to_value(m),
        }
    }

    /// Decode a payload by its type tag.
    ///
    /// Also accepts the older `mutators.*` tags, where a move's halves are
    /// `MoveTo` and `MoveFrom`.
    pub fn decode(tag: &str, content: &Value) -> Result<Self, DecodeError> {
        let decoded = match canonical_tag(tag) {
            PLACE_ENTITY => PlaceEntity::deserialize(content).map(Self::PlaceEntity),
            VACATE_POSITION => VacatePosition::deserialize(content).map(Self::VacatePosition),
            SET_ENTITY => SetEntity::deserialize(content).map(Self::SetEntity),
            SET_STACKABILITY => SetStackability::deserialize(content).map(Self::SetStackability),
            CLEAR_ALL_ENTITIES => {
                ClearAllEntities::deserialize(content).map(Self::ClearAllEntities)
            }
            other => return Err(DecodeError::UnknownTag(other.to_owned())),
        };
        decoded.map_err(|e| DecodeError::malformed(tag, e))
    }

    /// The entity this mutation is about, if it names one.
    pub fn subject(&self) -> Option<EntityId> {
        match self {
            Self::PlaceEntity(m) => Some(m.source_id),
            Self::VacatePosition(m) => Some(m.source_id),
            Self::SetEntity(m) => Some(m.entity.id),
            Self::SetStackability(m) => Some(m.entity.id),
            Self::ClearAllEntities(_) => None,
        }
    }

    /// Apply this delta to the store.
    ///
    /// Applying the same mutation twice leaves the store as applying it once.
    /// Reports the entity's old and new tile when it changed position.
    pub fn apply(&self, store: &WorldStore) -> Result<Option<Relocation>, StoreError> {
        match self {
            Self::PlaceEntity(m) => {
                let mut entity = store.get(m.source_id)?;
                let from = entity.position;
                entity.position = m.position;
                store.upsert(entity)?;
                Ok(relocation(m.source_id, from, m.position))
            }
            Self::VacatePosition(m) => {
                store.remove_from_position(m.source_id, m.position)?;
                Ok(None)
            }
            Self::SetEntity(m) => {
                let previous = store.upsert(m.entity)?;
                Ok(previous.and_then(|p| relocation(p.id, p.position, m.entity.position)))
            }
            Self::SetStackability(m) => {
                // Flip the stored copy so a stale snapshot cannot undo a move.
                let mut entity = match store.get(m.entity.id) {
                    Ok(current) => current,
                    Err(StoreError::NotFound(_)) => m.entity,
                    Err(e) => return Err(e),
                };
                entity.spatial.stackable = m.value;
                store.upsert(entity)?;
                Ok(None)
            }
            Self::ClearAllEntities(_) => {
                store.delete_all()?;
                Ok(None)
            }
        }
    }
}

fn canonical_tag(tag: &str) -> &str {
    match tag.strip_prefix("mutators.") {
        Some("MoveTo") => PLACE_ENTITY,
        Some("MoveFrom") => VACATE_POSITION,
        Some("SetEntity") => SET_ENTITY,
        Some("SetStackability") => SET_STACKABILITY,
        Some("ClearAllEntities") => CLEAR_ALL_ENTITIES,
        _ => tag,
    }
}

fn relocation(id: EntityId, from: Position, to: Position) -> Option<Relocation> {
    (from != to).then_some(Relocation { id, from, to })
}

impl From<PlaceEntity> for Mutation {
    fn from(m: PlaceEntity) -> Self {
        Self::PlaceEntity(m)
    }
}

impl From<VacatePosition> for Mutation {
    fn from(m: VacatePosition) -> Self {
        Self::VacatePosition(m)
    }
}

impl From<SetEntity> for Mutation {
    fn from(m: SetEntity) -> Self {
        Self::SetEntity(m)
    }
}

impl From<SetStackability> for Mutation {
    fn from(m: SetStackability) -> Self {
        Self::SetStackability(m)
    }
}

impl From<ClearAllEntities> for Mutation {
    fn from(m: ClearAllEntities) -> Self {
        Self::ClearAllEntities(m)
    }
}
