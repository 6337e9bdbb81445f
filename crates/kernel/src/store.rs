use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tileworld_common::{Entity, EntityId, Position};

/// Errors from world store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("entity {0} not found")]
    NotFound(EntityId),
    /// A writer panicked while holding an index lock; the indices can no
    /// longer be trusted.
    #[error("world index lock poisoned")]
    Poisoned,
}

/// A broken link between the two indices, reported by
/// [`WorldStore::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("entity {id} at {position} is missing from that position bucket")]
    MissingFromBucket { id: EntityId, position: Position },
    #[error("bucket {bucket} lists unknown entity {id}")]
    UnknownId { id: EntityId, bucket: Position },
    #[error("bucket {bucket} lists entity {id} which is at {actual}")]
    StaleEntry {
        id: EntityId,
        bucket: Position,
        actual: Position,
    },
}

type Buckets = HashMap<Position, HashSet<EntityId>>;

/// Concurrent spatial entity store.
///
/// Two indices: entity ID to entity, and position to the set of IDs on that
/// tile. Each index has its own `RwLock`, so unrelated reads proceed in
/// parallel and writes are exclusive.
///
/// Lock order is `positions` then `entities`. Writers take both in that
/// order. Bucket readers copy the bucket under `positions`, drop it, then
/// resolve IDs under `entities`, so no read path ever holds both.
#[derive(Debug, Default)]
pub struct WorldStore {
    positions: RwLock<Buckets>,
    entities: RwLock<HashMap<EntityId, Entity>>,
}

impl WorldStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store seeded with the given entities. Later duplicates of an
    /// ID replace earlier ones.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut by_id = HashMap::new();
        let mut positions = Buckets::new();
        for entity in entities {
            if let Some(prev) = by_id.insert(entity.id, entity) {
                detach(&mut positions, prev.id, prev.position);
            }
            positions.entry(entity.position).or_default().insert(entity.id);
        }
        Self {
            positions: RwLock::new(positions),
            entities: RwLock::new(by_id),
        }
    }

    /// Look up a single entity by ID.
    pub fn get(&self, id: EntityId) -> Result<Entity, StoreError> {
        let entities = read(&self.entities)?;
        entities.get(&id).copied().ok_or(StoreError::NotFound(id))
    }

    /// All entities on a tile, ordered by ID. An untouched tile yields an
    /// empty list.
    pub fn get_by_position(&self, position: Position) -> Result<Vec<Entity>, StoreError> {
        let ids: Vec<EntityId> = {
            let positions = read(&self.positions)?;
            match positions.get(&position) {
                Some(bucket) => bucket.iter().copied().collect(),
                None => return Ok(Vec::new()),
            }
        };

        let entities = read(&self.entities)?;
        let mut found: Vec<Entity> = ids
            .iter()
            .filter_map(|id| entities.get(id))
            // A writer may have moved the entity between the two reads.
            .filter(|e| e.position == position)
            .copied()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    /// Insert or replace an entity at its current position, dropping it from
    /// its old bucket if it moved. Returns the previous copy, if any.
    ///
    /// Re-upserting an unchanged entity leaves both indices as they were.
    pub fn upsert(&self, entity: Entity) -> Result<Option<Entity>, StoreError> {
        let mut positions = write(&self.positions)?;
        let mut entities = write(&self.entities)?;

        let previous = entities.insert(entity.id, entity);
        if let Some(prev) = previous {
            if prev.position != entity.position {
                detach(&mut positions, prev.id, prev.position);
            }
        }
        positions
            .entry(entity.position)
            .or_default()
            .insert(entity.id);

        tracing::trace!(id = %entity.id, position = %entity.position, "upserted entity");
        Ok(previous)
    }

    /// Drop `id` from one position bucket only.
    ///
    /// The entry is left alone when `position` is where the entity currently
    /// is, so a replayed vacate after the entity came back cannot orphan it.
    /// Returns whether an entry was removed.
    pub fn remove_from_position(&self, id: EntityId, position: Position) -> Result<bool, StoreError> {
        let mut positions = write(&self.positions)?;
        let entities = read(&self.entities)?;

        if entities.get(&id).is_some_and(|e| e.position == position) {
            return Ok(false);
        }
        Ok(detach(&mut positions, id, position))
    }

    /// Remove an entity from both indices. Returns it if it existed.
    pub fn remove(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        let mut positions = write(&self.positions)?;
        let mut entities = write(&self.entities)?;

        let removed = entities.remove(&id);
        if let Some(ref e) = removed {
            detach(&mut positions, id, e.position);
        }
        Ok(removed)
    }

    /// Clear both indices.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        let mut positions = write(&self.positions)?;
        let mut entities = write(&self.entities)?;
        positions.clear();
        entities.clear();
        Ok(())
    }

    /// Replace the whole world with `entities`.
    pub fn load_snapshot(&self, entities: impl IntoIterator<Item = Entity>) -> Result<(), StoreError> {
        let fresh = Self::from_entities(entities);
        let fresh_positions = fresh.positions.into_inner().map_err(|_| StoreError::Poisoned)?;
        let fresh_entities = fresh.entities.into_inner().map_err(|_| StoreError::Poisoned)?;

        let mut positions = write(&self.positions)?;
        let mut by_id = write(&self.entities)?;
        *positions = fresh_positions;
        *by_id = fresh_entities;
        tracing::debug!(count = by_id.len(), "loaded world snapshot");
        Ok(())
    }

    /// Copy out every entity, ordered by ID.
    pub fn dump_snapshot(&self) -> Result<Vec<Entity>, StoreError> {
        let entities = read(&self.entities)?;
        let mut all: Vec<Entity> = entities.values().copied().collect();
        all.sort_by_key(|e| e.id);
        Ok(all)
    }

    /// IDs of every stored entity, ordered.
    pub fn ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let entities = read(&self.entities)?;
        let mut ids: Vec<EntityId> = entities.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    /// Number of entities in the ID index.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(read(&self.entities)?.len())
    }

    /// Whether the ID index is empty.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(read(&self.entities)?.is_empty())
    }

    /// Cross-check both indices against each other.
    ///
    /// Holds both read locks, taken in the store's lock order, so the check
    /// sees one consistent state.
    pub fn check_invariants(&self) -> Result<Result<(), InvariantViolation>, StoreError> {
        let positions = read(&self.positions)?;
        let entities = read(&self.entities)?;

        for (id, entity) in entities.iter() {
            let listed = positions
                .get(&entity.position)
                .is_some_and(|bucket| bucket.contains(id));
            if !listed {
                return Ok(Err(InvariantViolation::MissingFromBucket {
                    id: *id,
                    position: entity.position,
                }));
            }
        }

        for (bucket, ids) in positions.iter() {
            for id in ids {
                match entities.get(id) {
                    None => {
                        return Ok(Err(InvariantViolation::UnknownId {
                            id: *id,
                            bucket: *bucket,
                        }));
                    }
                    Some(e) if e.position != *bucket => {
                        return Ok(Err(InvariantViolation::StaleEntry {
                            id: *id,
                            bucket: *bucket,
                            actual: e.position,
                        }));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(Ok(()))
    }
}

/// Remove `id` from a bucket, pruning the bucket once empty.
fn detach(positions: &mut Buckets, id: EntityId, position: Position) -> bool {
    let Some(bucket) = positions.get_mut(&position) else {
        return false;
    };
    let removed = bucket.remove(&id);
    if bucket.is_empty() {
        positions.remove(&position);
    }
    removed
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| StoreError::Poisoned)
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| StoreError::Poisoned)
}
