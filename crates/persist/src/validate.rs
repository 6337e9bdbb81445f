use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tileworld_common::{Entity, EntityId, Position};

/// A problem that makes a snapshot unsafe to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// The same ID appears more than once; later records would shadow
    /// earlier ones on load.
    DuplicateId(EntityId),
    /// More than one blocking entity shares a tile.
    CrowdedTile {
        position: Position,
        blockers: Vec<EntityId>,
    },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "duplicate entity id {id}"),
            Self::CrowdedTile { position, blockers } => {
                write!(f, "{} blocking entities share tile {position}", blockers.len())
            }
        }
    }
}

/// Check a snapshot before it seeds a store. Issues come back in a stable
/// order: duplicates first, then crowded tiles by position.
pub fn validate(entities: &[Entity]) -> Vec<Issue> {
    let mut issues = Vec::new();

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for e in entities {
        if !seen.insert(e.id) && reported.insert(e.id) {
            issues.push(Issue::DuplicateId(e.id));
        }
    }

    let mut blockers: BTreeMap<Position, Vec<EntityId>> = BTreeMap::new();
    for e in entities.iter().filter(|e| e.blocks()) {
        blockers.entry(e.position).or_default().push(e.id);
    }
    for (position, mut ids) in blockers {
        if ids.len() > 1 {
            ids.sort();
            issues.push(Issue::CrowdedTile {
                position,
                blockers: ids,
            });
        }
    }

    issues
}
