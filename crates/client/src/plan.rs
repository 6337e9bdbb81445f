use std::fmt;
use std::str::FromStr;
use tileworld_command::{Command, Move, OpenSpatial, Perceive};
use tileworld_common::{Entity, EntityId, Position};
use tileworld_kernel::{StoreError, WorldStore};

/// A step on the grid. `Up` is toward smaller `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Right,
    Down,
    Left,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Self::Up, Self::Right, Self::Down, Self::Left];

    /// The tile one step from `from`.
    pub fn step(self, from: Position) -> Position {
        match self {
            Self::Up => from.offset(0, -1),
            Self::Right => from.offset(1, 0),
            Self::Down => from.offset(0, 1),
            Self::Left => from.offset(-1, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction {0:?}; expected up, down, left, right or w, a, s, d")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "u" | "w" | "north" => Ok(Self::Up),
            "right" | "r" | "d" | "east" => Ok(Self::Right),
            "down" | "s" | "south" => Ok(Self::Down),
            "left" | "l" | "a" | "west" => Ok(Self::Left),
            _ => Err(ParseDirectionError(s.to_owned())),
        }
    }
}

/// Commands for one step of `entity` in `direction`, judged against the
/// mirror.
///
/// A free or fully stackable tile yields `Move` then `Perceive`. Closed
/// doors on the tile yield one `OpenSpatial` each. Anything else blocking
/// yields nothing.
pub fn plan_step(
    mirror: &WorldStore,
    entity: EntityId,
    direction: Direction,
) -> Result<Vec<Command>, StoreError> {
    let source = mirror.get(entity)?;
    let target = direction.step(source.position);
    let blockers: Vec<Entity> = mirror
        .get_by_position(target)?
        .into_iter()
        .filter(Entity::blocks)
        .collect();

    if blockers.is_empty() {
        return Ok(vec![
            Move {
                source_id: entity,
                position: target,
            }
            .into(),
            Perceive { source_id: entity }.into(),
        ]);
    }
    if blockers.iter().any(|b| !b.spatial.toggleable) {
        tracing::debug!(%entity, %target, "step blocked");
        return Ok(Vec::new());
    }
    Ok(blockers
        .iter()
        .map(|door| {
            OpenSpatial {
                source_id: entity,
                target_id: door.id,
            }
            .into()
        })
        .collect())
}

/// What a tile looks like from the client's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Empty,
    Me,
    Wall,
    ClosedDoor,
    OpenDoor,
    Other,
}

impl Tile {
    fn of(entity: &Entity, me: EntityId) -> Self {
        match (entity.spatial.toggleable, entity.spatial.stackable) {
            (true, false) => Self::ClosedDoor,
            (true, true) => Self::OpenDoor,
            _ if entity.id == me => Self::Me,
            (false, false) => Self::Wall,
            (false, true) => Self::Other,
        }
    }

    /// Higher wins when several entities share a tile.
    fn rank(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Other => 1,
            Self::OpenDoor => 2,
            Self::ClosedDoor => 3,
            Self::Wall => 4,
            Self::Me => 5,
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Self::Empty => '.',
            Self::Me => '@',
            Self::Wall => '#',
            Self::ClosedDoor => '+',
            Self::OpenDoor => '-',
            Self::Other => 'o',
        };
        write!(f, "{c}")
    }
}

/// Text map of the square of half-width `radius` around `me`, one row per
/// line, top row first.
pub fn render_view(mirror: &WorldStore, me: EntityId, radius: i32) -> Result<String, StoreError> {
    let center = mirror.get(me)?.position;
    let radius = radius.max(0);
    let mut out = String::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let tile = mirror
                .get_by_position(center.offset(dx, dy))?
                .iter()
                .map(|e| Tile::of(e, me))
                .max_by_key(|t| t.rank())
                .unwrap_or(Tile::Empty);
            out.push_str(&tile.to_string());
        }
        out.push('\n');
    }
    Ok(out)
}
