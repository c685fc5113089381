use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::shared::AppError;

/// Dungeon difficulty, selected by the players when a lobby is created
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Epic,
}

impl Difficulty {
    fn discriminant(self) -> u8 {
        match self {
            Difficulty::Easy => 0,
            Difficulty::Medium => 1,
            Difficulty::Hard => 2,
            Difficulty::Epic => 3,
        }
    }
}

/// Largest accepted layout width or height, in grid cells
pub const MAX_LAYOUT_EXTENT: u32 = 1024;

/// Largest accepted room target. Generation cost grows with the square of it.
pub const MAX_ROOM_COUNT_TARGET: u32 = 256;

/// Inputs that fully determine a generated layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub room_count_target: u32,
    pub difficulty: Difficulty,
}

impl GenerationParameters {
    /// Builds parameters, rejecting empty or oversized bounds and room targets
    pub fn new(
        seed: i64,
        width: u32,
        height: u32,
        room_count_target: u32,
        difficulty: Difficulty,
    ) -> Result<Self, AppError> {
        let params = Self {
            seed,
            width,
            height,
            room_count_target,
            difficulty,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.check().map_err(AppError::BadRequest)
    }

    /// Describes the first limit these parameters break, if any
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Layout bounds must be positive".to_string());
        }
        if self.width > MAX_LAYOUT_EXTENT || self.height > MAX_LAYOUT_EXTENT {
            return Err(format!(
                "Layout bounds must not exceed {}x{}",
                MAX_LAYOUT_EXTENT, MAX_LAYOUT_EXTENT
            ));
        }
        if self.room_count_target == 0 {
            return Err("Room count target must be positive".to_string());
        }
        if self.room_count_target > MAX_ROOM_COUNT_TARGET {
            return Err(format!(
                "Room count target must not exceed {}",
                MAX_ROOM_COUNT_TARGET
            ));
        }
        Ok(())
    }

    /// Deterministic cache key (FNV-1a over the little-endian field bytes)
    pub fn cache_key(&self) -> CacheKey {
        let mut hash = FNV_OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };
        feed(&self.seed.to_le_bytes());
        feed(&self.width.to_le_bytes());
        feed(&self.height.to_le_bytes());
        feed(&self.room_count_target.to_le_bytes());
        feed(&[self.difficulty.discriminant()]);
        CacheKey(hash)
    }

    /// Same dungeon with half the room target, for callers retrying after exhaustion
    pub fn relaxed(&self) -> Self {
        Self {
            room_count_target: (self.room_count_target / 2).max(1),
            ..*self
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Identifier of a cache slot, derived from [`GenerationParameters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub u64);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Layout identifier. Derived from the cache key and the retry salt that
/// produced the layout, so regenerating identical parameters yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutId(pub Uuid);

impl LayoutId {
    pub fn derive(key: CacheKey, salt: u32) -> Self {
        Self(Uuid::from_u64_pair(key.0, u64::from(salt)))
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LayoutId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Axis-aligned rectangle in layout grid cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Twice the center point, kept integral so distances stay exact
    pub fn doubled_center(&self) -> (i64, i64) {
        (
            2 * i64::from(self.x) + i64::from(self.width),
            2 * i64::from(self.y) + i64::from(self.height),
        )
    }

    /// Squared distance between doubled centers
    pub fn distance_squared(&self, other: &Rect) -> i64 {
        let (ax, ay) = self.doubled_center();
        let (bx, by) = other.doubled_center();
        (ax - bx).pow(2) + (ay - by).pow(2)
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.overlaps_with_margin(other, 0)
    }

    /// True when the rectangles, each grown by `margin` cells, intersect
    pub fn overlaps_with_margin(&self, other: &Rect, margin: u32) -> bool {
        self.x < other.right() + margin
            && other.x < self.right() + margin
            && self.y < other.bottom() + margin
            && other.y < self.bottom() + margin
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0 && self.height > 0 && self.right() <= width && self.bottom() <= height
    }
}

/// Purpose of a room once the layout is furnished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RoomKind {
    Normal,
    Entrance,
    Treasure,
    Trap,
    Boss,
}

impl RoomKind {
    pub fn is_special(&self) -> bool {
        !matches!(self, RoomKind::Normal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: u32,
    pub bounds: Rect,
    pub connections: BTreeSet<u32>,
    pub kind: RoomKind,
}

impl Room {
    pub fn new(id: u32, bounds: Rect) -> Self {
        Self {
            id,
            bounds,
            connections: BTreeSet::new(),
            kind: RoomKind::Normal,
        }
    }
}

/// Unvalidated generator output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLayout {
    pub parameters: GenerationParameters,
    pub salt: u32,
    pub rooms: Vec<Room>,
    /// Rooms the generator could not place within its attempt budget
    pub placement_shortfall: u32,
}

/// A validated, immutable dungeon room graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub id: LayoutId,
    pub parameters: GenerationParameters,
    pub rooms: Vec<Room>,
    pub entry_room_id: u32,
    pub exit_room_id: u32,
    pub placement_shortfall: u32,
    pub salt: u32,
    pub created_at: DateTime<Utc>,
}

impl Layout {
    pub fn cache_key(&self) -> CacheKey {
        self.parameters.cache_key()
    }

    pub fn room(&self, id: u32) -> Option<&Room> {
        self.rooms.iter().find(|room| room.id == id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn rooms_of_kind(&self, kind: RoomKind) -> impl Iterator<Item = &Room> {
        self.rooms.iter().filter(move |room| room.kind == kind)
    }

    /// Number of undirected connections
    pub fn edge_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|room| room.connections.len())
            .sum::<usize>()
            / 2
    }
}
