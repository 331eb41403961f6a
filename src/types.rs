use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub type UnitId = String;

// Board types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    /// Sentinel for a unit that has not been placed on the board yet.
    pub const UNPLACED: TileCoord = TileCoord { x: -1, y: -1 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn is_placed(&self) -> bool {
        *self != Self::UNPLACED
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    A,
    B,
}

impl UnitKind {
    /// Snapshots carry no kind discriminator, so kind is inferred from the id:
    /// `unit_1` is kind A and every other id is kind B.
    pub fn from_unit_id(unit_id: &str) -> Self {
        if unit_id == "unit_1" {
            UnitKind::A
        } else {
            UnitKind::B
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            UnitKind::A => "UNIT_A",
            UnitKind::B => "UNIT_B",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Session document (wire format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub id: String,
    pub created_at: i64,
    #[serde(default)]
    pub players: HashMap<String, PlayerEntry>,
    #[serde(default)]
    pub units: HashMap<String, RemoteUnit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntry {
    pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUnit {
    pub x: i32,
    pub y: i32,
    pub updated_at: i64,
    pub moved_by: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub unit_type: Option<String>,
}

impl SessionDocument {
    /// Fresh session record holding the creator and the default unit set.
    pub fn seeded(
        session_id: &str,
        creator: &Identity,
        now_ms: i64,
        seeds: &[(UnitId, UnitKind, TileCoord)],
    ) -> Self {
        let mut players = HashMap::new();
        players.insert(
            creator.as_str().to_string(),
            PlayerEntry { joined_at: now_ms },
        );

        let units = seeds
            .iter()
            .map(|(unit_id, kind, tile)| {
                (
                    unit_id.clone(),
                    RemoteUnit {
                        x: tile.x,
                        y: tile.y,
                        updated_at: now_ms,
                        moved_by: creator.as_str().to_string(),
                        unit_type: Some(kind.type_tag().to_string()),
                    },
                )
            })
            .collect();

        Self {
            id: session_id.to_string(),
            created_at: now_ms,
            players,
            units,
        }
    }
}

/// One unit as seen in a snapshot, after lenient decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSnapshot {
    pub position: Option<TileCoord>,
    pub moved_by: Option<String>,
}

/// The `units` mapping of a session document at one point in time.
pub type UnitsSnapshot = BTreeMap<UnitId, UnitSnapshot>;

/// Decodes the `units` mapping of a plain-JSON session document.
///
/// Returns `None` when `units` is missing or not an object; such a document carries
/// no unit state at all. A malformed entry keeps its id with whatever fields could
/// be read.
pub fn decode_units(document: &serde_json::Value) -> Option<UnitsSnapshot> {
    let units = document.get("units")?.as_object()?;

    let snapshot = units
        .iter()
        .map(|(unit_id, entry)| {
            let coord = |key: &str| {
                entry
                    .get(key)
                    .and_then(|v| v.as_i64())
                    .and_then(|v| i32::try_from(v).ok())
            };
            let position = match (coord("x"), coord("y")) {
                (Some(x), Some(y)) => Some(TileCoord::new(x, y)),
                _ => None,
            };
            let moved_by = entry
                .get("movedBy")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            (unit_id.clone(), UnitSnapshot { position, moved_by })
        })
        .collect();
    Some(snapshot)
}

// Events
#[derive(Event, Debug, Clone)]
pub struct SessionReadyEvent {
    pub identity: Identity,
}

#[derive(Event, Debug, Clone)]
pub struct BootstrapFailedEvent {
    pub message: String,
}

#[derive(Event, Debug, Clone)]
pub struct PointerDownEvent {
    pub point: Vec2,
}

#[derive(Event, Debug, Clone)]
pub struct MoveFinishedEvent {
    pub unit_id: UnitId,
    pub ticket: u64,
}

#[derive(Event, Debug, Clone)]
pub struct PublishMoveEvent {
    pub unit_id: UnitId,
    pub tile: TileCoord,
    pub moved_by: Identity,
}

// Components
#[derive(Component)]
pub struct GameCamera;

// Error types
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Auth error: {message}")]
    Auth { message: String },

    #[error("Backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    #[error("Malformed document: {message}")]
    MalformedDocument { message: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

// Constants
pub const DEFAULT_SESSION_ID: &str = "defaultGame";
pub const DEFAULT_BOARD_WIDTH: u32 = 8;
pub const DEFAULT_BOARD_HEIGHT: u32 = 8;
pub const DEFAULT_CELL_SIZE: f32 = 64.0;

/// Default units and their starting tiles on a board of the given size.
pub fn default_units(board_width: u32, board_height: u32) -> Vec<(UnitId, UnitKind, TileCoord)> {
    let far_x = board_width.saturating_sub(1).min(7) as i32;
    let far_y = board_height.saturating_sub(1).min(7) as i32;
    vec![
        ("unit_1".to_string(), UnitKind::A, TileCoord::new(0, 0)),
        ("unit_2".to_string(), UnitKind::B, TileCoord::new(far_x, far_y)),
    ]
}

/// Owner assigned to a unit first seen without any ownership information.
pub fn placeholder_owner(unit_id: &str) -> &'static str {
    if unit_id == "unit_1" {
        "player_1_placeholder"
    } else {
        "player_2_placeholder"
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
