use crate::types::*;

/// What changed on a unit since the renderer last looked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitChange {
    Placed(TileCoord),
    MoveStarted { to: TileCoord, ticket: u64 },
    SelectionChanged(bool),
}

/// A movable piece. Holds state only; the engine validates every mutation.
#[derive(Debug, Clone)]
pub struct Unit {
    id: UnitId,
    kind: UnitKind,
    position: TileCoord,
    owner_id: Option<String>,
    selected: bool,
    is_animating: bool,
    move_ticket: u64,
    changes: Vec<UnitChange>,
}

impl Unit {
    pub fn new(id: impl Into<UnitId>, kind: UnitKind) -> Self {
        Self {
            id: id.into(),
            kind,
            position: TileCoord::UNPLACED,
            owner_id: None,
            selected: false,
            is_animating: false,
            move_ticket: 0,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn position(&self) -> TileCoord {
        self.position
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_animating(&self) -> bool {
        self.is_animating
    }

    /// Places the unit without animation.
    pub fn set_position(&mut self, tile: TileCoord) {
        self.position = tile;
        self.is_animating = false;
        self.changes.push(UnitChange::Placed(tile));
    }

    /// Starts (or retargets) an animated move. The position is the target from the
    /// start; `is_animating` stays set until the matching ticket completes.
    pub fn begin_move(&mut self, tile: TileCoord) -> u64 {
        self.move_ticket += 1;
        self.position = tile;
        self.is_animating = true;
        self.changes.push(UnitChange::MoveStarted {
            to: tile,
            ticket: self.move_ticket,
        });
        self.move_ticket
    }

    /// Returns false for a stale ticket from a superseded animation.
    pub fn finish_move(&mut self, ticket: u64) -> bool {
        if !self.is_animating || ticket != self.move_ticket {
            return false;
        }
        self.is_animating = false;
        true
    }

    pub fn set_owner(&mut self, owner_id: Option<String>) {
        self.owner_id = owner_id;
    }

    pub fn set_selected(&mut self, selected: bool) {
        if self.selected != selected {
            self.selected = selected;
            self.changes.push(UnitChange::SelectionChanged(selected));
        }
    }

    pub fn take_changes(&mut self) -> Vec<UnitChange> {
        std::mem::take(&mut self.changes)
    }
}
