//! Unit reconciliation engine.
//!
//! Owns every live [`Unit`], validates local intents (select, move) and folds remote
//! snapshots into local state. Positions only ever change here in response to a
//! snapshot; a local move is published and then waits for its own echo.
//!
//! All operations are synchronous passes over their input, so a snapshot can never
//! observe a half-mutated unit map.

use crate::board::BoardGeometry;
use crate::types::*;
use crate::unit::{Unit, UnitChange};
use bevy::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Advisory status text for the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    UnitSelected { kind: UnitKind, unit_id: UnitId },
    NotYourUnit,
    CannotMoveUnit,
    SelectUnitFirst,
    SameTile,
    MoveInitiated { kind: UnitKind },
    Deselected,
    MoveFailed { message: String },
    Connecting,
    SessionReady { identity: Identity },
    SessionFailed { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::UnitSelected { kind, unit_id } => {
                write!(f, "Selected: {} (ID: {})", kind, unit_id)
            }
            Notice::NotYourUnit => f.write_str("That's not your unit!"),
            Notice::CannotMoveUnit => f.write_str("You can't move that unit!"),
            Notice::SelectUnitFirst => f.write_str("Click a unit to select it."),
            Notice::SameTile => f.write_str("Unit is already on that tile."),
            Notice::MoveInitiated { kind } => write!(f, "Moving {}...", kind),
            Notice::Deselected => f.write_str("No unit selected."),
            Notice::MoveFailed { message } => write!(f, "Move failed: {}", message),
            Notice::Connecting => f.write_str("Your User ID: Initializing..."),
            Notice::SessionReady { identity } => write!(f, "Your User ID: {}", identity),
            Notice::SessionFailed { message } => write!(f, "Connection failed: {}", message),
        }
    }
}

pub trait NotificationSink {
    fn notify(&mut self, notice: Notice);
}

impl NotificationSink for Vec<Notice> {
    fn notify(&mut self, notice: Notice) {
        self.push(notice);
    }
}

impl NotificationSink for EventWriter<'_, NoticeEvent> {
    fn notify(&mut self, notice: Notice) {
        self.write(NoticeEvent(notice));
    }
}

#[derive(Event, Debug, Clone)]
pub struct NoticeEvent(pub Notice);

/// Outgoing side of the remote state channel, as seen by the engine.
pub trait MovePublisher {
    fn publish(&mut self, unit_id: &str, tile: TileCoord, moved_by: &Identity);
}

impl MovePublisher for EventWriter<'_, PublishMoveEvent> {
    fn publish(&mut self, unit_id: &str, tile: TileCoord, moved_by: &Identity) {
        self.write(PublishMoveEvent {
            unit_id: unit_id.to_string(),
            tile,
            moved_by: moved_by.clone(),
        });
    }
}

/// Rendering collaborator. The engine only ever writes to it.
pub trait UnitRenderer {
    fn spawn_unit(&mut self, unit_id: &str, kind: UnitKind);
    fn place_unit(&mut self, unit_id: &str, tile: TileCoord);
    /// The renderer reports completion through [`ReconciliationEngine::complete_move`].
    fn animate_unit_to(&mut self, unit_id: &str, tile: TileCoord, ticket: u64);
    fn set_selection_visible(&mut self, unit_id: &str, visible: bool);
    fn despawn_unit(&mut self, unit_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCommand {
    Spawn { unit_id: UnitId, kind: UnitKind },
    Change { unit_id: UnitId, change: UnitChange },
    Despawn { unit_id: UnitId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: Vec<UnitId>,
    pub moved: Vec<UnitId>,
    pub removed: Vec<UnitId>,
}

#[derive(Resource, Debug)]
pub struct ReconciliationEngine {
    board: BoardGeometry,
    units: BTreeMap<UnitId, Unit>,
    selected: Option<UnitId>,
    initialized: bool,
    identity: Option<Identity>,
    render_queue: Vec<RenderCommand>,
}

impl ReconciliationEngine {
    pub fn new(board: BoardGeometry) -> Self {
        Self {
            board,
            units: BTreeMap::new(),
            selected: None,
            initialized: false,
            identity: None,
            render_queue: Vec::new(),
        }
    }

    pub fn board(&self) -> &BoardGeometry {
        &self.board
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn unit(&self, unit_id: &str) -> Option<&Unit> {
        self.units.get(unit_id)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn selected_unit_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// First placed unit standing on `tile`, by id order.
    pub fn unit_at(&self, tile: TileCoord) -> Option<&Unit> {
        self.units
            .values()
            .find(|unit| unit.position().is_placed() && unit.position() == tile)
    }

    /// Creates the default units owned by `local`. Runs once; later calls are no-ops.
    pub fn setup_initial_units(&mut self, local: Identity) {
        if self.initialized {
            debug!("Engine already initialized, skipping initial unit setup");
            return;
        }

        self.destroy_all();
        info!("Setting up initial units for user: {}", local);

        for (unit_id, kind, tile) in default_units(self.board.width, self.board.height) {
            let mut unit = Unit::new(unit_id.clone(), kind);
            unit.set_position(tile);
            unit.set_owner(Some(local.as_str().to_string()));
            self.render_queue.push(RenderCommand::Spawn {
                unit_id: unit_id.clone(),
                kind,
            });
            self.units.insert(unit_id, unit);
        }

        self.identity = Some(local);
        self.initialized = true;
        self.collect_changes();
    }

    pub fn select_unit(&mut self, unit_id: &str, sink: &mut impl NotificationSink) {
        let Some(unit) = self.units.get(unit_id) else {
            debug!("Ignoring selection of unknown unit {}", unit_id);
            return;
        };

        if let Some(owner) = unit.owner_id() {
            if Some(owner) != self.identity.as_ref().map(Identity::as_str) {
                debug!("Cannot select unit {} owned by {}", unit_id, owner);
                self.clear_selection();
                sink.notify(Notice::NotYourUnit);
                self.collect_changes();
                return;
            }
        }

        let kind = unit.kind();
        if self.selected.as_deref() != Some(unit_id) {
            self.clear_selection();
        }
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.set_selected(true);
        }
        self.selected = Some(unit_id.to_string());
        sink.notify(Notice::UnitSelected {
            kind,
            unit_id: unit_id.to_string(),
        });
        self.collect_changes();
    }

    pub fn handle_board_click(
        &mut self,
        point: Vec2,
        publisher: &mut impl MovePublisher,
        sink: &mut impl NotificationSink,
    ) {
        if !self.board.is_within_bounds(point) {
            if self.clear_selection() {
                sink.notify(Notice::Deselected);
            }
            self.collect_changes();
            return;
        }

        let target = self.board.space_to_tile(point);
        debug!("Clicked board tile {}", target);

        let Some(unit) = self.selected.as_ref().and_then(|id| self.units.get(id)) else {
            sink.notify(Notice::SelectUnitFirst);
            return;
        };

        let local = self.identity.as_ref().map(Identity::as_str);
        let (Some(local_id), true) = (self.identity.clone(), unit.owner_id() == local) else {
            debug!("Cannot move unit {} owned by {:?}", unit.id(), unit.owner_id());
            self.clear_selection();
            sink.notify(Notice::CannotMoveUnit);
            self.collect_changes();
            return;
        };

        if unit.position() == target {
            sink.notify(Notice::SameTile);
            return;
        }

        info!(
            "Requesting move of unit {} from {} to {}",
            unit.id(),
            unit.position(),
            target
        );
        let kind = unit.kind();
        publisher.publish(unit.id(), target, &local_id);
        sink.notify(Notice::MoveInitiated { kind });

        self.clear_selection();
        self.collect_changes();
    }

    /// Folds a snapshot of the remote `units` mapping into local state.
    ///
    /// Snapshots that arrive before `setup_initial_units` are dropped. Applying the
    /// same snapshot twice leaves the second pass with nothing to do.
    pub fn reconcile(&mut self, remote: &UnitsSnapshot) -> Option<ReconcileSummary> {
        if !self.initialized {
            debug!("Engine not initialized, dropping snapshot");
            return None;
        }

        let mut summary = ReconcileSummary::default();

        for (unit_id, entry) in remote {
            if !self.units.contains_key(unit_id) {
                let kind = UnitKind::from_unit_id(unit_id);
                self.render_queue.push(RenderCommand::Spawn {
                    unit_id: unit_id.clone(),
                    kind,
                });
                self.units
                    .insert(unit_id.clone(), Unit::new(unit_id.clone(), kind));
                summary.created.push(unit_id.clone());
                info!("Created unit {} from snapshot", unit_id);
            }
            let Some(unit) = self.units.get_mut(unit_id) else {
                continue;
            };

            if let Some(moved_by) = &entry.moved_by {
                if unit.owner_id() != Some(moved_by.as_str()) {
                    unit.set_owner(Some(moved_by.clone()));
                }
            } else if unit.owner_id().is_none() {
                unit.set_owner(Some(placeholder_owner(unit_id).to_string()));
            }

            let target = match entry.position {
                Some(tile) if self.board.contains_tile(tile) => tile,
                Some(tile) => {
                    warn!("Ignoring off-board position {} for unit {}", tile, unit_id);
                    continue;
                }
                None => continue,
            };

            if unit.position() == target {
                continue;
            }
            if unit.position().is_placed() {
                debug!("Moving unit {} to {}", unit_id, target);
                unit.begin_move(target);
            } else {
                unit.set_position(target);
            }
            summary.moved.push(unit_id.clone());
        }

        let stale: Vec<UnitId> = self
            .units
            .keys()
            .filter(|id| !remote.contains_key(*id))
            .cloned()
            .collect();
        for unit_id in stale {
            info!("Removing unit {} absent from snapshot", unit_id);
            self.destroy(&unit_id);
            summary.removed.push(unit_id);
        }

        self.collect_changes();
        Some(summary)
    }

    /// Animation callback. Returns false when the ticket belongs to a superseded move.
    pub fn complete_move(&mut self, unit_id: &str, ticket: u64) -> bool {
        self.units
            .get_mut(unit_id)
            .is_some_and(|unit| unit.finish_move(ticket))
    }

    pub fn render_to(&mut self, renderer: &mut impl UnitRenderer) {
        for command in self.render_queue.drain(..) {
            match command {
                RenderCommand::Spawn { unit_id, kind } => renderer.spawn_unit(&unit_id, kind),
                RenderCommand::Change { unit_id, change } => match change {
                    UnitChange::Placed(tile) => renderer.place_unit(&unit_id, tile),
                    UnitChange::MoveStarted { to, ticket } => {
                        renderer.animate_unit_to(&unit_id, to, ticket)
                    }
                    UnitChange::SelectionChanged(visible) => {
                        renderer.set_selection_visible(&unit_id, visible)
                    }
                },
                RenderCommand::Despawn { unit_id } => renderer.despawn_unit(&unit_id),
            }
        }
    }

    fn clear_selection(&mut self) -> bool {
        let Some(previous) = self.selected.take() else {
            return false;
        };
        if let Some(unit) = self.units.get_mut(&previous) {
            unit.set_selected(false);
        }
        true
    }

    fn destroy(&mut self, unit_id: &str) {
        if self.selected.as_deref() == Some(unit_id) {
            self.selected = None;
        }
        if let Some(mut unit) = self.units.remove(unit_id) {
            for change in unit.take_changes() {
                self.render_queue.push(RenderCommand::Change {
                    unit_id: unit_id.to_string(),
                    change,
                });
            }
            self.render_queue.push(RenderCommand::Despawn {
                unit_id: unit_id.to_string(),
            });
        }
    }

    fn destroy_all(&mut self) {
        let ids: Vec<UnitId> = self.units.keys().cloned().collect();
        for unit_id in ids {
            self.destroy(&unit_id);
        }
    }

    fn collect_changes(&mut self) {
        for (unit_id, unit) in &mut self.units {
            for change in unit.take_changes() {
                self.render_queue.push(RenderCommand::Change {
                    unit_id: unit_id.clone(),
                    change,
                });
            }
        }
    }
}
