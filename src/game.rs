use crate::board::BoardGeometry;
use crate::channel::RemoteStateChannel;
use crate::config::AppConfig;
use crate::engine::ReconciliationEngine;
use crate::types::*;
use bevy::prelude::*;
use tracing::debug;

pub fn board_from_config(config: &AppConfig) -> BoardGeometry {
    BoardGeometry::centered(
        config.viewport(),
        config.board.cell_size,
        config.board.width,
        config.board.height,
    )
}

pub fn setup_game(mut commands: Commands, board: Res<BoardGeometry>) {
    info!(
        "Board is {}x{} tiles of {}px at {:?}",
        board.width, board.height, board.cell_size, board.origin
    );
    commands.insert_resource(ReconciliationEngine::new(*board));
}

pub fn on_session_ready(
    mut ready_events: EventReader<SessionReadyEvent>,
    mut engine: ResMut<ReconciliationEngine>,
) {
    for event in ready_events.read() {
        engine.setup_initial_units(event.identity.clone());
    }
}

/// Applies the newest pending snapshot. Snapshots stay queued until the engine has
/// its initial units.
pub fn apply_snapshots(
    mut channel: ResMut<RemoteStateChannel>,
    mut engine: ResMut<ReconciliationEngine>,
) {
    if !engine.is_initialized() {
        return;
    }
    let Some(snapshot) = channel.drain_latest() else {
        return;
    };
    if let Some(summary) = engine.reconcile(&snapshot) {
        debug!(
            "Reconciled snapshot: {} created, {} moved, {} removed",
            summary.created.len(),
            summary.moved.len(),
            summary.removed.len()
        );
    }
}

pub fn handle_move_finished(
    mut finished_events: EventReader<MoveFinishedEvent>,
    mut engine: ResMut<ReconciliationEngine>,
) {
    for event in finished_events.read() {
        if !engine.complete_move(&event.unit_id, event.ticket) {
            debug!(
                "Ignoring stale animation ticket {} for unit {}",
                event.ticket, event.unit_id
            );
        }
    }
}
