use super::FrameSet;
use crate::game::*;
use bevy::prelude::*;

pub struct GamePlugin;

impl Plugin for GamePlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, setup_game).add_systems(
            Update,
            (on_session_ready, apply_snapshots, handle_move_finished)
                .chain()
                .in_set(FrameSet::Game),
        );
    }
}
