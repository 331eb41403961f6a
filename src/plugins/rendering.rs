use super::FrameSet;
use crate::rendering::*;
use bevy::prelude::*;

pub struct RenderingPlugin;

impl Plugin for RenderingPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, setup_board_scene).add_systems(
            Update,
            (render_units, animate_units)
                .chain()
                .in_set(FrameSet::Render),
        );
    }
}
