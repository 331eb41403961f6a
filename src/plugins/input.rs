use super::FrameSet;
use crate::input::*;
use bevy::prelude::*;

pub struct InputPlugin;

impl Plugin for InputPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(
            Update,
            (
                keyboard_input_system,
                (pointer_input_system, handle_pointer_down)
                    .chain()
                    .in_set(FrameSet::Input),
            ),
        );
    }
}
