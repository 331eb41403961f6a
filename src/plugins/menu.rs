use crate::menu::*;
use bevy::prelude::*;
use bevy_egui::EguiPrimaryContextPass;

pub struct MenuPlugin;

impl Plugin for MenuPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, setup_menu)
            .add_systems(EguiPrimaryContextPass, menu_ui_system);
    }
}
