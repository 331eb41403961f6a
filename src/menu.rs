use crate::bootstrap::SessionBootstrap;
use crate::channel::RemoteStateChannel;
use crate::config::AppConfig;
use crate::engine::ReconciliationEngine;
use crate::rendering::UnitEntities;
use bevy::diagnostic::{DiagnosticsStore, FrameTimeDiagnosticsPlugin};
use bevy::prelude::*;
use bevy_egui::{EguiContexts, egui};

#[derive(Resource, Default)]
pub struct MenuState {
    pub show_menu: bool,
}

pub fn setup_menu(mut commands: Commands, app_config: Res<AppConfig>) {
    commands.insert_resource(MenuState {
        show_menu: app_config.ui.show_debug_panel,
    });
}

pub fn menu_ui_system(
    mut contexts: EguiContexts,
    menu_state: Res<MenuState>,
    app_config: Res<AppConfig>,
    bootstrap: Res<SessionBootstrap>,
    channel: Res<RemoteStateChannel>,
    engine: Res<ReconciliationEngine>,
    unit_entities: Res<UnitEntities>,
    diagnostics: Res<DiagnosticsStore>,
) -> Result {
    if !menu_state.show_menu {
        return Ok(());
    }

    let ctx = contexts.ctx_mut()?;

    let mut style = (*ctx.style()).clone();
    style.text_styles.insert(
        egui::TextStyle::Body,
        egui::FontId::new(app_config.ui.font_size, egui::FontFamily::Proportional),
    );
    style.text_styles.insert(
        egui::TextStyle::Heading,
        egui::FontId::new(
            app_config.ui.font_size * 1.2,
            egui::FontFamily::Proportional,
        ),
    );
    ctx.set_style(style);

    egui::Window::new("Session")
        .default_width(360.0)
        .resizable(true)
        .collapsible(true)
        .show(ctx, |ui| {
            ui.collapsing("Connection", |ui| {
                if let Some(fps) = diagnostics.get(&FrameTimeDiagnosticsPlugin::FPS) {
                    if let Some(average) = fps.average() {
                        ui.label(format!("FPS: {:.1}", average));
                    }
                }
                ui.label(format!("Backend: {:?}", app_config.backend.kind));
                ui.label(format!("Session: {}", channel.session_id()));
                ui.label(format!("State: {}", bootstrap.state()));
                match bootstrap.current_identity() {
                    Some(identity) => ui.label(format!("Identity: {}", identity)),
                    None => ui.label("Identity: -"),
                };
                if let Some(error) = bootstrap.last_error() {
                    ui.colored_label(egui::Color32::RED, error);
                }
                if channel.is_subscribed() {
                    ui.colored_label(egui::Color32::GREEN, "Subscribed");
                } else {
                    ui.colored_label(egui::Color32::YELLOW, "Not subscribed");
                }
            });

            ui.separator();

            ui.collapsing("Units", |ui| {
                ui.label(format!("Sprites: {}", unit_entities.len()));
                ui.label(format!(
                    "Selected: {}",
                    engine.selected_unit_id().unwrap_or("-")
                ));
                egui::Grid::new("units_grid").striped(true).show(ui, |ui| {
                    ui.strong("Id");
                    ui.strong("Kind");
                    ui.strong("Tile");
                    ui.strong("Owner");
                    ui.end_row();
                    for unit in engine.units() {
                        ui.label(unit.id());
                        ui.label(unit.kind().to_string());
                        let tile = if unit.position().is_placed() {
                            unit.position().to_string()
                        } else {
                            "unplaced".to_string()
                        };
                        if !unit_entities.contains(unit.id()) {
                            ui.label(format!("{} (no sprite)", tile));
                        } else if unit.is_animating() {
                            ui.label(format!("{} (moving)", tile));
                        } else {
                            ui.label(tile);
                        }
                        ui.label(unit.owner_id().unwrap_or("-"));
                        ui.end_row();
                    }
                });
            });
        });

    Ok(())
}
