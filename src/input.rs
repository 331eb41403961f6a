use crate::engine::{MovePublisher, NoticeEvent, NotificationSink, ReconciliationEngine};
use crate::menu::MenuState;
use crate::rendering::world_to_space;
use crate::types::*;
use bevy::prelude::*;
use bevy::window::PrimaryWindow;
use bevy_egui::EguiContexts;

/// Routes a pointer press to the engine.
///
/// A press on a tile holding a unit is a selection attempt; any other press, including
/// one outside the board, is a board click.
pub struct SelectionController;

impl SelectionController {
    pub fn pointer_down(
        engine: &mut ReconciliationEngine,
        point: Vec2,
        publisher: &mut impl MovePublisher,
        sink: &mut impl NotificationSink,
    ) {
        let board = *engine.board();
        if board.is_within_bounds(point) {
            let tile = board.space_to_tile(point);
            if let Some(unit_id) = engine.unit_at(tile).map(|unit| unit.id().to_string()) {
                engine.select_unit(&unit_id, sink);
                return;
            }
        }
        engine.handle_board_click(point, publisher, sink);
    }
}

pub fn pointer_input_system(
    mouse_button_input: Res<ButtonInput<MouseButton>>,
    windows: Query<&Window, With<PrimaryWindow>>,
    cameras: Query<(&Camera, &GlobalTransform), With<GameCamera>>,
    menu_state: Res<MenuState>,
    mut contexts: EguiContexts,
    mut pointer_events: EventWriter<PointerDownEvent>,
    engine: Res<ReconciliationEngine>,
) -> Result {
    if !mouse_button_input.just_pressed(MouseButton::Left) {
        return Ok(());
    }
    if menu_state.show_menu && contexts.ctx_mut()?.wants_pointer_input() {
        return Ok(());
    }

    let Ok(window) = windows.single() else {
        return Ok(());
    };
    let Ok((camera, camera_transform)) = cameras.single() else {
        return Ok(());
    };
    let Some(cursor) = window.cursor_position() else {
        return Ok(());
    };
    let Ok(world) = camera.viewport_to_world_2d(camera_transform, cursor) else {
        return Ok(());
    };

    let point = world_to_space(world, engine.board());
    pointer_events.write(PointerDownEvent { point });
    Ok(())
}

pub fn handle_pointer_down(
    mut pointer_events: EventReader<PointerDownEvent>,
    mut engine: ResMut<ReconciliationEngine>,
    mut publisher: EventWriter<PublishMoveEvent>,
    mut notices: EventWriter<NoticeEvent>,
) {
    for event in pointer_events.read() {
        if !engine.is_initialized() {
            continue;
        }
        SelectionController::pointer_down(&mut engine, event.point, &mut publisher, &mut notices);
    }
}

pub fn keyboard_input_system(
    keyboard_input: Res<ButtonInput<KeyCode>>,
    mut menu_state: ResMut<MenuState>,
) {
    if keyboard_input.just_pressed(KeyCode::F1) {
        menu_state.show_menu = !menu_state.show_menu;
        info!("Debug panel: {}", menu_state.show_menu);
    }
}
