use crate::bootstrap::{BootstrapState, SessionBootstrap};
use crate::config::AppConfig;
use crate::engine::NoticeEvent;
use bevy::prelude::*;

#[derive(Component)]
pub struct IdentityText;

#[derive(Component)]
pub struct StatusText;

pub fn setup_ui(mut commands: Commands, app_config: Res<AppConfig>) {
    let font_size = app_config.ui.font_size;

    commands
        .spawn(Node {
            width: Val::Percent(100.0),
            height: Val::Percent(100.0),
            position_type: PositionType::Absolute,
            ..default()
        })
        .with_children(|parent| {
            parent.spawn((
                Text::new("Your User ID: Initializing..."),
                TextFont {
                    font_size,
                    ..default()
                },
                TextColor(Color::WHITE),
                Node {
                    position_type: PositionType::Absolute,
                    top: Val::Px(10.0),
                    left: Val::Px(10.0),
                    ..default()
                },
                IdentityText,
            ));

            parent.spawn((
                Text::new("Click a unit to select it."),
                TextFont {
                    font_size,
                    ..default()
                },
                TextColor(Color::WHITE),
                Node {
                    position_type: PositionType::Absolute,
                    top: Val::Px(10.0 + font_size * 1.5),
                    left: Val::Px(10.0),
                    ..default()
                },
                StatusText,
            ));

            parent.spawn((
                Text::new("Left click: select / move | F1: debug panel"),
                TextFont {
                    font_size: font_size * 0.8,
                    ..default()
                },
                TextColor(Color::srgb(0.9, 0.9, 0.9)),
                Node {
                    position_type: PositionType::Absolute,
                    bottom: Val::Px(10.0),
                    left: Val::Px(10.0),
                    ..default()
                },
            ));
        });
}

/// Shows the newest notice of the frame.
pub fn update_status_text(
    mut notice_events: EventReader<NoticeEvent>,
    mut query: Query<&mut Text, With<StatusText>>,
) {
    let Some(NoticeEvent(notice)) = notice_events.read().last() else {
        return;
    };
    for mut text in &mut query {
        text.0 = notice.to_string();
    }
}

pub fn update_identity_text(
    bootstrap: Res<SessionBootstrap>,
    mut query: Query<(&mut Text, &mut TextColor), With<IdentityText>>,
) {
    if !bootstrap.is_changed() {
        return;
    }
    for (mut text, mut color) in &mut query {
        match (bootstrap.state(), bootstrap.current_identity()) {
            (BootstrapState::Ready, Some(identity)) => {
                text.0 = format!("Your User ID: {}", identity);
                color.0 = Color::WHITE;
            }
            (BootstrapState::Failed, _) => {
                text.0 = format!(
                    "Connection failed: {}",
                    bootstrap.last_error().unwrap_or("unknown error")
                );
                color.0 = Color::srgb(1.0, 0.0, 0.0);
            }
            (state, _) => {
                text.0 = format!("Your User ID: {}", state);
                color.0 = Color::srgb(1.0, 1.0, 0.0);
            }
        }
    }
}
