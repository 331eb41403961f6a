mod board;
mod bootstrap;
mod channel;
mod config;
mod engine;
mod firestore;
mod game;
mod input;
mod memory;
mod menu;
mod plugins;
mod rendering;
mod session;
mod types;
mod ui;
mod unit;

use bevy::diagnostic::FrameTimeDiagnosticsPlugin;
use bevy::prelude::*;
use bevy_egui::EguiPlugin;
use bevy_tokio_tasks::TokioTasksPlugin;
use chrono::Local;
use config::AppConfig;
use engine::NoticeEvent;
use plugins::*;
use std::fs;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use types::*;

const ENGINE_DIRECTIVES: &str = "wgpu=off,\
    naga=off,\
    bevy_render=info,\
    bevy_ecs=info,\
    bevy_app=info,\
    bevy_winit=info,\
    bevy_asset=info,\
    bevy_ui=info,\
    bevy=info";

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let config_path = Path::new("config.toml");
    let app_config = AppConfig::load_or_create(config_path)?;

    // Ensure logs directory exists
    fs::create_dir_all("logs")?;

    // Date and time for log file
    let date = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    let general_log =
        RollingFileAppender::new(Rotation::NEVER, "logs", format!("{}_general.log", date));
    let session_log =
        RollingFileAppender::new(Rotation::NEVER, "logs", format!("{}_session.log", date));

    let base = format!("{},session=info,{}", app_config.debug.log_level, ENGINE_DIRECTIVES);

    let filter_general = EnvFilter::new(&base).add_directive("session=off".parse()?);
    let filter_session = EnvFilter::new("session=debug");
    let filter_stdout = EnvFilter::new(&base);

    let general_layer = fmt::layer()
        .with_writer(general_log)
        .with_ansi(false)
        .with_filter(filter_general);

    let session_layer = fmt::layer()
        .with_writer(session_log)
        .with_ansi(false)
        .with_filter(filter_session);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(filter_stdout);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(general_layer)
        .with(session_layer)
        .init();

    let board = game::board_from_config(&app_config);

    App::new()
        .add_plugins(
            DefaultPlugins
                .set(WindowPlugin {
                    primary_window: Some(Window {
                        title: "Board Sync".to_string(),
                        resolution: (
                            app_config.board.viewport_width,
                            app_config.board.viewport_height,
                        )
                            .into(),
                        ..default()
                    }),
                    ..default()
                })
                .disable::<bevy::log::LogPlugin>(),
        )
        .add_plugins(FrameTimeDiagnosticsPlugin::default())
        .add_plugins(TokioTasksPlugin::default())
        .add_plugins(EguiPlugin::default())
        // Custom Plugins
        .add_plugins((
            SessionPlugin,
            InputPlugin,
            GamePlugin,
            RenderingPlugin,
            UiPlugin,
            MenuPlugin,
        ))
        .configure_sets(
            Update,
            (
                FrameSet::Session,
                FrameSet::Input,
                FrameSet::Game,
                FrameSet::Render,
            )
                .chain(),
        )
        // Resources
        .insert_resource(app_config)
        .insert_resource(board)
        // Events
        .add_event::<SessionReadyEvent>()
        .add_event::<BootstrapFailedEvent>()
        .add_event::<PointerDownEvent>()
        .add_event::<PublishMoveEvent>()
        .add_event::<MoveFinishedEvent>()
        .add_event::<NoticeEvent>()
        .run();

    Ok(())
}
