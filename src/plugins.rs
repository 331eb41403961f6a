mod game;
mod input;
mod menu;
mod rendering;
mod session;
mod ui;

pub use game::GamePlugin;
pub use input::InputPlugin;
pub use menu::MenuPlugin;
pub use rendering::RenderingPlugin;
pub use session::SessionPlugin;
pub use ui::UiPlugin;

use bevy::prelude::*;

/// Per-frame ordering shared by the plugins: remote state first, then local input,
/// then the engine, then drawing.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameSet {
    Session,
    Input,
    Game,
    Render,
}
