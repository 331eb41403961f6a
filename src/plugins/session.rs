use super::FrameSet;
use crate::session::*;
use bevy::prelude::*;
use bevy_tokio_tasks::TokioTasksRuntime;

pub struct SessionPlugin;

impl Plugin for SessionPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(Startup, (setup_session, start_bootstrap).chain())
            .add_systems(
                Update,
                (
                    handle_bootstrap_progress::<TokioTasksRuntime>.in_set(FrameSet::Session),
                    handle_publish_requests.after(FrameSet::Input),
                    handle_publish_tasks,
                    teardown_session,
                ),
            );
    }
}
