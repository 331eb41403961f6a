use crate::bootstrap::*;
use crate::channel::{RemoteStateChannel, SessionStore, TaskSpawner};
use crate::config::{AppConfig, BackendKind};
use crate::engine::{Notice, NoticeEvent};
use crate::firestore::{FirebaseAuth, FirestoreStore};
use crate::memory::{MemoryIdentityProvider, MemorySessionStore};
use crate::types::*;
use bevy::app::AppExit;
use bevy::prelude::*;
use bevy_tokio_tasks::TokioTasksRuntime;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The identity and storage services chosen at startup.
#[derive(Resource, Clone)]
pub struct SessionBackend {
    pub provider: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn SessionStore>,
}

impl SessionBackend {
    pub fn from_config(config: &AppConfig) -> SyncResult<Self> {
        match config.backend.kind {
            BackendKind::Firestore => {
                let auth = Arc::new(FirebaseAuth::new(&config.backend)?);
                let store = FirestoreStore::new(&config.backend, Arc::clone(&auth))?;
                info!(target: "session", "Using Firestore project {}", config.backend.project_id);
                Ok(Self {
                    provider: auth,
                    store: Arc::new(store),
                })
            }
            BackendKind::Memory => {
                // A configured token doubles as a fixed identity when running offline.
                let provider = if config.backend.custom_token.is_empty() {
                    MemoryIdentityProvider::new()
                } else {
                    MemoryIdentityProvider::with_identity(Identity::new(
                        config.backend.custom_token.clone(),
                    ))
                };
                info!(target: "session", "Using in-memory session store");
                Ok(Self {
                    provider: Arc::new(provider),
                    store: Arc::new(MemorySessionStore::new()),
                })
            }
        }
    }
}

#[derive(Resource)]
pub struct BootstrapReceiver(mpsc::UnboundedReceiver<BootstrapProgress>);

#[derive(Component)]
pub struct SessionTask<T> {
    pub handle: Option<JoinHandle<T>>,
}

fn spawn_session_task<T, Fut>(commands: &mut Commands, spawner: &impl TaskSpawner, fut: Fut)
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let handle = spawner.spawn_task(fut);
    commands.spawn(SessionTask {
        handle: Some(handle),
    });
}

/// Takes the output of a finished task, or `None` while it is still running.
fn take_finished<T>(task: &mut SessionTask<T>) -> Option<Result<T, tokio::task::JoinError>> {
    if !task.handle.as_ref()?.is_finished() {
        return None;
    }
    let handle = task.handle.take()?;
    Some(futures::executor::block_on(handle))
}

pub fn setup_session(mut commands: Commands, config: Res<AppConfig>) -> Result {
    let backend = SessionBackend::from_config(&config)?;
    commands.insert_resource(RemoteStateChannel::new(
        Arc::clone(&backend.store),
        config.session.session_id.clone(),
    ));
    commands.insert_resource(backend);

    let mut bootstrap = SessionBootstrap::default();
    let session_id = config.session.session_id.clone();
    bootstrap.on_ready(move |identity| {
        info!(target: "session", "Playing session {} as {}", session_id, identity);
    });
    commands.insert_resource(bootstrap);
    Ok(())
}

pub fn start_bootstrap(
    mut commands: Commands,
    mut bootstrap: ResMut<SessionBootstrap>,
    backend: Res<SessionBackend>,
    config: Res<AppConfig>,
    runtime: Res<TokioTasksRuntime>,
    mut notices: EventWriter<NoticeEvent>,
) {
    if !bootstrap.start() {
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    commands.insert_resource(BootstrapReceiver(rx));

    let options = JoinOptions {
        session_id: config.session.session_id.clone(),
        seeds: default_units(config.board.width, config.board.height),
    };
    info!(target: "session", "Starting session bootstrap for {}", options.session_id);
    runtime.spawn_task(run_bootstrap(
        Arc::clone(&backend.provider),
        Arc::clone(&backend.store),
        options,
        tx,
    ));
    notices.write(NoticeEvent(Notice::Connecting));
}

fn report_failure(
    bootstrap: &SessionBootstrap,
    failed_events: &mut EventWriter<BootstrapFailedEvent>,
    notices: &mut EventWriter<NoticeEvent>,
) {
    let message = bootstrap.last_error().unwrap_or("unknown error").to_string();
    error!(target: "session", "Session bootstrap failed: {}", message);
    notices.write(NoticeEvent(Notice::SessionFailed {
        message: message.clone(),
    }));
    failed_events.write(BootstrapFailedEvent { message });
}

/// Generic over the runtime resource so the snapshot subscription can be spawned on
/// any [`TaskSpawner`]; the app uses [`TokioTasksRuntime`].
pub fn handle_bootstrap_progress<S: TaskSpawner + Resource>(
    mut commands: Commands,
    receiver: Option<ResMut<BootstrapReceiver>>,
    mut bootstrap: ResMut<SessionBootstrap>,
    mut channel: ResMut<RemoteStateChannel>,
    runtime: Res<S>,
    mut ready_events: EventWriter<SessionReadyEvent>,
    mut failed_events: EventWriter<BootstrapFailedEvent>,
    mut notices: EventWriter<NoticeEvent>,
) {
    let Some(mut receiver) = receiver else {
        return;
    };

    loop {
        let progress = match receiver.0.try_recv() {
            Ok(progress) => progress,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                if matches!(
                    bootstrap.state(),
                    BootstrapState::Authenticating
                        | BootstrapState::Authenticated
                        | BootstrapState::SessionJoining
                ) {
                    bootstrap.fail("Bootstrap task stopped before the session was joined");
                    report_failure(&bootstrap, &mut failed_events, &mut notices);
                }
                commands.remove_resource::<BootstrapReceiver>();
                break;
            }
        };

        let failed = matches!(progress, BootstrapProgress::Failed(_));
        if let Some(stream) = bootstrap.apply(progress) {
            channel.subscribe(stream, &*runtime);
            if let Some(identity) = bootstrap.mark_ready() {
                info!(target: "session", "Session {} ready for {}", channel.session_id(), identity);
                notices.write(NoticeEvent(Notice::SessionReady {
                    identity: identity.clone(),
                }));
                ready_events.write(SessionReadyEvent { identity });
            }
        } else if failed && bootstrap.state() == BootstrapState::Failed {
            report_failure(&bootstrap, &mut failed_events, &mut notices);
        }
    }
}

pub fn handle_publish_requests(
    mut commands: Commands,
    mut publish_events: EventReader<PublishMoveEvent>,
    channel: Res<RemoteStateChannel>,
    runtime: Res<TokioTasksRuntime>,
) {
    for event in publish_events.read() {
        let publish = channel.publish(&event.unit_id, event.tile, &event.moved_by);
        spawn_session_task(&mut commands, &*runtime, publish);
    }
}

pub fn handle_publish_tasks(
    mut commands: Commands,
    mut query: Query<(Entity, &mut SessionTask<SyncResult<()>>)>,
    mut notices: EventWriter<NoticeEvent>,
) {
    for (entity, mut task) in &mut query {
        let Some(result) = take_finished(&mut task) else {
            continue;
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(target: "session", "Error updating unit position: {e}");
                notices.write(NoticeEvent(Notice::MoveFailed {
                    message: e.to_string(),
                }));
            }
            Err(e) => {
                error!(target: "session", "Task join error: {e}");
            }
        }
        commands.entity(entity).despawn();
    }
}

pub fn teardown_session(
    mut exit_events: EventReader<AppExit>,
    mut channel: ResMut<RemoteStateChannel>,
) {
    if exit_events.read().next().is_some() && channel.is_subscribed() {
        info!(target: "session", "Shutting down, releasing session subscription");
        channel.unsubscribe();
    }
}
