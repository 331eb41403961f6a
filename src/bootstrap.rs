//! Identity and session bootstrap.
//!
//! `UNAUTHENTICATED -> AUTHENTICATING -> AUTHENTICATED -> SESSION_JOINING -> READY`,
//! with `FAILED` reachable from any in-flight state. The async half
//! ([`run_bootstrap`]) performs the steps and reports [`BootstrapProgress`]; the sync
//! half ([`SessionBootstrap`]) applies them on the main schedule.

use crate::channel::{SessionStore, SnapshotStream};
use crate::types::*;
use bevy::prelude::*;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub trait IdentityProvider: Send + Sync {
    /// Identity of an existing sign-in, if there is one.
    fn current_identity(&self) -> BoxFuture<'_, SyncResult<Option<Identity>>>;

    fn create_anonymous_identity(&self) -> BoxFuture<'_, SyncResult<Identity>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    SessionJoining,
    Ready,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BootstrapState::Unauthenticated => "Unauthenticated",
            BootstrapState::Authenticating => "Authenticating...",
            BootstrapState::Authenticated => "Authenticated",
            BootstrapState::SessionJoining => "Joining session...",
            BootstrapState::Ready => "Ready",
            BootstrapState::Failed => "Failed",
        };
        f.write_str(label)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("Authentication failed: {0}")]
    Authentication(#[source] SyncError),

    #[error("Joining session failed: {0}")]
    SessionJoin(#[source] SyncError),
}

pub enum BootstrapProgress {
    Authenticated(Identity),
    Joining,
    Joined(SnapshotStream),
    Failed(BootstrapError),
}

impl fmt::Debug for BootstrapProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapProgress::Authenticated(identity) => {
                f.debug_tuple("Authenticated").field(identity).finish()
            }
            BootstrapProgress::Joining => f.write_str("Joining"),
            BootstrapProgress::Joined(_) => f.write_str("Joined"),
            BootstrapProgress::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

type ReadyCallback = Box<dyn FnOnce(&Identity) + Send + Sync>;

#[derive(Resource)]
pub struct SessionBootstrap {
    state: BootstrapState,
    identity: Option<Identity>,
    last_error: Option<String>,
    ready_callbacks: Vec<ReadyCallback>,
}

impl Default for SessionBootstrap {
    fn default() -> Self {
        Self {
            state: BootstrapState::Unauthenticated,
            identity: None,
            last_error: None,
            ready_callbacks: Vec::new(),
        }
    }
}

impl SessionBootstrap {
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn current_identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns true when the caller should launch [`run_bootstrap`]; every later call,
    /// including ones made while a bootstrap is in flight or finished, is a no-op.
    pub fn start(&mut self) -> bool {
        if self.state != BootstrapState::Unauthenticated {
            return false;
        }
        self.state = BootstrapState::Authenticating;
        true
    }

    /// Runs `callback` once the session is ready, or right away if it already is.
    pub fn on_ready(&mut self, callback: impl FnOnce(&Identity) + Send + Sync + 'static) {
        match (&self.state, &self.identity) {
            (BootstrapState::Ready, Some(identity)) => callback(identity),
            _ => self.ready_callbacks.push(Box::new(callback)),
        }
    }

    /// Applies one progress report. Returns the snapshot stream when the join
    /// completed and the caller has to subscribe before calling [`Self::mark_ready`].
    pub fn apply(&mut self, progress: BootstrapProgress) -> Option<SnapshotStream> {
        match progress {
            BootstrapProgress::Authenticated(identity) => {
                if self.state == BootstrapState::Authenticating {
                    self.identity = Some(identity);
                    self.state = BootstrapState::Authenticated;
                }
                None
            }
            BootstrapProgress::Joining => {
                if self.state == BootstrapState::Authenticated {
                    self.state = BootstrapState::SessionJoining;
                }
                None
            }
            BootstrapProgress::Joined(stream) => {
                (self.state == BootstrapState::SessionJoining).then_some(stream)
            }
            BootstrapProgress::Failed(e) => {
                if matches!(
                    self.state,
                    BootstrapState::Authenticating
                        | BootstrapState::Authenticated
                        | BootstrapState::SessionJoining
                ) {
                    self.state = BootstrapState::Failed;
                    self.last_error = Some(e.to_string());
                }
                None
            }
        }
    }

    /// Moves `SESSION_JOINING -> READY` and fires ready callbacks. Only the first
    /// call has any effect.
    pub fn mark_ready(&mut self) -> Option<Identity> {
        if self.state != BootstrapState::SessionJoining {
            return None;
        }
        let identity = self.identity.clone()?;
        self.state = BootstrapState::Ready;
        for callback in self.ready_callbacks.drain(..) {
            callback(&identity);
        }
        Some(identity)
    }

    /// Failure that happened on the main schedule, e.g. while subscribing.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state != BootstrapState::Ready {
            self.state = BootstrapState::Failed;
            self.last_error = Some(message.into());
        }
    }
}

pub async fn authenticate(provider: &dyn IdentityProvider) -> Result<Identity, BootstrapError> {
    match provider.current_identity().await {
        Ok(Some(identity)) => {
            info!(target: "session", "User is signed in: {}", identity);
            return Ok(identity);
        }
        Ok(None) => {
            info!(target: "session", "No user is signed in, attempting anonymous sign-in");
        }
        Err(e) => {
            warn!(target: "session", "Could not restore existing sign-in: {e}");
        }
    }

    let identity = provider
        .create_anonymous_identity()
        .await
        .map_err(BootstrapError::Authentication)?;
    info!(target: "session", "Signed in anonymously as {}", identity);
    Ok(identity)
}

/// Fetch-or-create the session, make sure `identity` is in its roster, then open
/// the change stream.
pub async fn join_session(
    store: &dyn SessionStore,
    session_id: &str,
    identity: &Identity,
    seeds: &[(UnitId, UnitKind, TileCoord)],
) -> Result<SnapshotStream, BootstrapError> {
    let existing = store
        .fetch_session(session_id)
        .await
        .map_err(BootstrapError::SessionJoin)?;

    let now = now_millis();
    if existing.is_none() {
        info!(target: "session", "Session {} does not exist, creating it", session_id);
        let document = SessionDocument::seeded(session_id, identity, now, seeds);
        store
            .create_session(&document)
            .await
            .map_err(BootstrapError::SessionJoin)?;
    } else {
        info!(target: "session", "Joining existing session {}", session_id);
        store
            .merge_player(session_id, identity, PlayerEntry { joined_at: now })
            .await
            .map_err(BootstrapError::SessionJoin)?;
    }

    store
        .watch_session(session_id)
        .await
        .map_err(BootstrapError::SessionJoin)
}

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub session_id: String,
    pub seeds: Vec<(UnitId, UnitKind, TileCoord)>,
}

/// Drives the whole bootstrap, reporting each step on `progress`.
pub async fn run_bootstrap(
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    options: JoinOptions,
    progress: mpsc::UnboundedSender<BootstrapProgress>,
) {
    let identity = match authenticate(provider.as_ref()).await {
        Ok(identity) => identity,
        Err(e) => {
            error!(target: "session", "{e}");
            let _ = progress.send(BootstrapProgress::Failed(e));
            return;
        }
    };
    if progress
        .send(BootstrapProgress::Authenticated(identity.clone()))
        .is_err()
        || progress.send(BootstrapProgress::Joining).is_err()
    {
        return;
    }

    let report = match join_session(store.as_ref(), &options.session_id, &identity, &options.seeds).await {
        Ok(stream) => BootstrapProgress::Joined(stream),
        Err(e) => {
            error!(target: "session", "{e}");
            BootstrapProgress::Failed(e)
        }
    };
    let _ = progress.send(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityProvider, MemorySessionStore};
    use futures::StreamExt;
    use std::sync::Mutex;

    fn options() -> JoinOptions {
        JoinOptions {
            session_id: DEFAULT_SESSION_ID.to_string(),
            seeds: default_units(8, 8),
        }
    }

    /// Runs the driver to completion and applies everything it reported.
    async fn drive(
        bootstrap: &mut SessionBootstrap,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Option<SnapshotStream> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_bootstrap(provider, store, options(), tx).await;
        let mut joined = None;
        while let Some(progress) = rx.recv().await {
            if let Some(stream) = bootstrap.apply(progress) {
                joined = Some(stream);
            }
        }
        joined
    }

    #[tokio::test]
    async fn fresh_identity_creates_seeded_session() {
        let store = Arc::new(MemorySessionStore::new());
        let mut bootstrap = SessionBootstrap::default();
        assert!(bootstrap.start());

        let stream = drive(
            &mut bootstrap,
            Arc::new(MemoryIdentityProvider::new()),
            store.clone(),
        )
        .await;
        assert!(stream.is_some());
        assert_eq!(bootstrap.state(), BootstrapState::SessionJoining);

        let identity = bootstrap.mark_ready().unwrap();
        assert_eq!(bootstrap.state(), BootstrapState::Ready);
        assert_eq!(bootstrap.current_identity(), Some(&identity));

        let document = store.document(DEFAULT_SESSION_ID).unwrap();
        let units = decode_units(&document).unwrap();
        assert_eq!(units["unit_1"].position, Some(TileCoord::new(0, 0)));
        assert_eq!(units["unit_2"].position, Some(TileCoord::new(7, 7)));
        assert_eq!(
            units["unit_1"].moved_by.as_deref(),
            Some(identity.as_str())
        );
        assert!(document["players"].get(identity.as_str()).is_some());
    }

    #[tokio::test]
    async fn joining_merges_player_without_touching_units() {
        let store = Arc::new(MemorySessionStore::new());
        let alice = Identity::new("alice");
        let seeded = SessionDocument::seeded(DEFAULT_SESSION_ID, &alice, 1, &default_units(8, 8));
        store.create_session(&seeded).await.unwrap();
        store
            .merge_unit(DEFAULT_SESSION_ID, "unit_1", TileCoord::new(3, 3), &alice, 2)
            .await
            .unwrap();

        let mut bootstrap = SessionBootstrap::default();
        bootstrap.start();
        let mut stream = drive(
            &mut bootstrap,
            Arc::new(MemoryIdentityProvider::with_identity(Identity::new("bob"))),
            store.clone(),
        )
        .await
        .unwrap();

        let document = store.document(DEFAULT_SESSION_ID).unwrap();
        assert!(document["players"].get("alice").is_some());
        assert!(document["players"].get("bob").is_some());
        assert_eq!(
            decode_units(&document).unwrap()["unit_1"].position,
            Some(TileCoord::new(3, 3))
        );

        let first = stream.next().await.unwrap().unwrap().unwrap();
        assert_eq!(decode_units(&first).unwrap()["unit_1"].position, Some(TileCoord::new(3, 3)));
        assert_eq!(
            bootstrap.current_identity(),
            Some(&Identity::new("bob"))
        );
    }

    #[tokio::test]
    async fn sign_up_failure_is_fatal() {
        let mut bootstrap = SessionBootstrap::default();
        bootstrap.start();
        let stream = drive(
            &mut bootstrap,
            Arc::new(MemoryIdentityProvider::rejecting()),
            Arc::new(MemorySessionStore::new()),
        )
        .await;

        assert!(stream.is_none());
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(bootstrap.last_error().unwrap().contains("Authentication failed"));
        assert_eq!(bootstrap.mark_ready(), None);
    }

    #[tokio::test]
    async fn store_failure_during_join_is_fatal() {
        let store = Arc::new(MemorySessionStore::new());
        store.set_offline(true);
        let mut bootstrap = SessionBootstrap::default();
        bootstrap.start();
        let stream = drive(&mut bootstrap, Arc::new(MemoryIdentityProvider::new()), store).await;

        assert!(stream.is_none());
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(bootstrap.current_identity().is_some());
        assert!(bootstrap.last_error().unwrap().contains("Joining session failed"));
    }

    #[test]
    fn start_is_idempotent() {
        let mut bootstrap = SessionBootstrap::default();
        assert!(bootstrap.start());
        assert!(!bootstrap.start());
        assert_eq!(bootstrap.state(), BootstrapState::Authenticating);
    }

    #[test]
    fn ready_is_reached_once_and_callbacks_fire_once() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut bootstrap = SessionBootstrap::default();
        let sink = fired.clone();
        bootstrap.on_ready(move |identity| sink.lock().unwrap().push(identity.clone()));

        bootstrap.start();
        bootstrap.apply(BootstrapProgress::Authenticated(Identity::new("alice")));
        bootstrap.apply(BootstrapProgress::Joining);
        assert!(bootstrap.mark_ready().is_some());
        assert!(bootstrap.mark_ready().is_none());
        assert!(!bootstrap.start());

        let late = fired.clone();
        bootstrap.on_ready(move |identity| late.lock().unwrap().push(identity.clone()));
        assert_eq!(
            *fired.lock().unwrap(),
            vec![Identity::new("alice"), Identity::new("alice")]
        );
    }

    #[test]
    fn identity_is_held_in_authenticated_until_the_join_starts() {
        let mut bootstrap = SessionBootstrap::default();
        bootstrap.start();
        bootstrap.apply(BootstrapProgress::Authenticated(Identity::new("alice")));
        assert_eq!(bootstrap.state(), BootstrapState::Authenticated);
        assert_eq!(bootstrap.current_identity(), Some(&Identity::new("alice")));
        assert_eq!(bootstrap.mark_ready(), None);

        bootstrap.apply(BootstrapProgress::Joining);
        assert_eq!(bootstrap.state(), BootstrapState::SessionJoining);
        assert!(bootstrap.mark_ready().is_some());
    }

    #[test]
    fn failures_after_ready_are_ignored() {
        let mut bootstrap = SessionBootstrap::default();
        bootstrap.start();
        bootstrap.apply(BootstrapProgress::Authenticated(Identity::new("alice")));
        bootstrap.apply(BootstrapProgress::Joining);
        bootstrap.mark_ready();
        bootstrap.fail("late");
        assert_eq!(bootstrap.state(), BootstrapState::Ready);
        assert_eq!(bootstrap.last_error(), None);
    }
}
