//! Remote state channel: merge-writes of single units into the shared session
//! record, and a single active subscription to its change stream.

use crate::types::*;
use bevy::prelude::*;
use bevy_tokio_tasks::TokioTasksRuntime;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Successive states of one session document; `None` while the document is absent.
pub type SnapshotStream = BoxStream<'static, SyncResult<Option<serde_json::Value>>>;

/// Storage contract for the shared session record.
///
/// Every write except `create_session` is a merge scoped to one player entry or to
/// one unit's fields; nothing here overwrites sibling data.
pub trait SessionStore: Send + Sync {
    fn fetch_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, SyncResult<Option<serde_json::Value>>>;

    /// Writes the whole document. Concurrent creators race; the last write wins.
    fn create_session<'a>(&'a self, document: &'a SessionDocument) -> BoxFuture<'a, SyncResult<()>>;

    fn merge_player<'a>(
        &'a self,
        session_id: &'a str,
        identity: &'a Identity,
        entry: PlayerEntry,
    ) -> BoxFuture<'a, SyncResult<()>>;

    fn merge_unit<'a>(
        &'a self,
        session_id: &'a str,
        unit_id: &'a str,
        tile: TileCoord,
        moved_by: &'a Identity,
        updated_at: i64,
    ) -> BoxFuture<'a, SyncResult<()>>;

    /// Opens the change stream. The current state is always the first item.
    fn watch_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SyncResult<SnapshotStream>>;
}

/// Anything that can run a future on the Tokio runtime.
pub trait TaskSpawner {
    fn spawn_task<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

impl TaskSpawner for TokioTasksRuntime {
    fn spawn_task<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_background_task(move |_ctx| fut)
    }
}

impl TaskSpawner for tokio::runtime::Handle {
    fn spawn_task<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn(fut)
    }
}

#[derive(Debug)]
struct SnapshotMessage {
    generation: u64,
    units: UnitsSnapshot,
}

#[derive(Debug)]
struct Subscription {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Resource)]
pub struct RemoteStateChannel {
    store: Arc<dyn SessionStore>,
    session_id: String,
    generation: u64,
    active: Option<Subscription>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotMessage>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotMessage>,
}

impl RemoteStateChannel {
    pub fn new(store: Arc<dyn SessionStore>, session_id: impl Into<String>) -> Self {
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        Self {
            store,
            session_id: session_id.into(),
            generation: 0,
            active: None,
            snapshot_tx,
            snapshot_rx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    /// Merge-write of one unit's position. The returned future owns everything it
    /// needs, so callers can spawn it and forget about it.
    pub fn publish(
        &self,
        unit_id: &str,
        tile: TileCoord,
        moved_by: &Identity,
    ) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let unit_id = unit_id.to_string();
        let moved_by = moved_by.clone();
        async move {
            store
                .merge_unit(&session_id, &unit_id, tile, &moved_by, now_millis())
                .await?;
            info!(target: "session", "Unit {} position updated to {}", unit_id, tile);
            Ok(())
        }
    }

    /// Starts forwarding `stream` and returns the subscription's generation. Any
    /// previous subscription is released first.
    pub fn subscribe(&mut self, stream: SnapshotStream, spawner: &impl TaskSpawner) -> u64 {
        self.unsubscribe();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.snapshot_tx.clone();
        let task = spawner.spawn_task(forward_snapshots(stream, tx, generation));
        self.active = Some(Subscription { generation, task });
        info!(target: "session", "Subscribed to session {} (generation {})", self.session_id, generation);
        generation
    }

    pub fn unsubscribe(&mut self) {
        if let Some(subscription) = self.active.take() {
            subscription.task.abort();
            info!(target: "session", "Released subscription generation {}", subscription.generation);
        }
    }

    /// Newest snapshot delivered for the active subscription, if any arrived since the
    /// last call. Snapshots are full states, so older pending ones are skipped.
    /// Anything stamped with a released generation is discarded.
    pub fn drain_latest(&mut self) -> Option<UnitsSnapshot> {
        let active = self.active.as_ref().map(|s| s.generation);
        let mut latest = None;
        while let Ok(message) = self.snapshot_rx.try_recv() {
            if Some(message.generation) == active {
                latest = Some(message.units);
            } else {
                debug!(target: "session", "Dropping snapshot from released generation {}", message.generation);
            }
        }
        latest
    }
}

async fn forward_snapshots(
    mut stream: SnapshotStream,
    tx: mpsc::UnboundedSender<SnapshotMessage>,
    generation: u64,
) {
    while let Some(item) = stream.next().await {
        let units = match item {
            Ok(Some(document)) => match decode_units(&document) {
                Some(units) => units,
                None => {
                    warn!(target: "session", "No units data in session document, skipping");
                    continue;
                }
            },
            Ok(None) => {
                warn!(target: "session", "Session document does not exist, skipping");
                continue;
            }
            Err(e) => {
                warn!(target: "session", "Error listening to session state: {e}");
                continue;
            }
        };
        if tx.send(SnapshotMessage { generation, units }).is_err() {
            break;
        }
    }
    debug!(target: "session", "Snapshot stream for generation {} ended", generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardGeometry;
    use crate::engine::ReconciliationEngine;
    use crate::memory::MemorySessionStore;
    use serde_json::json;
    use std::time::Duration;

    async fn next_snapshot(channel: &mut RemoteStateChannel) -> Option<UnitsSnapshot> {
        for _ in 0..200 {
            if let Some(snapshot) = channel.drain_latest() {
                return Some(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    async fn seeded_store() -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::new());
        let doc = SessionDocument::seeded(
            DEFAULT_SESSION_ID,
            &Identity::new("alice"),
            1,
            &default_units(8, 8),
        );
        store.create_session(&doc).await.unwrap();
        store
    }

    #[tokio::test]
    async fn subscription_delivers_current_state_then_own_echo() {
        let store = seeded_store().await;
        let mut channel = RemoteStateChannel::new(store.clone(), DEFAULT_SESSION_ID);
        let stream = store.watch_session(DEFAULT_SESSION_ID).await.unwrap();
        channel.subscribe(stream, &tokio::runtime::Handle::current());

        let first = next_snapshot(&mut channel).await.unwrap();
        assert_eq!(first["unit_1"].position, Some(TileCoord::new(0, 0)));

        channel
            .publish("unit_1", TileCoord::new(4, 2), &Identity::new("alice"))
            .await
            .unwrap();
        let echo = next_snapshot(&mut channel).await.unwrap();
        assert_eq!(echo["unit_1"].position, Some(TileCoord::new(4, 2)));
        assert_eq!(echo["unit_1"].moved_by.as_deref(), Some("alice"));
        assert_eq!(echo["unit_2"].position, Some(TileCoord::new(7, 7)));
    }

    #[tokio::test]
    async fn snapshots_after_unsubscribe_are_dropped() {
        let store = seeded_store().await;
        let mut channel = RemoteStateChannel::new(store.clone(), DEFAULT_SESSION_ID);
        let stream = store.watch_session(DEFAULT_SESSION_ID).await.unwrap();
        channel.subscribe(stream, &tokio::runtime::Handle::current());
        assert!(next_snapshot(&mut channel).await.is_some());

        channel.unsubscribe();
        assert!(!channel.is_subscribed());
        channel
            .publish("unit_2", TileCoord::new(1, 1), &Identity::new("alice"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.drain_latest(), None);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_handle() {
        let store = seeded_store().await;
        let mut channel = RemoteStateChannel::new(store.clone(), DEFAULT_SESSION_ID);
        let spawner = tokio::runtime::Handle::current();

        let first = channel.subscribe(
            store.watch_session(DEFAULT_SESSION_ID).await.unwrap(),
            &spawner,
        );
        let second = channel.subscribe(
            store.watch_session(DEFAULT_SESSION_ID).await.unwrap(),
            &spawner,
        );
        assert!(second > first);

        let snapshot = next_snapshot(&mut channel).await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn documents_without_units_leave_local_units_alone() {
        let store = Arc::new(MemorySessionStore::new());
        let mut channel = RemoteStateChannel::new(store, DEFAULT_SESSION_ID);
        let stream: SnapshotStream = futures::stream::iter(vec![
            Ok(Some(json!({
                "id": DEFAULT_SESSION_ID,
                "units": {
                    "unit_1": { "x": 2, "y": 2, "movedBy": "alice" },
                    "unit_2": { "x": 7, "y": 7, "movedBy": "alice" }
                }
            }))),
            Ok(Some(json!({ "id": DEFAULT_SESSION_ID, "players": {} }))),
            Ok(Some(json!({ "id": DEFAULT_SESSION_ID, "units": "broken" }))),
            Ok(None),
        ])
        .boxed();
        channel.subscribe(stream, &tokio::runtime::Handle::current());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = channel.drain_latest().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(channel.drain_latest(), None);

        let mut engine = ReconciliationEngine::new(BoardGeometry::default());
        engine.setup_initial_units(Identity::new("alice"));
        let summary = engine.reconcile(&snapshot).unwrap();
        assert!(summary.removed.is_empty());
        let mut ids: Vec<_> = engine.units().map(|unit| unit.id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["unit_1", "unit_2"]);
    }

    #[tokio::test]
    async fn publish_failure_is_returned_not_panicked() {
        let store = seeded_store().await;
        store.set_offline(true);
        let channel = RemoteStateChannel::new(store.clone(), DEFAULT_SESSION_ID);
        let result = channel
            .publish("unit_1", TileCoord::new(2, 2), &Identity::new("alice"))
            .await;
        assert!(result.is_err());
    }
}
