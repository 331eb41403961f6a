//! Process-local backend. Runs the game offline and stands in for the remote
//! service in tests.

use crate::bootstrap::IdentityProvider;
use crate::channel::{SessionStore, SnapshotStream};
use crate::types::*;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
pub struct MemorySessionStore {
    documents: Arc<Mutex<HashMap<String, Value>>>,
    changes: watch::Sender<u64>,
    offline: Arc<AtomicBool>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            changes,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While offline every call fails with a backend error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn document(&self, session_id: &str) -> Option<Value> {
        self.lock().get(session_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Backend {
                status: 503,
                message: "memory store is offline".to_string(),
            });
        }
        Ok(())
    }

    /// Applies `update` to the document's field map, creating the document if needed.
    fn merge(&self, session_id: &str, update: impl FnOnce(&mut Map<String, Value>)) {
        {
            let mut documents = self.lock();
            let document = documents
                .entry(session_id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !document.is_object() {
                *document = Value::Object(Map::new());
            }
            if let Some(fields) = document.as_object_mut() {
                update(fields);
            }
        }
        self.changes.send_modify(|version| *version += 1);
    }
}

/// Runs `f` on the object stored under `key`, replacing anything that is not an
/// object with an empty one first.
fn with_child_map<R>(
    fields: &mut Map<String, Value>,
    key: &str,
    f: impl FnOnce(&mut Map<String, Value>) -> R,
) -> R {
    let mut child = match fields.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let result = f(&mut child);
    fields.insert(key.to_string(), Value::Object(child));
    result
}

impl SessionStore for MemorySessionStore {
    fn fetch_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SyncResult<Option<Value>>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self.document(session_id))
        })
    }

    fn create_session<'a>(&'a self, document: &'a SessionDocument) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            let value = serde_json::to_value(document)?;
            self.lock().insert(document.id.clone(), value);
            self.changes.send_modify(|version| *version += 1);
            debug!(target: "session", "Created session {} in memory", document.id);
            Ok(())
        })
    }

    fn merge_player<'a>(
        &'a self,
        session_id: &'a str,
        identity: &'a Identity,
        entry: PlayerEntry,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            let entry = serde_json::to_value(entry)?;
            self.merge(session_id, |fields| {
                with_child_map(fields, "players", |players| {
                    players.insert(identity.as_str().to_string(), entry);
                });
            });
            Ok(())
        })
    }

    fn merge_unit<'a>(
        &'a self,
        session_id: &'a str,
        unit_id: &'a str,
        tile: TileCoord,
        moved_by: &'a Identity,
        updated_at: i64,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            self.check_online()?;
            self.merge(session_id, |fields| {
                with_child_map(fields, "units", |units| {
                    with_child_map(units, unit_id, |unit| {
                        unit.insert("x".to_string(), json!(tile.x));
                        unit.insert("y".to_string(), json!(tile.y));
                        unit.insert("updatedAt".to_string(), json!(updated_at));
                        unit.insert("movedBy".to_string(), json!(moved_by.as_str()));
                    });
                });
            });
            Ok(())
        })
    }

    fn watch_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SyncResult<SnapshotStream>> {
        Box::pin(async move {
            self.check_online()?;
            let store = self.clone();
            let session_id = session_id.to_string();
            let rx = self.changes.subscribe();
            let first = self.document(&session_id);

            let updates = futures::stream::unfold(rx, move |mut rx| {
                let store = store.clone();
                let session_id = session_id.clone();
                async move {
                    rx.changed().await.ok()?;
                    Some((Ok::<_, SyncError>(store.document(&session_id)), rx))
                }
            });

            Ok(futures::stream::once(async move { Ok::<_, SyncError>(first) })
                .chain(updates)
                .boxed())
        })
    }
}

/// Identity provider issuing random anonymous identities.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    signed_in: Mutex<Option<Identity>>,
    reject_sign_up: bool,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that already has a signed-in identity.
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            signed_in: Mutex::new(Some(identity)),
            reject_sign_up: false,
        }
    }

    /// Provider whose anonymous sign-up always fails.
    pub fn rejecting() -> Self {
        Self {
            signed_in: Mutex::new(None),
            reject_sign_up: true,
        }
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn current_identity(&self) -> BoxFuture<'_, SyncResult<Option<Identity>>> {
        Box::pin(async move {
            Ok(self
                .signed_in
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        })
    }

    fn create_anonymous_identity(&self) -> BoxFuture<'_, SyncResult<Identity>> {
        Box::pin(async move {
            if self.reject_sign_up {
                return Err(SyncError::Auth {
                    message: "anonymous sign-in is disabled".to_string(),
                });
            }
            let identity = Identity::new(uuid::Uuid::new_v4().to_string());
            *self.signed_in.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
            Ok(identity)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unit_merge_keeps_siblings_and_extra_fields() {
        let store = MemorySessionStore::new();
        let doc = SessionDocument::seeded("g", &Identity::new("alice"), 1, &default_units(8, 8));
        store.create_session(&doc).await.unwrap();

        store
            .merge_unit("g", "unit_1", TileCoord::new(5, 6), &Identity::new("bob"), 9)
            .await
            .unwrap();

        let value = store.document("g").unwrap();
        assert_eq!(value["units"]["unit_1"]["x"], json!(5));
        assert_eq!(value["units"]["unit_1"]["movedBy"], json!("bob"));
        assert_eq!(value["units"]["unit_1"]["type"], json!("UNIT_A"));
        assert_eq!(value["units"]["unit_2"]["x"], json!(7));
        assert_eq!(value["createdAt"], json!(1));
    }

    #[tokio::test]
    async fn unit_merge_replaces_a_non_object_units_field() {
        let store = MemorySessionStore::new();
        store.merge("g", |fields| {
            fields.insert("units".to_string(), json!("broken"));
        });

        store
            .merge_unit("g", "unit_1", TileCoord::new(1, 2), &Identity::new("bob"), 4)
            .await
            .unwrap();

        let value = store.document("g").unwrap();
        assert_eq!(value["units"]["unit_1"]["x"], json!(1));
        assert_eq!(value["units"]["unit_1"]["y"], json!(2));
        assert_eq!(value["units"]["unit_1"]["movedBy"], json!("bob"));
    }

    #[tokio::test]
    async fn player_merge_does_not_touch_units() {
        let store = MemorySessionStore::new();
        let doc = SessionDocument::seeded("g", &Identity::new("alice"), 1, &default_units(8, 8));
        store.create_session(&doc).await.unwrap();

        store
            .merge_player("g", &Identity::new("bob"), PlayerEntry { joined_at: 3 })
            .await
            .unwrap();

        let value = store.document("g").unwrap();
        assert_eq!(value["players"]["alice"]["joinedAt"], json!(1));
        assert_eq!(value["players"]["bob"]["joinedAt"], json!(3));
        assert_eq!(decode_units(&value).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_yields_current_state_first() {
        let store = MemorySessionStore::new();
        let mut stream = store.watch_session("missing").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), None);

        store
            .merge_player("missing", &Identity::new("bob"), PlayerEntry { joined_at: 3 })
            .await
            .unwrap();
        let next = stream.next().await.unwrap().unwrap().unwrap();
        assert_eq!(next["players"]["bob"]["joinedAt"], json!(3));
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemorySessionStore::new();
        store.set_offline(true);
        assert!(store.fetch_session("g").await.is_err());
        assert!(store.watch_session("g").await.is_err());
    }

    #[tokio::test]
    async fn identity_provider_remembers_issued_identity() {
        let provider = MemoryIdentityProvider::new();
        assert_eq!(provider.current_identity().await.unwrap(), None);
        let issued = provider.create_anonymous_identity().await.unwrap();
        assert_eq!(provider.current_identity().await.unwrap(), Some(issued));

        assert!(
            MemoryIdentityProvider::rejecting()
                .create_anonymous_identity()
                .await
                .is_err()
        );
    }
}
