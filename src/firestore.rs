//! Firestore and Firebase Auth over their REST APIs.
//!
//! Session records live at
//! `artifacts/{app_id}/public/data/games/{session_id}` in the project's default
//! database. Reads decode Firestore's typed values into plain JSON so the rest of
//! the crate only ever sees the wire shape of [`SessionDocument`].

use crate::bootstrap::IdentityProvider;
use crate::channel::{SessionStore, SnapshotStream};
use crate::config::BackendConfig;
use crate::types::*;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";
const FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

/// Refresh this long before Firebase says the token expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn build_client(config: &BackendConfig) -> SyncResult<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()?)
}

/// Sends `request` and turns any non-success status into [`SyncError::Backend`].
async fn send_checked(request: RequestBuilder, what: &str) -> SyncResult<Response> {
    let response = request.send().await?;
    if response.status().is_success() {
        debug!(target: "session", "{} succeeded", what);
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    error!(target: "session", "{} failed: {} - {}", what, status, error_text);
    Err(SyncError::Backend {
        status: status.as_u16(),
        message: error_text,
    })
}

// Auth

#[derive(Debug, Clone)]
struct AuthSession {
    local_id: String,
    id_token: String,
    refresh_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
    #[serde(default)]
    local_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

fn expiry_from(expires_in: Option<&str>) -> Instant {
    let seconds = expires_in
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(3600);
    Instant::now() + Duration::from_secs(seconds)
}

/// Firebase Auth client. Holds the signed-in session and hands out bearer tokens,
/// refreshing them when they are about to expire.
pub struct FirebaseAuth {
    client: Client,
    api_key: String,
    custom_token: Option<String>,
    session: RwLock<Option<AuthSession>>,
}

impl FirebaseAuth {
    pub fn new(config: &BackendConfig) -> SyncResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            api_key: config.api_key.clone(),
            custom_token: Some(config.custom_token.clone()).filter(|t| !t.is_empty()),
            session: RwLock::new(None),
        })
    }

    fn session(&self) -> Option<AuthSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_session(&self, session: AuthSession) -> Identity {
        let identity = Identity::new(session.local_id.clone());
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        identity
    }

    /// Current id token, refreshed first if it is close to expiry.
    pub async fn bearer_token(&self) -> SyncResult<String> {
        let Some(session) = self.session() else {
            return Err(SyncError::Auth {
                message: "not signed in".to_string(),
            });
        };
        if session.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
            return Ok(session.id_token);
        }

        info!(target: "session", "Refreshing id token");
        let request = self
            .client
            .post(SECURE_TOKEN_URL)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", session.refresh_token.as_str()),
            ]);
        let refreshed: RefreshResponse = send_checked(request, "Token refresh").await?.json().await?;
        let id_token = refreshed.id_token.clone();
        let expires_at = expiry_from(Some(refreshed.expires_in.as_str()));
        self.store_session(AuthSession {
            local_id: session.local_id,
            id_token: refreshed.id_token,
            refresh_token: refreshed.refresh_token,
            expires_at,
        });
        Ok(id_token)
    }

    async fn sign_in(&self, endpoint: &str, body: Value) -> SyncResult<SignInResponse> {
        let url = format!("{}/accounts:{}", IDENTITY_TOOLKIT_URL, endpoint);
        let request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body);
        send_checked(request, endpoint)
            .await
            .map_err(|e| SyncError::Auth {
                message: e.to_string(),
            })?
            .json()
            .await
            .map_err(SyncError::from)
    }

    /// `signInWithCustomToken` does not return the user id, so it is looked up.
    async fn lookup_local_id(&self, id_token: &str) -> SyncResult<Option<String>> {
        let url = format!("{}/accounts:lookup", IDENTITY_TOOLKIT_URL);
        let request = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "idToken": id_token }));
        let body: Value = send_checked(request, "lookup").await?.json().await?;
        Ok(body
            .pointer("/users/0/localId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn finish_sign_in(&self, response: SignInResponse, local_id: Option<String>) -> Identity {
        let local_id = local_id.unwrap_or_else(|| {
            warn!(target: "session", "Sign-in returned no user id, using a random one");
            uuid::Uuid::new_v4().to_string()
        });
        self.store_session(AuthSession {
            local_id,
            expires_at: expiry_from(response.expires_in.as_deref()),
            id_token: response.id_token,
            refresh_token: response.refresh_token,
        })
    }
}

impl IdentityProvider for FirebaseAuth {
    fn current_identity(&self) -> BoxFuture<'_, SyncResult<Option<Identity>>> {
        Box::pin(async move {
            if let Some(session) = self.session() {
                return Ok(Some(Identity::new(session.local_id)));
            }
            let Some(token) = &self.custom_token else {
                return Ok(None);
            };

            info!(target: "session", "Signing in with custom token");
            let response = self
                .sign_in(
                    "signInWithCustomToken",
                    json!({ "token": token, "returnSecureToken": true }),
                )
                .await?;
            let local_id = match response.local_id.clone() {
                Some(id) => Some(id),
                None => self.lookup_local_id(&response.id_token).await?,
            };
            Ok(Some(self.finish_sign_in(response, local_id)))
        })
    }

    fn create_anonymous_identity(&self) -> BoxFuture<'_, SyncResult<Identity>> {
        Box::pin(async move {
            let response = self
                .sign_in("signUp", json!({ "returnSecureToken": true }))
                .await?;
            let local_id = response.local_id.clone();
            Ok(self.finish_sign_in(response, local_id))
        })
    }
}

// Value codec

/// Plain JSON to a Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(map: &Map<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), encode_value(value)))
            .collect(),
    )
}

/// Firestore typed value to plain JSON. Unknown or malformed values become `null`.
pub fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => inner.as_bool().map(Value::Bool).unwrap_or(Value::Null),
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| inner.as_i64())
            .map(Value::from)
            .unwrap_or(Value::Null),
        "doubleValue" => inner.as_f64().map(Value::from).unwrap_or(Value::Null),
        "stringValue" | "timestampValue" | "referenceValue" => inner.clone(),
        "mapValue" => inner
            .get("fields")
            .map(decode_fields)
            .unwrap_or_else(|| Value::Object(Map::new())),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        other => {
            debug!(target: "session", "Unsupported Firestore value type {}", other);
            Value::Null
        }
    }
}

pub fn decode_fields(fields: &Value) -> Value {
    let Some(fields) = fields.as_object() else {
        return Value::Object(Map::new());
    };
    Value::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), decode_value(value)))
            .collect(),
    )
}

/// Quotes a field path segment unless it is a simple identifier.
pub fn quote_field_segment(segment: &str) -> String {
    let mut chars = segment.chars();
    let simple = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        return segment.to_string();
    }
    let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{}`", escaped)
}

pub fn field_path(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| quote_field_segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

// Store

#[derive(Debug, Clone)]
struct RawDocument {
    update_time: Option<String>,
    fields: Value,
}

#[derive(Clone)]
pub struct FirestoreStore {
    client: Client,
    auth: Arc<FirebaseAuth>,
    api_key: String,
    documents_url: String,
    poll_interval: Duration,
}

impl FirestoreStore {
    pub fn new(config: &BackendConfig, auth: Arc<FirebaseAuth>) -> SyncResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            auth,
            api_key: config.api_key.clone(),
            documents_url: format!(
                "{}/projects/{}/databases/(default)/documents/artifacts/{}/public/data/games",
                FIRESTORE_URL, config.project_id, config.app_id
            ),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(50)),
        })
    }

    fn document_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.documents_url, session_id)
    }

    async fn authorized(&self, request: RequestBuilder) -> SyncResult<RequestBuilder> {
        let token = self.auth.bearer_token().await?;
        Ok(request
            .query(&[("key", self.api_key.as_str())])
            .header("Authorization", format!("Bearer {}", token)))
    }

    async fn get_document(&self, session_id: &str) -> SyncResult<Option<RawDocument>> {
        let request = self
            .authorized(self.client.get(self.document_url(session_id)))
            .await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(target: "session", "GET session {} failed: {} - {}", session_id, status, error_text);
            return Err(SyncError::Backend {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: Value = response.json().await?;
        Ok(Some(RawDocument {
            update_time: body
                .get("updateTime")
                .and_then(Value::as_str)
                .map(str::to_string),
            fields: body.get("fields").map(decode_fields).unwrap_or_else(|| json!({})),
        }))
    }

    /// PATCH `fields`, limited to `mask` when one is given.
    async fn patch_document(
        &self,
        session_id: &str,
        fields: &Map<String, Value>,
        mask: &[String],
    ) -> SyncResult<()> {
        let mut request = self.client.patch(self.document_url(session_id));
        for path in mask {
            request = request.query(&[("updateMask.fieldPaths", path.as_str())]);
        }
        let request = self
            .authorized(request)
            .await?
            .json(&json!({ "fields": encode_fields(fields) }));
        send_checked(request, &format!("PATCH session {}", session_id)).await?;
        Ok(())
    }
}

struct PollState {
    store: FirestoreStore,
    session_id: String,
    last_seen: Option<Option<String>>,
    first: bool,
}

impl SessionStore for FirestoreStore {
    fn fetch_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SyncResult<Option<Value>>> {
        Box::pin(async move {
            Ok(self
                .get_document(session_id)
                .await?
                .map(|document| document.fields))
        })
    }

    fn create_session<'a>(&'a self, document: &'a SessionDocument) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let Value::Object(fields) = serde_json::to_value(document)? else {
                return Err(SyncError::MalformedDocument {
                    message: "session document is not an object".to_string(),
                });
            };
            self.patch_document(&document.id, &fields, &[]).await?;
            info!(target: "session", "Created session {}", document.id);
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
            let mut players = Map::new();
            players.insert(identity.as_str().to_string(), serde_json::to_value(entry)?);
            let mut fields = Map::new();
            fields.insert("players".to_string(), Value::Object(players));

            let mask = [field_path(&["players", identity.as_str()])];
            self.patch_document(session_id, &fields, &mask).await
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
            let unit = json!({
                "x": tile.x,
                "y": tile.y,
                "updatedAt": updated_at,
                "movedBy": moved_by.as_str(),
            });
            let mut units = Map::new();
            units.insert(unit_id.to_string(), unit);
            let mut fields = Map::new();
            fields.insert("units".to_string(), Value::Object(units));

            let mask: Vec<String> = ["x", "y", "updatedAt", "movedBy"]
                .into_iter()
                .map(|leaf| field_path(&["units", unit_id, leaf]))
                .collect();
            self.patch_document(session_id, &fields, &mask).await
        })
    }

    fn watch_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, SyncResult<SnapshotStream>> {
        Box::pin(async move {
            let state = PollState {
                store: self.clone(),
                session_id: session_id.to_string(),
                last_seen: None,
                first: true,
            };
            info!(target: "session", "Polling session {} every {:?}", session_id, self.poll_interval);

            let stream = futures::stream::unfold(state, |mut state| async move {
                loop {
                    if !state.first {
                        tokio::time::sleep(state.store.poll_interval).await;
                    }
                    state.first = false;

                    match state.store.get_document(&state.session_id).await {
                        Ok(document) => {
                            let version = document.as_ref().map(|d| d.update_time.clone().unwrap_or_default());
                            if state.last_seen.as_ref() == Some(&version) {
                                continue;
                            }
                            state.last_seen = Some(version);
                            return Some((Ok(document.map(|d| d.fields)), state));
                        }
                        Err(e) => return Some((Err(e), state)),
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_plain_json_as_typed_values() {
        let encoded = encode_value(&json!({
            "x": 3,
            "ratio": 0.5,
            "movedBy": "alice",
            "ok": true,
            "none": null,
            "list": [1]
        }));
        let fields = &encoded["mapValue"]["fields"];
        assert_eq!(fields["x"], json!({ "integerValue": "3" }));
        assert_eq!(fields["ratio"], json!({ "doubleValue": 0.5 }));
        assert_eq!(fields["movedBy"], json!({ "stringValue": "alice" }));
        assert_eq!(fields["ok"], json!({ "booleanValue": true }));
        assert_eq!(fields["none"], json!({ "nullValue": null }));
        assert_eq!(
            fields["list"],
            json!({ "arrayValue": { "values": [{ "integerValue": "1" }] } })
        );
    }

    #[test]
    fn decodes_typed_session_document_into_units() {
        let fields = json!({
            "id": { "stringValue": "defaultGame" },
            "createdAt": { "integerValue": "1700000000000" },
            "units": { "mapValue": { "fields": {
                "unit_1": { "mapValue": { "fields": {
                    "x": { "integerValue": "4" },
                    "y": { "integerValue": "2" },
                    "movedBy": { "stringValue": "alice" },
                    "updatedAt": { "timestampValue": "2024-01-01T00:00:00Z" }
                } } },
                "unit_2": { "mapValue": {} }
            } } }
        });
        let document = decode_fields(&fields);
        assert_eq!(document["createdAt"], json!(1_700_000_000_000i64));

        let units = decode_units(&document).unwrap();
        assert_eq!(units["unit_1"].position, Some(TileCoord::new(4, 2)));
        assert_eq!(units["unit_1"].moved_by.as_deref(), Some("alice"));
        assert_eq!(units["unit_2"], UnitSnapshot::default());
    }

    #[test]
    fn malformed_typed_values_decode_to_null() {
        assert_eq!(decode_value(&json!({ "integerValue": "abc" })), Value::Null);
        assert_eq!(decode_value(&json!({ "geoPointValue": {} })), Value::Null);
        assert_eq!(decode_value(&json!("bare")), Value::Null);
        assert_eq!(decode_fields(&json!(5)), json!({}));
    }

    #[test]
    fn field_paths_quote_non_identifier_segments() {
        assert_eq!(field_path(&["units", "unit_1", "x"]), "units.unit_1.x");
        assert_eq!(
            field_path(&["players", "3f2a-b9"]),
            "players.`3f2a-b9`"
        );
        assert_eq!(quote_field_segment("a`b"), "`a\\`b`");
        assert_eq!(quote_field_segment(""), "``");
    }

    #[test]
    fn store_addresses_session_under_app_namespace() {
        let config = BackendConfig {
            kind: crate::config::BackendKind::Firestore,
            api_key: "key".to_string(),
            project_id: "proj".to_string(),
            app_id: "app".to_string(),
            custom_token: String::new(),
            poll_interval_ms: 500,
            timeout_seconds: 5,
        };
        let auth = Arc::new(FirebaseAuth::new(&config).unwrap());
        let store = FirestoreStore::new(&config, auth).unwrap();
        assert_eq!(
            store.document_url("defaultGame"),
            "https://firestore.googleapis.com/v1/projects/proj/databases/(default)/documents/artifacts/app/public/data/games/defaultGame"
        );
    }

    #[tokio::test]
    async fn requests_without_sign_in_fail_with_auth_error() {
        let config = crate::config::AppConfig::default().backend;
        let auth = FirebaseAuth::new(&config).unwrap();
        assert!(matches!(
            auth.bearer_token().await,
            Err(SyncError::Auth { .. })
        ));
        assert_eq!(auth.current_identity().await.unwrap(), None);
    }
}
