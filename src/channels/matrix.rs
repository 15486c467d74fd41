//! Matrix transport over the client-server HTTP API.
//!
//! Uses password login, `/join`, `/send` and long-polling `/sync`. Only plain
//! `m.text` room messages are surfaced; everything else in the sync response
//! is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::channels::{ChatTransport, EventStream, InboundEvent, TransportEvent};
use crate::config::MatrixConfig;
use crate::error::ChannelError;

const CHANNEL_NAME: &str = "matrix";

/// Consecutive transient sync failures tolerated before the stream ends.
const MAX_SYNC_FAILURES: u32 = 10;

/// Cap on the backoff between failed syncs.
const MAX_SYNC_BACKOFF: Duration = Duration::from_secs(60);

/// Matrix chat transport.
pub struct MatrixChannel {
    state: Arc<MatrixState>,
}

struct MatrixState {
    client: Client,
    homeserver_url: String,
    user: String,
    password: SecretString,
    sync_timeout: Duration,
    session: RwLock<Option<Session>>,
    shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
struct Session {
    access_token: SecretString,
    user_id: String,
}

impl MatrixChannel {
    /// Create a new Matrix channel. Does not touch the network.
    pub fn new(config: &MatrixConfig) -> Self {
        // The HTTP timeout has to outlive the server-side long poll.
        let client = Client::builder()
            .timeout(config.sync_timeout + Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            state: Arc::new(MatrixState {
                client,
                homeserver_url: config.homeserver_url.clone(),
                user: config.user_id.clone(),
                password: config.password.clone(),
                sync_timeout: config.sync_timeout,
                session: RwLock::new(None),
                shutdown_tx: RwLock::new(None),
            }),
        }
    }
}

impl MatrixState {
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/_matrix/client/v3/{}",
            self.homeserver_url,
            path.trim_start_matches('/')
        )
    }

    async fn session(&self) -> Result<Session, ChannelError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| ChannelError::NotLoggedIn {
                name: CHANNEL_NAME.to_string(),
            })
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<SyncResponse, ChannelError> {
        let session = self.session().await?;

        let mut query = vec![("timeout", self.sync_timeout.as_millis().to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .client
            .get(self.api_url("sync"))
            .bearer_auth(session.access_token.expose_secret())
            .query(&query)
            .send()
            .await
            .map_err(|e| ChannelError::SyncFailed {
                name: CHANNEL_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChannelError::NotLoggedIn {
                name: CHANNEL_NAME.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::SyncFailed {
                name: CHANNEL_NAME.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| ChannelError::InvalidResponse {
                name: CHANNEL_NAME.to_string(),
                reason: format!("sync response: {}", e),
            })
    }
}

#[async_trait]
impl ChatTransport for MatrixChannel {
    async fn login(&self) -> Result<String, ChannelError> {
        let state = &self.state;
        let body = serde_json::json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": state.user },
            "password": state.password.expose_secret(),
            "initial_device_display_name": "roomrelay",
        });

        let login_failed = |reason: String| ChannelError::LoginFailed {
            name: CHANNEL_NAME.to_string(),
            reason,
        };

        let response = state
            .client
            .post(state.api_url("login"))
            .json(&body)
            .send()
            .await
            .map_err(|e| login_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(login_failed(format!("HTTP {}: {}", status, text)));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| login_failed(format!("invalid login response: {}", e)))?;

        tracing::info!("Logged in to {} as {}", state.homeserver_url, login.user_id);

        *state.session.write().await = Some(Session {
            access_token: SecretString::from(login.access_token),
            user_id: login.user_id.clone(),
        });

        Ok(login.user_id)
    }

    async fn join_room(&self, alias: &str) -> Result<String, ChannelError> {
        let state = &self.state;
        let session = state.session().await?;
        let join_failed = |reason: String| ChannelError::JoinFailed {
            room: alias.to_string(),
            reason,
        };

        let response = state
            .client
            .post(state.api_url(&format!("join/{}", urlencoding::encode(alias))))
            .bearer_auth(session.access_token.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| join_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(join_failed(format!("HTTP {}: {}", status, text)));
        }

        let joined: JoinResponse = response
            .json()
            .await
            .map_err(|e| join_failed(format!("invalid join response: {}", e)))?;

        tracing::info!("Joined room {} (room id: {})", alias, joined.room_id);
        Ok(joined.room_id)
    }

    async fn send_message(&self, room_id: &str, text: &str) -> Result<(), ChannelError> {
        let state = &self.state;
        let session = state.session().await?;
        let txn_id = Uuid::new_v4().simple().to_string();

        let url = state.api_url(&format!(
            "rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room_id),
            txn_id
        ));

        let response = state
            .client
            .put(url)
            .bearer_auth(session.access_token.expose_secret())
            .json(&serde_json::json!({ "msgtype": "m.text", "body": text }))
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        tracing::debug!("Sent message to {}", room_id);
        Ok(())
    }

    async fn start(&self, poll_interval: Duration) -> Result<EventStream, ChannelError> {
        // Fail early rather than handing back a stream that ends immediately.
        self.state.session().await?;

        let (tx, rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.state.shutdown_tx.write().await = Some(shutdown_tx);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            sync_loop(state, tx, poll_interval, shutdown_rx).await;
        });

        tracing::info!("Started matrix sync loop");
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        if let Some(tx) = self.state.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

async fn sync_loop(
    state: Arc<MatrixState>,
    tx: mpsc::Sender<TransportEvent>,
    poll_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut since: Option<String> = None;
    let mut failures = 0u32;

    loop {
        let result = tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::info!("Matrix sync loop shutting down");
                return;
            }
            result = state.sync_once(since.as_deref()) => result,
        };

        match result {
            Ok(response) => {
                failures = 0;
                let first = since.is_none();

                for event in response.text_messages() {
                    if tx.send(TransportEvent::Message(event)).await.is_err() {
                        tracing::debug!("Event receiver dropped, stopping sync loop");
                        return;
                    }
                }

                if first {
                    tracing::info!(
                        "Initial matrix sync complete (next_batch {})",
                        response.next_batch
                    );
                    if tx.send(TransportEvent::SyncComplete).await.is_err() {
                        return;
                    }
                }

                since = Some(response.next_batch);
            }
            Err(e @ ChannelError::NotLoggedIn { .. }) => {
                tracing::error!("Matrix session rejected, stopping sync loop: {}", e);
                return;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_SYNC_FAILURES {
                    tracing::error!(
                        "Matrix sync failed {} times in a row, giving up: {}",
                        failures,
                        e
                    );
                    return;
                }
                let backoff = sync_backoff(failures);
                tracing::warn!("Matrix sync failed ({}), retrying in {:?}", e, backoff);
                tokio::time::sleep(backoff).await;
                continue;
            }
        }

        if !poll_interval.is_zero() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn sync_backoff(failures: u32) -> Duration {
    let secs = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_SYNC_BACKOFF)
}

// Client-server API wire types

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: serde_json::Value,
}

impl SyncResponse {
    /// Plain text room messages, ordered by server timestamp.
    fn text_messages(&self) -> Vec<InboundEvent> {
        let mut events: Vec<InboundEvent> = self
            .rooms
            .join
            .iter()
            .flat_map(|(room_id, room)| {
                room.timeline.events.iter().filter_map(move |event| {
                    if event.event_type != "m.room.message" {
                        return None;
                    }
                    if event.content.get("msgtype").and_then(|v| v.as_str()) != Some("m.text") {
                        return None;
                    }
                    let body = event.content.get("body")?.as_str()?;
                    Some(
                        InboundEvent::new(&event.sender, room_id, body)
                            .at_millis(event.origin_server_ts),
                    )
                })
            })
            .collect();
        events.sort_by_key(|e| e.server_timestamp);
        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post, put},
    };
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(homeserver_url: String) -> MatrixConfig {
        MatrixConfig {
            homeserver_url,
            user_id: "@bot:example.org".to_string(),
            password: SecretString::from("secret"),
            room_alias: "#room:example.org".to_string(),
            sync_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_text_messages_filters_and_orders() {
        let raw = serde_json::json!({
            "next_batch": "s2",
            "rooms": { "join": { "!r:x": { "timeline": { "events": [
                { "type": "m.room.message", "sender": "@b:x", "origin_server_ts": 2000,
                  "content": { "msgtype": "m.text", "body": "second" } },
                { "type": "m.room.message", "sender": "@a:x", "origin_server_ts": 1000,
                  "content": { "msgtype": "m.text", "body": "first" } },
                { "type": "m.room.message", "sender": "@a:x", "origin_server_ts": 1500,
                  "content": { "msgtype": "m.image", "body": "pic.png" } },
                { "type": "m.room.member", "sender": "@c:x", "origin_server_ts": 1200,
                  "content": { "membership": "join" } }
            ] } } } }
        });
        let response: SyncResponse = serde_json::from_value(raw).unwrap();
        let messages = response.text_messages();

        assert_eq!(
            messages
                .iter()
                .map(|m| (m.sender_id.as_str(), m.body.as_str()))
                .collect::<Vec<_>>(),
            vec![("@a:x", "first"), ("@b:x", "second")]
        );
        assert_eq!(messages[0].room_id, "!r:x");
        assert_eq!(messages[0].server_timestamp.timestamp_millis(), 1000);
    }

    #[test]
    fn test_sync_response_without_rooms() {
        let response: SyncResponse =
            serde_json::from_value(serde_json::json!({ "next_batch": "s1" })).unwrap();
        assert!(response.text_messages().is_empty());
    }

    #[test]
    fn test_sync_backoff_is_capped() {
        assert_eq!(sync_backoff(1), Duration::from_secs(2));
        assert_eq!(sync_backoff(3), Duration::from_secs(8));
        assert_eq!(sync_backoff(20), MAX_SYNC_BACKOFF);
        assert_eq!(sync_backoff(200), MAX_SYNC_BACKOFF);
    }

    #[tokio::test]
    async fn test_calls_before_login_fail() {
        let channel = MatrixChannel::new(&config("http://127.0.0.1:9".to_string()));
        let err = channel.send_message("!r:x", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotLoggedIn { .. }));
        assert!(channel.start(Duration::ZERO).await.is_err());
    }

    #[derive(Default)]
    struct FakeHomeserver {
        sent: Mutex<Vec<(String, String)>>,
        syncs: Mutex<u32>,
    }

    async fn login(Json(body): Json<serde_json::Value>) -> (StatusCode, Json<serde_json::Value>) {
        if body["password"] == "secret" {
            (
                StatusCode::OK,
                Json(serde_json::json!({ "user_id": "@bot:example.org", "access_token": "tok" })),
            )
        } else {
            (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "errcode": "M_FORBIDDEN" })),
            )
        }
    }

    async fn join(Path(alias): Path<String>) -> Json<serde_json::Value> {
        assert_eq!(alias, "#room:example.org");
        Json(serde_json::json!({ "room_id": "!abc:example.org" }))
    }

    async fn send(
        State(hs): State<Arc<FakeHomeserver>>,
        Path((room_id, _txn)): Path<(String, String)>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        assert_eq!(headers["authorization"], "Bearer tok");
        let text = body["body"].as_str().unwrap_or_default().to_string();
        hs.sent.lock().unwrap().push((room_id, text));
        Json(serde_json::json!({ "event_id": "$e" }))
    }

    async fn sync(State(hs): State<Arc<FakeHomeserver>>) -> Json<serde_json::Value> {
        let n = {
            let mut syncs = hs.syncs.lock().unwrap();
            *syncs += 1;
            *syncs
        };
        let events = if n == 1 {
            serde_json::json!([{ "type": "m.room.message", "sender": "@old:x",
                "origin_server_ts": 1000, "content": { "msgtype": "m.text", "body": "backlog" } }])
        } else {
            serde_json::json!([{ "type": "m.room.message", "sender": "@new:x",
                "origin_server_ts": 2000, "content": { "msgtype": "m.text", "body": "live" } }])
        };
        Json(serde_json::json!({
            "next_batch": format!("s{n}"),
            "rooms": { "join": { "!abc:example.org": { "timeline": { "events": events } } } }
        }))
    }

    async fn spawn_homeserver() -> (String, Arc<FakeHomeserver>) {
        let hs = Arc::new(FakeHomeserver::default());
        let app = Router::new()
            .route("/_matrix/client/v3/login", post(login))
            .route("/_matrix/client/v3/join/{alias}", post(join))
            .route(
                "/_matrix/client/v3/rooms/{room_id}/send/m.room.message/{txn}",
                put(send),
            )
            .route("/_matrix/client/v3/sync", get(sync))
            .with_state(Arc::clone(&hs));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hs)
    }

    #[tokio::test]
    async fn test_login_join_send_against_fake_homeserver() {
        let (url, hs) = spawn_homeserver().await;
        let channel = MatrixChannel::new(&config(url));

        assert_eq!(channel.login().await.unwrap(), "@bot:example.org");
        let room_id = channel.join_room("#room:example.org").await.unwrap();
        assert_eq!(room_id, "!abc:example.org");
        channel.send_message(&room_id, "hello").await.unwrap();

        assert_eq!(
            *hs.sent.lock().unwrap(),
            vec![("!abc:example.org".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (url, _hs) = spawn_homeserver().await;
        let mut cfg = config(url);
        cfg.password = SecretString::from("wrong");
        let channel = MatrixChannel::new(&cfg);

        let err = channel.login().await.unwrap_err();
        assert!(matches!(err, ChannelError::LoginFailed { .. }));
    }

    #[tokio::test]
    async fn test_stream_signals_sync_complete_after_backlog() {
        let (url, _hs) = spawn_homeserver().await;
        let channel = MatrixChannel::new(&config(url));
        channel.login().await.unwrap();

        let mut stream = channel.start(Duration::ZERO).await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, TransportEvent::Message(ref e) if e.body == "backlog"));
        assert_eq!(stream.next().await.unwrap(), TransportEvent::SyncComplete);
        let live = stream.next().await.unwrap();
        assert!(matches!(live, TransportEvent::Message(ref e) if e.body == "live"));

        channel.shutdown().await.unwrap();
    }
}
