//! Matrix client-server API over reqwest.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::ChatClient;

const CLIENT_API: &str = "/_matrix/client/v3";
const MEDIA_API: &str = "/_matrix/media/v3";

/// Power needed for `kick`/`ban`/`redact` when the room does not say.
const DEFAULT_MODERATION_LEVEL: i64 = 50;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Rooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Rooms,
}

/// One `/sync` result, flattened for the sync loop.
#[derive(Debug, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    /// `(room_id, event)` in timeline order per room.
    pub events: Vec<(String, Value)>,
    pub invites: Vec<String>,
}

impl From<SyncResponse> for SyncBatch {
    fn from(response: SyncResponse) -> Self {
        let mut events = Vec::new();
        for (room_id, room) in response.rooms.join {
            for event in room.timeline.events {
                events.push((room_id.clone(), event));
            }
        }
        Self {
            next_batch: response.next_batch,
            events,
            invites: response.rooms.invite.into_keys().collect(),
        }
    }
}

/// Authenticated Matrix client.
pub struct MatrixClient {
    homeserver: String,
    access_token: String,
    user_id: String,
    http: reqwest::Client,
    txn_counter: AtomicU64,
}

impl MatrixClient {
    /// Log in with a password. Returns the new access token.
    pub async fn login(homeserver: &str, user: &str, password: &str) -> Result<String, String> {
        info!("🔑 Logging in as {} on {}", user, homeserver);
        let response = reqwest::Client::new()
            .post(format!("{}{CLIENT_API}/login", homeserver.trim_end_matches('/')))
            .json(&json!({
                "type": "m.login.password",
                "identifier": { "type": "m.id.user", "user": user },
                "password": password,
                "initial_device_display_name": "diagrambot",
            }))
            .send()
            .await
            .map_err(|e| format!("Login request failed: {e}"))?;

        let login: LoginResponse = parse_response(response, "login").await?;
        info!("Logged in as {}", login.user_id);
        Ok(login.access_token)
    }

    /// Connect with an access token and learn who we are.
    pub async fn connect(homeserver: &str, access_token: &str) -> Result<Self, String> {
        let mut client = Self {
            homeserver: homeserver.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            user_id: String::new(),
            http: reqwest::Client::new(),
            txn_counter: AtomicU64::new(0),
        };

        let response = client
            .http
            .get(client.client_url("/account/whoami"))
            .bearer_auth(&client.access_token)
            .send()
            .await
            .map_err(|e| format!("whoami request failed: {e}"))?;
        let whoami: WhoAmI = parse_response(response, "whoami").await?;
        client.user_id = whoami.user_id;

        info!("Connected as {} on {}", client.user_id, client.homeserver);
        Ok(client)
    }

    fn client_url(&self, path: &str) -> String {
        format!("{}{CLIENT_API}{}", self.homeserver, path)
    }

    fn next_txn_id(&self) -> String {
        format!(
            "diagrambot-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            self.txn_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Long-poll `/sync`.
    pub async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch, String> {
        let mut query = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .http
            .get(self.client_url("/sync"))
            .bearer_auth(&self.access_token)
            .query(&query)
            .timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| format!("Sync request failed: {e}"))?;

        let sync: SyncResponse = parse_response(response, "sync").await?;
        Ok(sync.into())
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), String> {
        info!("🚪 Joining {}", room_id);
        let response = self
            .http
            .post(self.client_url(&format!("/join/{}", urlencoding::encode(room_id))))
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| format!("Join request failed: {e}"))?;
        parse_response::<Value>(response, "join").await.map(|_| ())
    }

    /// Send without logging; used by the log forwarder so it cannot feed itself.
    pub async fn send_quietly(&self, room_id: &str, content: &Value) -> Result<String, String> {
        let url = self.client_url(&format!(
            "/rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(&self.next_txn_id())
        ));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await
            .map_err(|e| format!("Send request failed: {e}"))?;
        let sent: EventIdResponse = parse_response(response, "send").await?;
        Ok(sent.event_id)
    }

    async fn put_profile(&self, field: &str, value: &str) -> Result<(), String> {
        let url = self.client_url(&format!(
            "/profile/{}/{}",
            urlencoding::encode(&self.user_id),
            field
        ));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ field: value }))
            .send()
            .await
            .map_err(|e| format!("Profile update failed: {e}"))?;
        parse_response::<Value>(response, field).await.map(|_| ())
    }
}

#[async_trait]
impl ChatClient for MatrixClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, String> {
        self.send_quietly(room_id, &content).await.map_err(|e| {
            warn!("Failed to send to {}: {}", room_id, e);
            e
        })
    }

    async fn redact_event(&self, room_id: &str, event_id: &str, reason: &str) -> Result<(), String> {
        info!("🗑️ Redacting {} in {}", event_id, room_id);
        let url = self.client_url(&format!(
            "/rooms/{}/redact/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_id),
            urlencoding::encode(&self.next_txn_id())
        ));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .map_err(|e| format!("Redact request failed: {e}"))?;
        parse_response::<EventIdResponse>(response, "redact").await.map(|_| ())
    }

    async fn upload_content(&self, data: Vec<u8>, mimetype: &str, filename: &str) -> Result<String, String> {
        debug!("Uploading {} ({} bytes, {})", filename, data.len(), mimetype);
        let response = self
            .http
            .post(format!("{}{MEDIA_API}/upload", self.homeserver))
            .bearer_auth(&self.access_token)
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, mimetype)
            .body(data)
            .send()
            .await
            .map_err(|e| format!("Upload request failed: {e}"))?;
        let uploaded: UploadResponse = parse_response(response, "upload").await?;
        Ok(uploaded.content_uri)
    }

    async fn user_has_power_for(&self, room_id: &str, user_id: &str, action: &str) -> Result<bool, String> {
        let url = self.client_url(&format!(
            "/rooms/{}/state/m.room.power_levels/",
            urlencoding::encode(room_id)
        ));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| format!("Power level request failed: {e}"))?;
        let levels: Value = parse_response(response, "power levels").await?;
        Ok(has_power(&levels, user_id, action))
    }

    async fn set_avatar_url(&self, url: &str) -> Result<(), String> {
        self.put_profile("avatar_url", url).await
    }

    async fn set_display_name(&self, name: &str) -> Result<(), String> {
        self.put_profile("displayname", name).await
    }
}

/// Decode a JSON response, turning Matrix error bodies into messages.
async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, String> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                let code = v.get("errcode")?.as_str()?.to_string();
                let error = v.get("error").and_then(Value::as_str).unwrap_or("");
                Some(format!("{code}: {error}"))
            })
            .unwrap_or(body);
        return Err(format!("{what} failed ({status}): {detail}"));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| format!("Failed to parse {what} response: {e}"))
}

/// Whether `user_id` may perform `action` under the `m.room.power_levels` content `levels`.
fn has_power(levels: &Value, user_id: &str, action: &str) -> bool {
    let level_of = |v: Option<&Value>| v.and_then(Value::as_i64);

    let user_level = level_of(levels.get("users").and_then(|u| u.get(user_id)))
        .or_else(|| level_of(levels.get("users_default")))
        .unwrap_or(0);

    let required = match action {
        "kick" | "ban" | "redact" => {
            level_of(levels.get(action)).unwrap_or(DEFAULT_MODERATION_LEVEL)
        }
        "invite" => level_of(levels.get("invite")).unwrap_or(0),
        event_type => level_of(levels.get("events").and_then(|e| e.get(event_type)))
            .or_else(|| level_of(levels.get("state_default")))
            .unwrap_or(DEFAULT_MODERATION_LEVEL),
    };

    user_level >= required
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_from_user_map() {
        let levels = json!({ "users": { "@mod:x": 50, "@pleb:x": 0 }, "kick": 50 });
        assert!(has_power(&levels, "@mod:x", "kick"));
        assert!(!has_power(&levels, "@pleb:x", "kick"));
    }

    #[test]
    fn test_power_defaults() {
        let levels = json!({ "users_default": 0 });
        assert!(!has_power(&levels, "@anyone:x", "kick"));
        assert!(has_power(&levels, "@anyone:x", "invite"));

        let generous = json!({ "users_default": 50 });
        assert!(has_power(&generous, "@anyone:x", "kick"));
    }

    #[test]
    fn test_power_for_state_event() {
        let levels = json!({
            "users": { "@admin:x": 100, "@mod:x": 50 },
            "events": { "m.room.avatar": 100 },
            "state_default": 50
        });
        assert!(has_power(&levels, "@admin:x", "m.room.avatar"));
        assert!(!has_power(&levels, "@mod:x", "m.room.avatar"));
        assert!(has_power(&levels, "@mod:x", "m.room.topic"));
    }

    #[test]
    fn test_custom_kick_level() {
        let levels = json!({ "users": { "@helper:x": 10 }, "kick": 10 });
        assert!(has_power(&levels, "@helper:x", "kick"));
    }

    #[test]
    fn test_sync_batch_flattening() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!a:x": { "timeline": { "events": [ { "type": "m.room.message" }, { "type": "m.room.message" } ] } }
                },
                "invite": { "!b:x": {} }
            }
        }))
        .unwrap();
        let batch = SyncBatch::from(response);
        assert_eq!(batch.next_batch, "s2");
        assert_eq!(batch.events.len(), 2);
        assert!(batch.events.iter().all(|(room, _)| room == "!a:x"));
        assert_eq!(batch.invites, vec!["!b:x"]);
    }

    #[test]
    fn test_sync_without_rooms() {
        let response: SyncResponse = serde_json::from_value(json!({ "next_batch": "s1" })).unwrap();
        let batch = SyncBatch::from(response);
        assert!(batch.events.is_empty());
        assert!(batch.invites.is_empty());
    }
}
