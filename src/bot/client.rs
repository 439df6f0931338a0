//! The chat operations the bot needs from its homeserver connection.

use async_trait::async_trait;
use serde_json::{Value, json};

/// Media that has been prepared for upload.
pub struct PreparedMedia {
    /// Bytes to upload (ciphertext when the room is encrypted).
    pub data: Vec<u8>,
    /// Key material for an encrypted upload, merged into the `file` object.
    pub encryption: Option<Value>,
}

/// An uploaded piece of media, ready to be referenced from a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    Plain(String),
    Encrypted { url: String, keys: Value },
}

impl MediaSource {
    /// Add this media to `target` under `url_key` (plain) or `file_key` (encrypted).
    pub fn attach(&self, target: &mut Value, url_key: &str, file_key: &str) {
        match self {
            MediaSource::Plain(url) => {
                target[url_key] = json!(url);
            }
            MediaSource::Encrypted { url, keys } => {
                let mut file = keys.clone();
                if !file.is_object() {
                    file = json!({});
                }
                file["url"] = json!(url);
                target[file_key] = file;
            }
        }
    }
}

/// Messaging platform client.
///
/// All errors are human-readable strings; callers decide whether to log or
/// surface them.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The bot's own user id.
    fn user_id(&self) -> &str;

    /// Send a `m.room.message` event. Returns the new event id.
    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, String>;

    async fn redact_event(&self, room_id: &str, event_id: &str, reason: &str) -> Result<(), String>;

    /// Upload bytes to the media repository. Returns the content uri.
    async fn upload_content(&self, data: Vec<u8>, mimetype: &str, filename: &str) -> Result<String, String>;

    /// Prepare media for an upload to `room_id`.
    ///
    /// The default does no encryption; clients that support encrypted rooms
    /// override this and return the key material.
    async fn encrypt_media(&self, _room_id: &str, data: Vec<u8>) -> Result<PreparedMedia, String> {
        Ok(PreparedMedia { data, encryption: None })
    }

    /// Whether `user_id` has enough power in `room_id` to perform `action`
    /// (`kick`, `ban`, `redact`, or a state event type).
    async fn user_has_power_for(&self, room_id: &str, user_id: &str, action: &str) -> Result<bool, String>;

    async fn set_avatar_url(&self, url: &str) -> Result<(), String>;

    async fn set_display_name(&self, name: &str) -> Result<(), String>;
}

/// `m.notice` content, optionally as a reply to `reply_to`.
pub fn notice_content(body: &str, reply_to: Option<&str>) -> Value {
    let mut content = json!({
        "msgtype": "m.notice",
        "body": body,
    });
    if let Some(event_id) = reply_to {
        content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": event_id } });
    }
    content
}

/// `m.notice` content posted in the thread rooted at `thread_root`.
pub fn thread_notice_content(body: &str, thread_root: &str) -> Value {
    json!({
        "msgtype": "m.notice",
        "body": body,
        "m.relates_to": { "rel_type": "m.thread", "event_id": thread_root },
    })
}

/// Send a notice in reply to `reply_to`.
pub async fn send_notice(
    client: &dyn ChatClient,
    room_id: &str,
    body: &str,
    reply_to: Option<&str>,
) -> Result<String, String> {
    client.send_message(room_id, notice_content(body, reply_to)).await
}

/// Upload media through `encrypt_media` + `upload_content`.
pub async fn upload_media(
    client: &dyn ChatClient,
    room_id: &str,
    data: Vec<u8>,
    mimetype: &str,
    filename: &str,
) -> Result<MediaSource, String> {
    let prepared = client.encrypt_media(room_id, data).await?;
    // Encrypted uploads are opaque blobs to the media repository.
    let upload_type = if prepared.encryption.is_some() {
        "application/octet-stream"
    } else {
        mimetype
    };
    let url = client.upload_content(prepared.data, upload_type, filename).await?;
    Ok(match prepared.encryption {
        Some(keys) => MediaSource::Encrypted { url, keys },
        None => MediaSource::Plain(url),
    })
}
