//! Test doubles shared by the bot's unit and scenario tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;

use super::client::ChatClient;
use super::codec::ImageCodec;
use super::render::DiagramRenderer;

pub const BOT_ID: &str = "@diagrambot:example.org";

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub room_id: String,
    pub event_id: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Redaction {
    pub room_id: String,
    pub event_id: String,
    pub reason: String,
}

/// Records every call; failures can be scripted per operation.
#[derive(Default)]
pub struct MockClient {
    next_id: AtomicUsize,
    pub sent: Mutex<Vec<Sent>>,
    pub redactions: Mutex<Vec<Redaction>>,
    pub uploads: Mutex<Vec<(String, String)>>,
    pub avatar: Mutex<Option<String>>,
    pub display_name: Mutex<Option<String>>,
    pub power_users: Mutex<HashSet<String>>,
    pub fail_redactions: Mutex<bool>,
    pub fail_images: Mutex<bool>,
    pub fail_power_checks: Mutex<bool>,
    pub encrypt: Mutex<bool>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_power(&self, user_id: &str) {
        self.power_users.lock().unwrap().insert(user_id.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.content["msgtype"] == "m.notice")
            .map(|s| s.content["body"].as_str().unwrap_or("").to_string())
            .collect()
    }

    pub fn images(&self) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.content["msgtype"] == "m.image")
            .collect()
    }

    pub fn redactions(&self) -> Vec<Redaction> {
        self.redactions.lock().unwrap().clone()
    }

    fn next_event_id(&self) -> String {
        format!("$out{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ChatClient for MockClient {
    fn user_id(&self) -> &str {
        BOT_ID
    }

    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, String> {
        if content["msgtype"] == "m.image" && *self.fail_images.lock().unwrap() {
            return Err("M_FORBIDDEN: cannot send images".to_string());
        }
        let event_id = self.next_event_id();
        self.sent.lock().unwrap().push(Sent {
            room_id: room_id.to_string(),
            event_id: event_id.clone(),
            content,
        });
        Ok(event_id)
    }

    async fn redact_event(&self, room_id: &str, event_id: &str, reason: &str) -> Result<(), String> {
        self.redactions.lock().unwrap().push(Redaction {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            reason: reason.to_string(),
        });
        if *self.fail_redactions.lock().unwrap() {
            return Err("M_FORBIDDEN: cannot redact".to_string());
        }
        Ok(())
    }

    async fn upload_content(&self, _data: Vec<u8>, mimetype: &str, filename: &str) -> Result<String, String> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((mimetype.to_string(), filename.to_string()));
        Ok(format!("mxc://example.org/media{}", uploads.len()))
    }

    async fn encrypt_media(&self, _room_id: &str, data: Vec<u8>) -> Result<super::client::PreparedMedia, String> {
        let encryption = if *self.encrypt.lock().unwrap() {
            Some(serde_json::json!({ "v": "v2", "iv": "test-iv", "hashes": {} }))
        } else {
            None
        };
        Ok(super::client::PreparedMedia { data, encryption })
    }

    async fn user_has_power_for(&self, _room_id: &str, user_id: &str, _action: &str) -> Result<bool, String> {
        if *self.fail_power_checks.lock().unwrap() {
            return Err("M_FORBIDDEN: cannot read power levels".to_string());
        }
        Ok(self.power_users.lock().unwrap().contains(user_id))
    }

    async fn set_avatar_url(&self, url: &str) -> Result<(), String> {
        *self.avatar.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<(), String> {
        *self.display_name.lock().unwrap() = Some(name.to_string());
        Ok(())
    }
}

/// Returns a fixed SVG, or an error when the definition contains `FAIL`.
pub struct MockRenderer;

pub const TEST_SVG: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="40" height="20"></svg>"#;

#[async_trait]
impl DiagramRenderer for MockRenderer {
    async fn render(&self, definition: &str) -> Result<String, String> {
        if definition.contains("FAIL") {
            return Err(format!("Parse error on line 1: {definition}"));
        }
        Ok(TEST_SVG.to_string())
    }
}

/// Reports 40x20 and fakes raster bytes; rejects unknown extensions.
/// Records the thread of every call.
#[derive(Default)]
pub struct MockCodec {
    pub threads: Mutex<Vec<ThreadId>>,
}

impl MockCodec {
    fn note_thread(&self) {
        self.threads.lock().unwrap().push(std::thread::current().id());
    }
}

impl ImageCodec for MockCodec {
    fn dimensions(&self, _svg: &str) -> Result<(u32, u32), String> {
        self.note_thread();
        Ok((40, 20))
    }

    fn rasterize(&self, _svg: &str, extension: &str) -> Result<Vec<u8>, String> {
        self.note_thread();
        match extension {
            "png" | "jpg" | "jpeg" | "webp" => Ok(vec![0u8; 8]),
            other => Err(format!("Unsupported image format '{other}'")),
        }
    }
}

pub fn text_event(event_id: &str, sender: &str, body: &str) -> Value {
    serde_json::json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "content": { "msgtype": "m.text", "body": body }
    })
}

pub fn edit_event(event_id: &str, sender: &str, target: &str, body: &str) -> Value {
    serde_json::json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "content": {
            "msgtype": "m.text",
            "body": format!("* {body}"),
            "m.new_content": { "msgtype": "m.text", "body": body },
            "m.relates_to": { "rel_type": "m.replace", "event_id": target }
        }
    })
}

pub fn image_event(event_id: &str, sender: &str, url: &str) -> Value {
    serde_json::json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "content": { "msgtype": "m.image", "body": "cat.png", "url": url }
    })
}

pub fn mention_event(event_id: &str, sender: &str, command: &str) -> Value {
    serde_json::json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "content": {
            "msgtype": "m.text",
            "body": format!("diagrambot: {command}"),
            "format": "org.matrix.custom.html",
            "formatted_body": format!(
                "<a href=\"https://matrix.to/#/{BOT_ID}\">diagrambot</a>: {command}"
            )
        }
    })
}

/// Log lines captured by [`capture_logs`].
pub type CapturedLogs = Arc<Mutex<Vec<(Level, String)>>>;

struct CaptureLayer {
    logs: CapturedLogs,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.logs
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

/// Capture log events on this thread until the guard drops. Pair with a
/// current-thread runtime so spawned tasks log on the same thread.
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, CapturedLogs) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(CaptureLayer { logs: logs.clone() });
    (tracing::subscriber::set_default(subscriber), logs)
}

pub fn encrypted_event(event_id: &str, sender: &str) -> Value {
    serde_json::json!({
        "type": "m.room.encrypted",
        "event_id": event_id,
        "sender": sender,
        "content": { "algorithm": "m.megolm.v1.aes-sha2", "ciphertext": "AwgAEn..." }
    })
}

pub fn join_event(event_id: &str, user_id: &str) -> Value {
    serde_json::json!({
        "type": "m.room.member",
        "event_id": event_id,
        "sender": user_id,
        "state_key": user_id,
        "content": { "membership": "join" }
    })
}
