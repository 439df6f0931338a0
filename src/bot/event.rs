//! Inbound room message events.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// `m.relates_to` block of a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatesTo {
    pub event_id: Option<String>,
    pub rel_type: Option<String>,
}

/// The parts of `content` the bot reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageContent {
    pub msgtype: Option<String>,
    pub body: Option<String>,
    pub formatted_body: Option<String>,
    /// Media url for `m.image` and friends.
    pub url: Option<String>,
    #[serde(rename = "m.new_content")]
    pub new_content: Option<Value>,
    #[serde(rename = "m.relates_to")]
    pub relates_to: Option<RelatesTo>,
}

/// A `m.room.message` event.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomMessage {
    pub event_id: String,
    pub sender: String,
    pub content: Option<MessageContent>,
}

impl RoomMessage {
    /// Parse a raw timeline event. Returns `None` for anything that is not a
    /// room message with the required fields.
    pub fn from_event(event: &Value) -> Option<Self> {
        if event.get("type").and_then(Value::as_str) != Some("m.room.message") {
            return None;
        }
        match serde_json::from_value(event.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping malformed room message: {e}");
                None
            }
        }
    }

    pub fn msgtype(&self) -> &str {
        self.content
            .as_ref()
            .and_then(|c| c.msgtype.as_deref())
            .unwrap_or("")
    }

    /// Id of the message this event replaces, if it is an edit.
    ///
    /// An event counts as an edit only when it carries `m.new_content` *and*
    /// names a target in `m.relates_to`. Every edit check goes through here.
    pub fn edit_target(&self) -> Option<&str> {
        let content = self.content.as_ref()?;
        content.new_content.as_ref()?;
        content
            .relates_to
            .as_ref()
            .and_then(|r| r.event_id.as_deref())
    }

    /// Carries `m.new_content` but no target to apply it to.
    pub fn is_dangling_edit(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|c| c.new_content.is_some())
            && self.edit_target().is_none()
    }

    /// Redacted messages keep their type but lose everything in `content`.
    pub fn has_content(&self) -> bool {
        self.content
            .as_ref()
            .is_some_and(|c| c.msgtype.is_some() || c.body.is_some())
    }

    pub fn is_edit(&self) -> bool {
        self.edit_target().is_some()
    }

    /// The message a render or command logically belongs to: the edited
    /// message for edits, this message otherwise.
    pub fn canonical_source_id(&self) -> &str {
        self.edit_target().unwrap_or(&self.event_id)
    }

    /// Text to scan for diagrams. Edits use the replacement body so the
    /// fallback `* ` prefix is not part of the definition.
    pub fn body(&self) -> Option<&str> {
        let content = self.content.as_ref()?;
        if self.is_edit()
            && let Some(body) = content
                .new_content
                .as_ref()
                .and_then(|c| c.get("body"))
                .and_then(Value::as_str)
        {
            return Some(body);
        }
        content.body.as_deref()
    }

    pub fn formatted_body(&self) -> Option<&str> {
        self.content.as_ref()?.formatted_body.as_deref()
    }

    /// Root for a threaded reply: the related event if there is one, else this message.
    pub fn thread_root(&self) -> &str {
        self.content
            .as_ref()
            .and_then(|c| c.relates_to.as_ref())
            .and_then(|r| r.event_id.as_deref())
            .unwrap_or(&self.event_id)
    }

    pub fn media_url(&self) -> Option<&str> {
        self.content.as_ref()?.url.as_deref()
    }
}
