//! Entry point for every inbound room message.

use chrono::Duration;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::ChatClient;
use super::commands::{MentionMatcher, profile_commands};
use super::dispatch::RenderDispatcher;
use super::event::RoomMessage;
use super::pending::{ConsumeOutcome, PendingCommands};
use super::tasks::TaskSet;

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Power-level action needed for profile commands.
    pub permission_action: String,
    /// Post command notices in a thread instead of as replies.
    pub notice_in_thread: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            permission_action: "kick".to_string(),
            notice_in_thread: false,
        }
    }
}

/// The bot's top-level state. Events must be fed in one at a time.
pub struct DiagramBot {
    client: Arc<dyn ChatClient>,
    dispatcher: RenderDispatcher,
    pending: PendingCommands,
    mentions: MentionMatcher,
    notice_in_thread: bool,
    /// Rooms already warned about undecryptable traffic.
    encrypted_rooms: HashSet<String>,
}

impl DiagramBot {
    pub fn new(
        client: Arc<dyn ChatClient>,
        dispatcher: RenderDispatcher,
        config: RouterConfig,
    ) -> Result<Self, String> {
        let mentions = MentionMatcher::new(client.user_id())?;
        Ok(Self {
            client,
            dispatcher,
            pending: PendingCommands::new(config.permission_action),
            mentions,
            notice_in_thread: config.notice_in_thread,
            encrypted_rooms: HashSet::new(),
        })
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub fn user_id(&self) -> &str {
        self.client.user_id()
    }

    /// Handle one timeline event from `room_id`.
    ///
    /// Returns the render tasks started for it, if any.
    pub async fn handle_event(&mut self, room_id: &str, event: &Value) -> Option<TaskSet> {
        if event.get("type").and_then(Value::as_str) == Some("m.room.encrypted") {
            self.skip_encrypted(room_id, event);
            return None;
        }
        let msg = RoomMessage::from_event(event)?;

        if !msg.has_content() {
            debug!("Skipping {} without content", msg.event_id);
            return None;
        }
        if msg.sender == self.client.user_id() {
            return None;
        }
        if msg.is_dangling_edit() {
            warn!("Edit {} has no m.relates_to target, handling as a new message", msg.event_id);
        }

        // Follow-ups first, so a pending command sees the message even if it
        // also contains a diagram.
        let consumed = self.pending.consume(self.client.as_ref(), room_id, &msg).await;
        if consumed != ConsumeOutcome::NotPending {
            debug!("{} consumed a pending command: {:?}", msg.event_id, consumed);
        }

        if let Some(command) = msg.formatted_body().and_then(|f| self.mentions.command_text(f)) {
            info!("📣 Mentioned by {}: \"{}\"", msg.sender, command.chars().take(50).collect::<String>());
            for request in profile_commands(&command, self.notice_in_thread) {
                self.pending
                    .enqueue(self.client.as_ref(), room_id, &msg, request)
                    .await;
            }
        }

        self.dispatcher.dispatch(room_id, &msg)
    }

    /// The client cannot decrypt, so encrypted rooms are unsupported. Warn
    /// once per room so the silence is explained.
    fn skip_encrypted(&mut self, room_id: &str, event: &Value) {
        let event_id = event.get("event_id").and_then(Value::as_str).unwrap_or("?");
        if self.encrypted_rooms.insert(room_id.to_string()) {
            warn!(
                "🔒 {} is end-to-end encrypted; ignoring its messages (first: {})",
                room_id, event_id
            );
        } else {
            debug!("Skipping encrypted event {} in {}", event_id, room_id);
        }
    }

    /// Apply the retention policy to tracked renders and pending commands.
    pub fn maintain(&mut self, record_retention: Option<Duration>, pending_ttl: Option<Duration>) {
        if let Some(retention) = record_retention
            && let Err(e) = self.dispatcher.tracker().prune_older_than(retention)
        {
            warn!("Failed to prune rendered diagrams: {}", e);
        }
        if let Some(ttl) = pending_ttl {
            self.pending.expire_older_than(ttl);
        }
    }
}
