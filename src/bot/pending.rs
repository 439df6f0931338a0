//! Single-slot follow-up commands.
//!
//! A command handler can ask a user for exactly one more message of a given
//! type. The user's next message consumes the slot, whether or not it is the
//! expected type.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::client::{ChatClient, notice_content, send_notice, thread_notice_content};
use super::commands::CommandAction;
use super::event::RoomMessage;

/// What a command handler asks for.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Used in the cancellation notice: "Cancelling {description}".
    pub description: String,
    /// `msgtype` the follow-up must have, e.g. `m.image`.
    pub expected_msgtype: String,
    pub action: CommandAction,
    pub aux_data: Option<Value>,
    pub requires_permission: bool,
    /// Sent once the command is queued.
    pub notice: Option<String>,
    pub notice_in_thread: bool,
}

/// A queued follow-up for one user.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub owner: String,
    pub description: String,
    pub expected_msgtype: String,
    pub action: CommandAction,
    pub aux_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued over a command that was still waiting.
    Replaced,
    PermissionDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing was waiting on this user.
    NotPending,
    Executed,
    /// Wrong message type; the command was dropped.
    Cancelled,
}

/// Per-user pending command slots.
pub struct PendingCommands {
    slots: HashMap<String, PendingCommand>,
    /// Power-level action a user needs for commands that require permission.
    permission_action: String,
}

impl PendingCommands {
    pub fn new(permission_action: impl Into<String>) -> Self {
        Self {
            slots: HashMap::new(),
            permission_action: permission_action.into(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&PendingCommand> {
        self.slots.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Queue `request` for the sender of `msg`, replacing anything pending.
    pub async fn enqueue(
        &mut self,
        client: &dyn ChatClient,
        room_id: &str,
        msg: &RoomMessage,
        request: CommandRequest,
    ) -> EnqueueOutcome {
        if request.requires_permission {
            let allowed = match client
                .user_has_power_for(room_id, &msg.sender, &self.permission_action)
                .await
            {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!("Permission check for {} failed: {}", msg.sender, e);
                    false
                }
            };

            if !allowed {
                info!("🚫 {} lacks '{}' permission for {}", msg.sender, self.permission_action, request.description);
                let text = format!(
                    "My apologies! You need to have the '{}' permission to change my settings.",
                    self.permission_action
                );
                if let Err(e) = send_notice(client, room_id, &text, Some(&msg.event_id)).await {
                    warn!("Failed to send permission notice: {}", e);
                }
                return EnqueueOutcome::PermissionDenied;
            }
        }

        let command = PendingCommand {
            owner: msg.sender.clone(),
            description: request.description.clone(),
            expected_msgtype: request.expected_msgtype.clone(),
            action: request.action,
            aux_data: request.aux_data.clone(),
            created_at: Utc::now(),
        };

        let replaced = self.slots.insert(msg.sender.clone(), command).is_some();
        if replaced {
            debug!("Replaced pending command for {}", msg.sender);
        }
        info!("⏳ Waiting on {} for {} ({})", msg.sender, request.description, request.expected_msgtype);

        if let Some(ref notice) = request.notice {
            let content = if request.notice_in_thread {
                thread_notice_content(notice, msg.thread_root())
            } else {
                notice_content(notice, Some(&msg.event_id))
            };
            if let Err(e) = client.send_message(room_id, content).await {
                warn!("Failed to send command notice: {}", e);
            }
        }

        if replaced {
            EnqueueOutcome::Replaced
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Offer `msg` to its sender's pending command. The slot is cleared
    /// whatever happens.
    pub async fn consume(
        &mut self,
        client: &dyn ChatClient,
        room_id: &str,
        msg: &RoomMessage,
    ) -> ConsumeOutcome {
        let Some(command) = self.slots.remove(&msg.sender) else {
            return ConsumeOutcome::NotPending;
        };

        if command.expected_msgtype != msg.msgtype() {
            info!(
                "✖️ Cancelling {} for {}: got {:?}, wanted {}",
                command.description,
                msg.sender,
                msg.msgtype(),
                command.expected_msgtype
            );
            let text = format!("Incorrect message type! Cancelling {}", command.description);
            if let Err(e) = send_notice(client, room_id, &text, Some(&msg.event_id)).await {
                warn!("Failed to send cancellation notice: {}", e);
            }
            return ConsumeOutcome::Cancelled;
        }

        info!("▶️ Running {} for {}", command.description, msg.sender);
        if let Err(e) = command
            .action
            .run(client, room_id, msg, command.aux_data.as_ref())
            .await
        {
            warn!("{} failed: {}", command.description, e);
        }
        ConsumeOutcome::Executed
    }

    /// Drop commands that have waited longer than `ttl`.
    pub fn expire_older_than(&mut self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let before = self.slots.len();
        self.slots.retain(|_, command| command.created_at >= cutoff);
        let expired = before - self.slots.len();
        if expired > 0 {
            info!("🧹 Expired {} pending command(s)", expired);
        }
        expired
    }
}
