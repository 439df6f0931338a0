//! The `/sync` loop that feeds room events to the bot.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::matrix::{MatrixClient, SyncBatch};
use super::router::DiagramBot;

/// Where sync batches come from.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch, String>;
    async fn join_room(&self, room_id: &str) -> Result<(), String>;
}

#[async_trait]
impl SyncSource for MatrixClient {
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch, String> {
        MatrixClient::sync(self, since, timeout_ms).await
    }

    async fn join_room(&self, room_id: &str) -> Result<(), String> {
        MatrixClient::join_room(self, room_id).await
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Persisted `next_batch` token.
    pub token_file: PathBuf,
    pub autojoin: bool,
    pub timeout_ms: u64,
    /// Wait after a failed sync.
    pub retry_delay: Duration,
    pub maintenance_interval: Duration,
    pub record_retention: Option<chrono::Duration>,
    pub pending_ttl: Option<chrono::Duration>,
}

impl SyncSettings {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            token_file: data_dir.join("sync_token"),
            autojoin: true,
            timeout_ms: 30_000,
            retry_delay: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(3600),
            record_retention: Some(chrono::Duration::days(30)),
            pending_ttl: Some(chrono::Duration::minutes(60)),
        }
    }
}

pub struct SyncLoop {
    source: Arc<dyn SyncSource>,
    bot: DiagramBot,
    settings: SyncSettings,
    since: Option<String>,
    /// Rooms joined whose timeline has not shown up yet. Their first batch
    /// carries history from before the join.
    awaiting_join: HashSet<String>,
    last_maintenance: Instant,
}

impl SyncLoop {
    pub fn new(source: Arc<dyn SyncSource>, bot: DiagramBot, settings: SyncSettings) -> Self {
        let since = load_token(&settings.token_file);
        Self {
            source,
            bot,
            settings,
            since,
            awaiting_join: HashSet::new(),
            last_maintenance: Instant::now(),
        }
    }

    /// Run until the process exits.
    pub async fn run(mut self) {
        match self.since {
            Some(ref token) => info!("🔄 Resuming sync from {}", token),
            None => info!("🔄 No sync token, skipping room history"),
        }

        loop {
            if let Err(e) = self.sync_once().await {
                warn!("Sync failed: {}", e);
                tokio::time::sleep(self.settings.retry_delay).await;
                continue;
            }

            if self.last_maintenance.elapsed() >= self.settings.maintenance_interval {
                self.bot
                    .maintain(self.settings.record_retention, self.settings.pending_ttl);
                self.last_maintenance = Instant::now();
            }
        }
    }

    /// One `/sync` round trip.
    ///
    /// Without a stored token only invites are handled, so a fresh start
    /// does not re-render the room's history. Rooms joined since the last
    /// batch skip everything up to the bot's own join.
    pub async fn sync_once(&mut self) -> Result<(), String> {
        let initial = self.since.is_none();
        let timeout = if initial { 0 } else { self.settings.timeout_ms };
        let batch = self.source.sync(self.since.as_deref(), timeout).await?;

        if self.settings.autojoin {
            for room_id in &batch.invites {
                match self.source.join_room(room_id).await {
                    Ok(()) => {
                        self.awaiting_join.insert(room_id.clone());
                    }
                    Err(e) => warn!("Failed to join {}: {}", room_id, e),
                }
            }
        }

        if initial {
            debug!("Skipped {} historical events", batch.events.len());
        } else {
            let new_rooms = std::mem::take(&mut self.awaiting_join);
            let mut joined: HashSet<&str> = HashSet::new();
            let user_id = self.bot.user_id().to_string();

            for (room_id, event) in &batch.events {
                if new_rooms.contains(room_id) && !joined.contains(room_id.as_str()) {
                    if is_own_join(event, &user_id) {
                        joined.insert(room_id.as_str());
                    } else {
                        debug!("Skipping pre-join history in {}", room_id);
                    }
                    continue;
                }
                // Render tasks keep running once the set is dropped.
                let _ = self.bot.handle_event(room_id, event).await;
            }

            // Invites accepted in this batch show up in a later one.
            let seen: HashSet<&String> = batch.events.iter().map(|(room, _)| room).collect();
            self.awaiting_join
                .extend(new_rooms.into_iter().filter(|room| !seen.contains(room)));
        }

        save_token(&self.settings.token_file, &batch.next_batch);
        self.since = Some(batch.next_batch);
        Ok(())
    }
}

/// The bot's own `m.room.member` join.
fn is_own_join(event: &Value, user_id: &str) -> bool {
    event.get("type").and_then(Value::as_str) == Some("m.room.member")
        && event.get("state_key").and_then(Value::as_str) == Some(user_id)
        && event
            .get("content")
            .and_then(|c| c.get("membership"))
            .and_then(Value::as_str)
            == Some("join")
}

fn load_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn save_token(path: &Path, token: &str) {
    if let Err(e) = std::fs::write(path, token) {
        warn!("Failed to save sync token: {}", e);
    }
}
