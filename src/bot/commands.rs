//! Mention-triggered profile commands.

use regex::Regex;
use serde_json::Value;
use tracing::info;

use super::client::{ChatClient, send_notice};
use super::event::RoomMessage;
use super::pending::CommandRequest;

/// Follow-up actions a pending command can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Use the follow-up image as the bot's avatar.
    ChangeAvatar,
    /// Use the follow-up text as the bot's display name.
    ChangeDisplayName,
}

impl CommandAction {
    pub async fn run(
        self,
        client: &dyn ChatClient,
        room_id: &str,
        msg: &RoomMessage,
        _aux_data: Option<&Value>,
    ) -> Result<(), String> {
        match self {
            CommandAction::ChangeAvatar => {
                let url = msg
                    .media_url()
                    .ok_or_else(|| "image message has no url".to_string())?;
                client.set_avatar_url(url).await?;
                info!("🖼️ Avatar changed to {}", url);
                send_notice(client, room_id, "Avatar updated!", Some(&msg.event_id)).await?;
            }
            CommandAction::ChangeDisplayName => {
                let name = msg
                    .body()
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| "message has no text".to_string())?;
                client.set_display_name(name).await?;
                info!("🏷️ Display name changed to {}", name);
                send_notice(client, room_id, "Updated display name!", Some(&msg.event_id)).await?;
            }
        }
        Ok(())
    }
}

/// Detects `<a href="…/@bot:server">bot</a>:` pills in formatted bodies.
#[derive(Debug, Clone)]
pub struct MentionMatcher {
    pattern: Regex,
}

impl MentionMatcher {
    pub fn new(bot_user_id: &str) -> Result<Self, String> {
        let pattern = format!(
            r#"(?s)<a href="[^"]*{}"[^>]*>.*?</a>:?"#,
            regex::escape(bot_user_id)
        );
        let pattern = Regex::new(&pattern).map_err(|e| format!("invalid mention pattern: {e}"))?;
        Ok(Self { pattern })
    }

    /// The text addressed to the bot, with the mention removed, or `None`
    /// when the bot is not mentioned.
    pub fn command_text(&self, formatted_body: &str) -> Option<String> {
        if !self.pattern.is_match(formatted_body) {
            return None;
        }
        Some(self.pattern.replace_all(formatted_body, "").trim().to_string())
    }
}

/// Commands requested by `command` text, in the order they should be queued.
pub fn profile_commands(command: &str, notice_in_thread: bool) -> Vec<CommandRequest> {
    let command = command.to_lowercase();
    let mut requests = Vec::new();

    if command.contains("picture") || command.contains("avatar") {
        requests.push(CommandRequest {
            description: "avatar change".to_string(),
            expected_msgtype: "m.image".to_string(),
            action: CommandAction::ChangeAvatar,
            aux_data: None,
            requires_permission: true,
            notice: Some(
                "Setting new avatar! If your next message is an image, I will update my avatar to that."
                    .to_string(),
            ),
            notice_in_thread,
        });
    }

    if command.contains("name") || command.contains("handle") {
        requests.push(CommandRequest {
            description: "display name change".to_string(),
            expected_msgtype: "m.text".to_string(),
            action: CommandAction::ChangeDisplayName,
            aux_data: None,
            requires_permission: true,
            notice: Some(
                "Setting new display name! I'll set it to the contents of your next message."
                    .to_string(),
            ),
            notice_in_thread,
        });
    }

    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::testing::{BOT_ID, MockClient, image_event, text_event};

    #[test]
    fn test_mention_is_stripped() {
        let matcher = MentionMatcher::new(BOT_ID).unwrap();
        let body = format!("<a href=\"https://matrix.to/#/{BOT_ID}\">diagrambot</a>: change your avatar");
        assert_eq!(matcher.command_text(&body).as_deref(), Some("change your avatar"));
    }

    #[test]
    fn test_other_mentions_are_ignored() {
        let matcher = MentionMatcher::new(BOT_ID).unwrap();
        let body = "<a href=\"https://matrix.to/#/@alice:example.org\">alice</a>: hi";
        assert_eq!(matcher.command_text(body), None);
        assert_eq!(matcher.command_text("no pills here"), None);
    }

    #[test]
    fn test_dots_in_user_id_are_literal() {
        let matcher = MentionMatcher::new("@bot:example.org").unwrap();
        let body = "<a href=\"https://matrix.to/#/@bot:exampleXorg\">bot</a>: avatar";
        assert_eq!(matcher.command_text(body), None);
    }

    #[test]
    fn test_profile_command_selection() {
        let avatar = profile_commands("please change your Avatar", false);
        assert_eq!(avatar.len(), 1);
        assert_eq!(avatar[0].action, CommandAction::ChangeAvatar);
        assert_eq!(avatar[0].expected_msgtype, "m.image");

        let name = profile_commands("new handle", false);
        assert_eq!(name.len(), 1);
        assert_eq!(name[0].action, CommandAction::ChangeDisplayName);

        let both = profile_commands("new picture and name", false);
        assert_eq!(both.len(), 2);
        assert_eq!(both[1].action, CommandAction::ChangeDisplayName);

        assert!(profile_commands("render something", false).is_empty());
    }

    #[tokio::test]
    async fn test_change_avatar_action() {
        let client = MockClient::new();
        let msg = RoomMessage::from_event(&image_event("$img", "@alice:example.org", "mxc://x/y")).unwrap();
        CommandAction::ChangeAvatar.run(&client, "!r", &msg, None).await.unwrap();
        assert_eq!(client.avatar.lock().unwrap().as_deref(), Some("mxc://x/y"));
        assert_eq!(client.notices(), vec!["Avatar updated!"]);
    }

    #[tokio::test]
    async fn test_change_display_name_action() {
        let client = MockClient::new();
        let msg = RoomMessage::from_event(&text_event("$t", "@alice:example.org", "  Diagram Wizard ")).unwrap();
        CommandAction::ChangeDisplayName.run(&client, "!r", &msg, None).await.unwrap();
        assert_eq!(client.display_name.lock().unwrap().as_deref(), Some("Diagram Wizard"));
        assert_eq!(client.notices(), vec!["Updated display name!"]);
    }

    #[tokio::test]
    async fn test_change_avatar_without_url_fails() {
        let client = MockClient::new();
        let msg = RoomMessage::from_event(&text_event("$t", "@alice:example.org", "hi")).unwrap();
        assert!(CommandAction::ChangeAvatar.run(&client, "!r", &msg, None).await.is_err());
        assert!(client.avatar.lock().unwrap().is_none());
    }
}
