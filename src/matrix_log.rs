use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::bot::client::notice_content;
use crate::bot::matrix::MatrixClient;

const MAX_LOG_CHARS: usize = 4000;
const FLUSH_LINES: usize = 50;

/// Log message with priority.
#[derive(Debug, PartialEq)]
enum LogMessage {
    /// High priority (WARN/ERROR) - send immediately
    Urgent(String),
    /// Low priority (INFO) - batch and send periodically
    Info(String),
}

/// Forwards INFO and above to a Matrix room.
///
/// Lines logged before [`LogForwarder::start`] wait in the channel, so the
/// layer can be installed before the client has logged in.
pub struct MatrixLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

pub struct LogForwarder {
    room_id: String,
    rx: mpsc::UnboundedReceiver<LogMessage>,
}

impl MatrixLogLayer {
    pub fn new(room_id: impl Into<String>) -> (Self, LogForwarder) {
        let (tx, rx) = mpsc::unbounded_channel::<LogMessage>();
        (
            Self { tx },
            LogForwarder {
                room_id: room_id.into(),
                rx,
            },
        )
    }
}

impl LogForwarder {
    /// Start sending through `client`. Uses the client's quiet send path so
    /// forwarding never logs.
    pub fn start(self, client: Arc<MatrixClient>) {
        let LogForwarder { room_id, mut rx } = self;

        tokio::spawn(async move {
            let mut info_buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(Duration::from_secs(5));

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(LogMessage::Urgent(text)) => {
                                // Keep ordering: pending INFO lines go first
                                flush_buffer(&client, &room_id, &mut info_buffer).await;
                                send_log(&client, &room_id, &text).await;
                            }
                            Some(LogMessage::Info(text)) => {
                                info_buffer.push(text);
                                if info_buffer.len() >= FLUSH_LINES {
                                    flush_buffer(&client, &room_id, &mut info_buffer).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = interval.tick() => {
                        flush_buffer(&client, &room_id, &mut info_buffer).await;
                    }
                }
            }
        });
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_LOG_CHARS {
        let truncated: String = text.chars().take(MAX_LOG_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

async fn send_log(client: &MatrixClient, room_id: &str, text: &str) {
    let content = notice_content(&truncate(text), None);
    if let Err(e) = client.send_quietly(room_id, &content).await {
        eprintln!("Failed to send log to Matrix: {e}");
    }
}

async fn flush_buffer(client: &MatrixClient, room_id: &str, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(client, room_id, &combined).await;
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message
                .push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

fn classify(level: Level, message: String) -> Option<LogMessage> {
    match level {
        Level::ERROR => Some(LogMessage::Urgent(format!("❌ {}", message))),
        Level::WARN => Some(LogMessage::Urgent(format!("⚠️ {}", message))),
        Level::INFO => Some(LogMessage::Info(message)),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for MatrixLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Library internals (reqwest, hyper) stay out of the room.
        if !event.metadata().target().starts_with(env!("CARGO_CRATE_NAME")) {
            return;
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let Some(msg) = classify(*event.metadata().level(), visitor.message) else {
            return;
        };

        if self.tx.send(msg).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
