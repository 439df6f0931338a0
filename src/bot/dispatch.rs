//! Renders the diagrams in a message and keeps posted images in sync with edits.

use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::client::{ChatClient, send_notice, upload_media};
use super::codec::ImageCodec;
use super::event::RoomMessage;
use super::extract::{DiagramBlock, DiagramExtractor};
use super::render::DiagramRenderer;
use super::tasks::{TaskSet, spawn_logged};
use super::tracker::DiagramTracker;

/// Why a single diagram could not be posted.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    /// The renderer rejected the definition.
    Render(String),
    /// The rendered SVG could not be measured or re-encoded.
    Encode(String),
    Upload(String),
    Send(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render(msg) => write!(f, "{}", msg),
            Self::Encode(msg) => write!(f, "{}", msg),
            Self::Upload(msg) => write!(f, "failed to upload diagram: {}", msg),
            Self::Send(msg) => write!(f, "failed to send diagram: {}", msg),
        }
    }
}

impl std::error::Error for RenderError {}

/// Collaborators shared by every render task.
struct RenderContext {
    client: Arc<dyn ChatClient>,
    renderer: Arc<dyn DiagramRenderer>,
    codec: Arc<dyn ImageCodec>,
    tracker: Arc<DiagramTracker>,
    /// Base name of posted images.
    image_name: String,
}

pub struct RenderDispatcher {
    extractor: DiagramExtractor,
    ctx: Arc<RenderContext>,
}

impl RenderDispatcher {
    pub fn new(
        extractor: DiagramExtractor,
        client: Arc<dyn ChatClient>,
        renderer: Arc<dyn DiagramRenderer>,
        codec: Arc<dyn ImageCodec>,
        tracker: Arc<DiagramTracker>,
    ) -> Self {
        let image_name = extractor.language().to_lowercase();
        Self {
            extractor,
            ctx: Arc::new(RenderContext {
                client,
                renderer,
                codec,
                tracker,
                image_name,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<DiagramTracker> {
        &self.ctx.tracker
    }

    /// Render every diagram in `msg`.
    ///
    /// Returns `None` when the message has no diagrams. Otherwise returns the
    /// spawned redaction, notice and render tasks; dropping the set leaves
    /// them running.
    pub fn dispatch(&self, room_id: &str, msg: &RoomMessage) -> Option<TaskSet> {
        let source_id = msg.canonical_source_id().to_string();
        let is_edit = msg.is_edit();
        let blocks = self.extractor.extract(msg.body()?).into_blocks()?;

        let noun = if blocks.len() > 1 { "diagrams" } else { "diagram" };
        let verb = if is_edit { "Re-rendering" } else { "Rendering" };
        info!("🎨 {} {} {} for {}", verb, blocks.len(), noun, source_id);

        let mut tasks = TaskSet::new();

        if is_edit {
            let stale = match self.ctx.tracker.outputs_for(&source_id) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Could not look up previous renders of {}: {}", source_id, e);
                    vec![]
                }
            };
            let reason = format!("The {noun} prompt has been edited.");
            for output_id in stale {
                let client = self.ctx.client.clone();
                let room = room_id.to_string();
                let reason = reason.clone();
                tasks.push(spawn_logged(format!("Redacting {output_id}"), async move {
                    client.redact_event(&room, &output_id, &reason).await
                }));
            }
        }

        {
            let client = self.ctx.client.clone();
            let room = room_id.to_string();
            let source = source_id.clone();
            let text = format!("{verb} {noun}...");
            tasks.push(spawn_logged("Progress notice", async move {
                send_notice(client.as_ref(), &room, &text, Some(&source)).await.map(|_| ())
            }));
        }

        for (index, block) in blocks.into_iter().enumerate() {
            let ctx = self.ctx.clone();
            let room = room_id.to_string();
            let source = source_id.clone();
            tasks.push(spawn_logged(format!("Diagram {} of {}", index + 1, source_id), async move {
                match render_and_post(&ctx, &room, &source, &block).await {
                    Ok(event_id) => {
                        info!("🖼️ Posted {} for {}", event_id, source);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Diagram {} of {} failed: {}", index + 1, source, e);
                        send_notice(ctx.client.as_ref(), &room, &e.to_string(), Some(&source))
                            .await
                            .map(|_| ())
                    }
                }
            }));
        }

        Some(tasks)
    }
}

/// Render one block, post it and record it. Returns the image event id.
async fn render_and_post(
    ctx: &RenderContext,
    room_id: &str,
    source_id: &str,
    block: &DiagramBlock,
) -> Result<String, RenderError> {
    let svg = ctx
        .renderer
        .render(&block.definition)
        .await
        .map_err(RenderError::Render)?;

    let encoded = encode(ctx.codec.clone(), svg, block.clone()).await?;
    let (width, height) = (encoded.width, encoded.height);

    let client = ctx.client.as_ref();
    let filename = format!("{}.{}", ctx.image_name, block.extension);
    let file = upload_media(client, room_id, encoded.data, &block.mimetype, &filename)
        .await
        .map_err(RenderError::Upload)?;

    let mut info = json!({
        "mimetype": block.mimetype,
        "w": width,
        "h": height,
    });

    if let Some(thumbnail) = encoded.thumbnail {
        let thumbnail_name = format!("{}-thumbnail.png", ctx.image_name);
        let source = upload_media(client, room_id, thumbnail, "image/png", &thumbnail_name)
            .await
            .map_err(RenderError::Upload)?;
        source.attach(&mut info, "thumbnail_url", "thumbnail_file");
        info["thumbnail_info"] = json!({
            "mimetype": "image/png",
            "w": width,
            "h": height,
        });
    }

    let mut content = json!({
        "msgtype": "m.image",
        "body": filename,
        "info": info,
        "m.relates_to": { "m.in_reply_to": { "event_id": source_id } },
    });
    file.attach(&mut content, "url", "file");

    let event_id = client
        .send_message(room_id, content)
        .await
        .map_err(RenderError::Send)?;

    // The image is already posted; a tracking failure only costs edit cleanup.
    if let Err(e) = ctx.tracker.record_output(source_id, &event_id) {
        warn!("Posted {} but could not record it: {}", event_id, e);
    }

    Ok(event_id)
}

/// Bytes ready for upload.
struct Encoded {
    data: Vec<u8>,
    /// PNG preview for vector output.
    thumbnail: Option<Vec<u8>>,
    width: u32,
    height: u32,
}

/// Measure and encode on the blocking pool; rasterising is CPU-bound.
async fn encode(codec: Arc<dyn ImageCodec>, svg: String, block: DiagramBlock) -> Result<Encoded, RenderError> {
    tokio::task::spawn_blocking(move || {
        let (width, height) = codec.dimensions(&svg).map_err(RenderError::Encode)?;

        let (data, thumbnail) = if block.is_vector() {
            let thumbnail = codec.rasterize(&svg, "png").map_err(RenderError::Encode)?;
            (svg.into_bytes(), Some(thumbnail))
        } else {
            let data = codec
                .rasterize(&svg, &block.extension)
                .map_err(RenderError::Encode)?;
            (data, None)
        };

        Ok(Encoded {
            data,
            thumbnail,
            width,
            height,
        })
    })
    .await
    .map_err(|e| RenderError::Encode(format!("image encoding stopped: {e}")))?
}
