//! Diagram bot - renders fenced diagram blocks posted to Matrix rooms.

pub mod client;
pub mod codec;
pub mod commands;
pub mod dispatch;
pub mod event;
pub mod extract;
pub mod matrix;
pub mod pending;
pub mod render;
pub mod router;
pub mod sync;
pub mod tasks;
pub mod tracker;

#[cfg(test)]
pub mod testing;

pub use client::ChatClient;
pub use codec::{ImageCodec, SvgCodec};
pub use dispatch::{RenderDispatcher, RenderError};
pub use extract::{DiagramBlock, DiagramExtractor, Extraction};
pub use matrix::MatrixClient;
pub use render::{DiagramRenderer, MermaidCli};
pub use router::{DiagramBot, RouterConfig};
pub use sync::{SyncLoop, SyncSettings};
pub use tasks::TaskSet;
pub use tracker::DiagramTracker;
