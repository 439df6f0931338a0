//! SVG measurement and rasterisation.

use image::ImageFormat;
use resvg::tiny_skia::{Color, Pixmap, Transform};
use resvg::usvg::{self, Tree, fontdb};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Image operations on rendered SVG markup.
pub trait ImageCodec: Send + Sync {
    /// Pixel width and height of the SVG.
    fn dimensions(&self, svg: &str) -> Result<(u32, u32), String>;

    /// Rasterise the SVG and encode it as `extension`.
    fn rasterize(&self, svg: &str, extension: &str) -> Result<Vec<u8>, String>;
}

/// Codec backed by resvg for drawing and `image` for encoding.
pub struct SvgCodec {
    fontdb: Arc<fontdb::Database>,
}

impl SvgCodec {
    /// Codec that can draw text with the system's fonts.
    pub fn with_system_fonts() -> Self {
        let mut fonts = fontdb::Database::new();
        fonts.load_system_fonts();
        debug!("Loaded {} font faces", fonts.len());
        Self {
            fontdb: Arc::new(fonts),
        }
    }

    /// Codec without fonts; text is not drawn.
    pub fn without_fonts() -> Self {
        Self {
            fontdb: Arc::new(fontdb::Database::new()),
        }
    }

    fn parse(&self, svg: &str) -> Result<Tree, String> {
        let options = usvg::Options {
            fontdb: self.fontdb.clone(),
            ..usvg::Options::default()
        };
        Tree::from_str(svg, &options).map_err(|e| format!("Invalid SVG: {e}"))
    }
}

impl ImageCodec for SvgCodec {
    fn dimensions(&self, svg: &str) -> Result<(u32, u32), String> {
        let size = self.parse(svg)?.size().to_int_size();
        Ok((size.width(), size.height()))
    }

    fn rasterize(&self, svg: &str, extension: &str) -> Result<Vec<u8>, String> {
        let format = ImageFormat::from_extension(extension)
            .filter(|f| f.writing_enabled())
            .ok_or_else(|| format!("Unsupported image format '{extension}'"))?;

        let tree = self.parse(svg)?;
        let size = tree.size().to_int_size();
        let mut pixmap = Pixmap::new(size.width(), size.height())
            .ok_or_else(|| format!("Cannot rasterise an empty {}x{} image", size.width(), size.height()))?;

        // No alpha channel: draw on white instead of letting transparency turn black.
        if format == ImageFormat::Jpeg {
            pixmap.fill(Color::WHITE);
        }
        resvg::render(&tree, Transform::default(), &mut pixmap.as_mut());

        let png = pixmap
            .encode_png()
            .map_err(|e| format!("Failed to encode PNG: {e}"))?;
        if format == ImageFormat::Png {
            return Ok(png);
        }

        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .map_err(|e| format!("Failed to decode rasterised image: {e}"))?;
        let decoded = if format == ImageFormat::Jpeg {
            image::DynamicImage::ImageRgb8(decoded.to_rgb8())
        } else {
            decoded
        };

        let mut buffer = Cursor::new(Vec::new());
        decoded
            .write_to(&mut buffer, format)
            .map_err(|e| format!("Failed to encode {extension}: {e}"))?;
        Ok(buffer.into_inner())
    }
}
