//! Finds fenced diagram blocks in message bodies.
//!
//! A block opens with a fence tagged with the diagram language, optionally
//! followed by a requested output extension (```` ```mermaid.svg ````), and
//! runs until the next closing fence.

use regex::Regex;
use tracing::debug;

/// Extension used when the fence header does not request one.
pub const DEFAULT_EXTENSION: &str = "png";

/// Extensions whose mimetype is not simply `image/{ext}`.
///
/// `svg+xml` maps to the bare `svg`; this asymmetry is kept on purpose so
/// existing prompts keep behaving the same way.
const MIMETYPE_OVERRIDES: &[(&str, &str)] = &[
    ("svg", "image/svg+xml"),
    ("svg+xml", "svg"),
    ("jpg", "image/jpeg"),
];

/// One diagram definition found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramBlock {
    pub definition: String,
    pub mimetype: String,
    pub extension: String,
}

impl DiagramBlock {
    /// True when the block should be posted as vector markup rather than re-encoded.
    pub fn is_vector(&self) -> bool {
        self.mimetype.contains("svg")
    }
}

/// Result of scanning a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The body contains no fenced diagram blocks at all.
    None,
    /// Fenced blocks were found. Blocks with an empty definition are dropped,
    /// so this list can be empty.
    Blocks(Vec<DiagramBlock>),
}

impl Extraction {
    /// Blocks to render, or `None` when there is nothing to do.
    pub fn into_blocks(self) -> Option<Vec<DiagramBlock>> {
        match self {
            Extraction::None => {
                debug!("No diagram blocks found");
                None
            }
            Extraction::Blocks(blocks) if blocks.is_empty() => {
                debug!("Diagram fences matched but every definition was empty");
                None
            }
            Extraction::Blocks(blocks) => Some(blocks),
        }
    }
}

/// Parser for one diagram language marker.
#[derive(Debug, Clone)]
pub struct DiagramExtractor {
    language: String,
    fence: Regex,
}

impl DiagramExtractor {
    pub fn new(language: &str) -> Result<Self, String> {
        let pattern = format!(r"(?is)```{}\b(.*?)```", regex::escape(language));
        let fence = Regex::new(&pattern)
            .map_err(|e| format!("invalid diagram fence for '{language}': {e}"))?;
        Ok(Self {
            language: language.to_string(),
            fence,
        })
    }

    /// The fence marker, also used as the base name of posted images.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Scan `body` for diagram blocks, in order of appearance.
    pub fn extract(&self, body: &str) -> Extraction {
        let mut matched = false;
        let mut blocks = Vec::new();

        for captures in self.fence.captures_iter(body) {
            matched = true;
            let inner = captures.get(1).map(|m| m.as_str()).unwrap_or("");

            // The header is whatever follows the marker on the fence line.
            let (header, definition) = match inner.split_once('\n') {
                Some((header, rest)) => (header, rest),
                None => (inner, ""),
            };

            let definition = definition.trim();
            if definition.is_empty() {
                continue;
            }

            let extension = match header.rfind('.') {
                Some(dot) => header[dot + 1..].trim().to_lowercase(),
                None => DEFAULT_EXTENSION.to_string(),
            };

            debug!("Found {} block ({})", self.language, extension);
            blocks.push(DiagramBlock {
                definition: definition.to_string(),
                mimetype: mimetype_for(&extension),
                extension,
            });
        }

        if matched {
            Extraction::Blocks(blocks)
        } else {
            Extraction::None
        }
    }
}

/// Map a requested extension to the mimetype advertised on the image message.
pub fn mimetype_for(extension: &str) -> String {
    MIMETYPE_OVERRIDES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mimetype)| mimetype.to_string())
        .unwrap_or_else(|| format!("image/{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> DiagramExtractor {
        DiagramExtractor::new("diagram").unwrap()
    }

    fn blocks(body: &str) -> Vec<DiagramBlock> {
        match extractor().extract(body) {
            Extraction::Blocks(blocks) => blocks,
            Extraction::None => vec![],
        }
    }

    #[test]
    fn test_default_extension_is_png() {
        let found = blocks("```diagram\nA\n```");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].definition, "A");
        assert_eq!(found[0].extension, "png");
        assert_eq!(found[0].mimetype, "image/png");
    }

    #[test]
    fn test_svg_extension() {
        let found = blocks("```diagram.svg\nA\n```");
        assert_eq!(found[0].extension, "svg");
        assert_eq!(found[0].mimetype, "image/svg+xml");
        assert!(found[0].is_vector());
    }

    #[test]
    fn test_mimetype_table() {
        assert_eq!(mimetype_for("svg"), "image/svg+xml");
        assert_eq!(mimetype_for("svg+xml"), "svg");
        assert_eq!(mimetype_for("jpg"), "image/jpeg");
        assert_eq!(mimetype_for("webp"), "image/webp");
        assert_eq!(mimetype_for("png"), "image/png");
    }

    #[test]
    fn test_extension_is_lowercased_and_uses_last_dot() {
        let found = blocks("```diagram.v2.JPG\ngraph TD\n```");
        assert_eq!(found[0].extension, "jpg");
        assert_eq!(found[0].mimetype, "image/jpeg");
    }

    #[test]
    fn test_blocks_in_source_order() {
        let body = "intro\n```diagram\nfirst\n```\ntext between\n```diagram.svg\nsecond\n```\n```diagram\nthird\n```";
        let found = blocks(body);
        let definitions: Vec<&str> = found.iter().map(|b| b.definition.as_str()).collect();
        assert_eq!(definitions, vec!["first", "second", "third"]);
        assert_eq!(found[1].extension, "svg");
    }

    #[test]
    fn test_marker_is_case_insensitive() {
        assert_eq!(blocks("```Diagram\nA\n```").len(), 1);
    }

    #[test]
    fn test_other_languages_are_ignored() {
        assert_eq!(extractor().extract("```rust\nfn main() {}\n```"), Extraction::None);
        assert_eq!(extractor().extract("```diagrams\nA\n```"), Extraction::None);
    }

    #[test]
    fn test_plain_text_has_no_blocks() {
        let extraction = extractor().extract("just chatting");
        assert_eq!(extraction, Extraction::None);
        assert_eq!(extraction.into_blocks(), None);
    }

    #[test]
    fn test_matched_but_empty_blocks_do_nothing() {
        let extraction = extractor().extract("```diagram\n```");
        assert_eq!(extraction, Extraction::Blocks(vec![]));
        assert_eq!(extraction.into_blocks(), None);
    }

    #[test]
    fn test_empty_block_is_skipped_between_real_ones() {
        let found = blocks("```diagram\nA\n```\n```diagram\n   \n```\n```diagram\nB\n```");
        assert_eq!(found.len(), 2);
    }
}
