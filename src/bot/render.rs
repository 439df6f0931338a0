//! Diagram definition to SVG, via the Mermaid CLI.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Mermaid config passed to every render. Resvg cannot draw HTML labels
/// (`foreignObject`), so flowcharts use plain SVG text.
const MERMAID_CONFIG: &str = r#"{ "flowchart": { "htmlLabels": false } }"#;

/// Turns a diagram definition into SVG markup.
#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, definition: &str) -> Result<String, String>;
}

/// Renderer backed by `mmdc`.
#[derive(Debug, Clone)]
pub struct MermaidCli {
    command: Vec<String>,
    puppeteer_config: Option<PathBuf>,
}

impl MermaidCli {
    /// `command` is the program followed by any fixed arguments,
    /// e.g. `["npx", "-p", "@mermaid-js/mermaid-cli", "mmdc"]`.
    pub fn new(command: Vec<String>, puppeteer_config: Option<PathBuf>) -> Self {
        Self {
            command,
            puppeteer_config,
        }
    }

    fn label(&self) -> String {
        self.command.join(" ")
    }
}

impl Default for MermaidCli {
    fn default() -> Self {
        Self::new(vec!["mmdc".to_string()], None)
    }
}

#[async_trait]
impl DiagramRenderer for MermaidCli {
    async fn render(&self, definition: &str) -> Result<String, String> {
        let Some((program, args)) = self.command.split_first() else {
            return Err("renderer command is empty".to_string());
        };

        let dir = tempfile::tempdir().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let input_path = dir.path().join("diagram.mmd");
        let output_path = dir.path().join("diagram.svg");
        let config_path = dir.path().join("mermaid.json");

        tokio::fs::write(&input_path, definition)
            .await
            .map_err(|e| format!("Failed to write diagram definition: {e}"))?;
        tokio::fs::write(&config_path, MERMAID_CONFIG)
            .await
            .map_err(|e| format!("Failed to write mermaid config: {e}"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg("--quiet")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--outputFormat")
            .arg("svg")
            .arg("--configFile")
            .arg(&config_path);

        if let Some(ref puppeteer) = self.puppeteer_config {
            command.arg("--puppeteerConfigFile").arg(puppeteer);
        }

        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to run {}: {e}", self.label()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                format!("{} exited with {}", self.label(), output.status)
            } else {
                stderr
            });
        }

        let svg = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| format!("Failed to read rendered SVG: {e}"))?;

        debug!("Rendered diagram ({} bytes of SVG)", svg.len());
        Ok(svg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let renderer = MermaidCli::new(vec![], None);
        let err = renderer.render("graph TD; A-->B").await.unwrap_err();
        assert!(err.contains("empty"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let renderer = MermaidCli::new(vec!["definitely-not-a-real-mmdc-binary".to_string()], None);
        let err = renderer.render("graph TD; A-->B").await.unwrap_err();
        assert!(err.contains("Failed to run"));
    }

    #[test]
    fn test_default_command() {
        let renderer = MermaidCli::default();
        assert_eq!(renderer.label(), "mmdc");
    }
}
