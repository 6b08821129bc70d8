//! Shared types for the generation pipeline: chat wire types, the event
//! sink, and the execution/render seams the orchestrator is wired through.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use forma_sandbox::{ExecutionResult, RenderedPreview, SandboxError, SandboxExecutor};
use serde::{Deserialize, Serialize};

/// Truncate to at most `max_chars` characters (never splits a code point).
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Chat wire types (OpenAI-compatible) ────────────────────────────────────

/// One content block of a multimodal user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: plain text, or a list of parts when an image rides along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_text("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_text("user", content)
    }

    /// User message carrying a PNG as a base64 data URL after the text.
    pub fn user_with_png(content: &str, png: &[u8]) -> Self {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: content.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/png;base64,{}", encoded),
                    },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_text("assistant", content)
    }

    pub fn assistant_with_tool_calls(content: Option<&str>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.map(|c| MessageContent::Text(c.to_string())),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(MessageContent::Text(content.to_string())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    /// Text of the message, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(t)) => t.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the model
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ─── Event sink ─────────────────────────────────────────────────────────────

/// Receives human-readable pipeline output as it is produced.
pub trait EventSink: Send {
    /// A chunk of progress text, in emission order.
    fn on_text_chunk(&mut self, chunk: &str);
    /// A CODE iteration is about to start (1-based).
    fn on_iteration_start(&mut self, _iteration: u32) {}
}

/// Prints chunks to stdout as they arrive (CLI `run`).
pub struct TerminalEventSink {
    pub verbose: bool,
}

impl TerminalEventSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for TerminalEventSink {
    fn on_text_chunk(&mut self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        if !chunk.ends_with('\n') {
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }

    fn on_iteration_start(&mut self, iteration: u32) {
        if self.verbose {
            eprintln!("── attempt {} ──", iteration);
        }
    }
}

/// Collects chunks in memory.
#[derive(Debug, Default)]
pub struct BufferedEventSink {
    pub chunks: Vec<String>,
}

impl EventSink for BufferedEventSink {
    fn on_text_chunk(&mut self, chunk: &str) {
        self.chunks.push(chunk.to_string());
    }
}

// ─── Execution seams ────────────────────────────────────────────────────────

/// Runs generated scripts and exports their artifacts.
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(&self, code: &str, task_id: &str) -> ExecutionResult;
    /// Directory artifacts land in; transcript references resolve against it.
    fn output_dir(&self) -> &Path;
}

/// Turns a mesh into PNG previews.
#[async_trait]
pub trait RenderStep: Send + Sync {
    async fn render(&self, mesh: &Path) -> Result<RenderedPreview, SandboxError>;
}

#[async_trait]
impl ModelExecutor for SandboxExecutor {
    async fn execute(&self, code: &str, task_id: &str) -> ExecutionResult {
        SandboxExecutor::execute(self, code, task_id).await
    }

    fn output_dir(&self) -> &Path {
        SandboxExecutor::output_dir(self)
    }
}

#[async_trait]
impl RenderStep for SandboxExecutor {
    async fn render(&self, mesh: &Path) -> Result<RenderedPreview, SandboxError> {
        SandboxExecutor::render(self, mesh).await
    }
}
