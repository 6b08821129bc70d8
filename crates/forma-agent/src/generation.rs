//! Generation steps: the designer and coder stages, backed by an LLM.
//!
//! The orchestrator only sees [`GenerationStep`]; [`LlmGenerationStep`] is the
//! production implementation, with per-session memory and an optional tool
//! (the coder's `generate_cad`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm::LlmClient;
use crate::types::{ChatMessage, FunctionDef, ModelExecutor, ToolDefinition};

/// Upper bound on model ↔ tool round trips per invocation.
pub const MAX_TOOL_ROUNDS: usize = 5;

/// Messages kept per (user, session) pair.
pub const MAX_HISTORY_MESSAGES: usize = 20;

pub const CAD_TOOL_NAME: &str = "generate_cad";

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    pub task_id: String,
    /// PNG bytes shown alongside the prompt
    pub image: Option<Vec<u8>>,
}

/// What one generation step produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// Outputs of tool calls made during the step, in call order
    pub tool_outputs: Vec<String>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_outputs: Vec::new(),
        }
    }

    /// Tool outputs then the final text, as one searchable string.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for output in &self.tool_outputs {
            out.push_str("\nTool Output: ");
            out.push_str(output);
        }
        if !self.text.is_empty() {
            out.push('\n');
            out.push_str(&self.text);
        }
        out
    }
}

/// Prompt (and optional image) in, text and tool outputs out.
#[async_trait]
pub trait GenerationStep: Send + Sync {
    async fn invoke(&self, request: GenerationRequest) -> Result<Generation>;
}

// ─── Session memory ─────────────────────────────────────────────────────────

/// Bounded conversation history keyed by user and session.
#[derive(Debug, Default)]
pub struct SessionMemory {
    sessions: Mutex<HashMap<(String, String), VecDeque<ChatMessage>>>,
    capacity: usize,
}

impl SessionMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn history(&self, user_id: &str, session_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user_id.to_string(), session_id.to_string()))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append `messages`, dropping the oldest entries beyond capacity.
    pub fn record(&self, user_id: &str, session_id: &str, messages: Vec<ChatMessage>) {
        if self.capacity == 0 {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let history = sessions
            .entry((user_id.to_string(), session_id.to_string()))
            .or_default();
        history.extend(messages);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// A tool the model may call during a step.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    /// Run the call and return the text fed back to the model.
    async fn call(&self, arguments: &str, task_id: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct CadToolArgs {
    #[serde(alias = "script_code")]
    code: String,
}

/// `generate_cad(code)`: validate, execute and export a build123d script.
pub struct CadTool {
    executor: Arc<dyn ModelExecutor>,
}

impl CadTool {
    pub fn new(executor: Arc<dyn ModelExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for CadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: CAD_TOOL_NAME.to_string(),
                description: "Execute a build123d script and export the `result` (or `part`) object to STL and STEP. Returns the exported file paths or the error.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "Complete build123d Python script assigning the model to `result`"
                        }
                    },
                    "required": ["code"]
                }),
            },
        }
    }

    async fn call(&self, arguments: &str, task_id: &str) -> String {
        let args: CadToolArgs = match serde_json::from_str(arguments) {
            Ok(a) => a,
            Err(e) => return format!("Error: invalid arguments: {}", e),
        };
        match self.executor.execute(&args.code, task_id).await {
            Ok(model) => {
                let files: serde_json::Map<String, serde_json::Value> = model
                    .files()
                    .into_iter()
                    .map(|(kind, path)| (kind.to_string(), json!(path.display().to_string())))
                    .collect();
                format!("Success. Files: {}", serde_json::Value::Object(files))
            }
            Err(e) => format!("Error: {}", e),
        }
    }
}

// ─── LLM-backed step ────────────────────────────────────────────────────────

pub struct LlmGenerationStep {
    client: Arc<LlmClient>,
    model: String,
    system_prompt: String,
    temperature: Option<f64>,
    tool: Option<Arc<dyn ToolHandler>>,
    memory: SessionMemory,
}

impl LlmGenerationStep {
    pub fn new(client: Arc<LlmClient>, model: &str, system_prompt: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            temperature: None,
            tool: None,
            memory: SessionMemory::new(MAX_HISTORY_MESSAGES),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn ToolHandler>) -> Self {
        self.tool = Some(tool);
        self
    }
}

#[async_trait]
impl GenerationStep for LlmGenerationStep {
    async fn invoke(&self, request: GenerationRequest) -> Result<Generation> {
        let user_message = match &request.image {
            Some(png) => ChatMessage::user_with_png(&request.prompt, png),
            None => ChatMessage::user(&request.prompt),
        };

        let mut messages = vec![ChatMessage::system(&self.system_prompt)];
        messages.extend(self.memory.history(&request.user_id, &request.session_id));
        messages.push(user_message);

        let tool_defs: Vec<ToolDefinition> = self.tool.iter().map(|t| t.definition()).collect();
        let mut tool_outputs = Vec::new();
        let mut text = String::new();

        for round in 0..=MAX_TOOL_ROUNDS {
            // The last round withholds tools so the model has to answer in text.
            let tools = (round < MAX_TOOL_ROUNDS && !tool_defs.is_empty()).then_some(tool_defs.as_slice());
            let reply = self
                .client
                .chat_completion(&self.model, &messages, tools, self.temperature)
                .await
                .with_context(|| format!("generation with model {} failed", self.model))?
                .into_message();

            let calls = reply.tool_calls().to_vec();
            text = reply.content.unwrap_or_default();
            let Some(tool) = self
                .tool
                .as_ref()
                .filter(|_| !calls.is_empty() && round < MAX_TOOL_ROUNDS)
            else {
                break;
            };

            tracing::debug!(task_id = %request.task_id, round, calls = calls.len(), "model requested tools");
            let content = (!text.is_empty()).then_some(text.as_str());
            messages.push(ChatMessage::assistant_with_tool_calls(content, calls.clone()));
            for call in &calls {
                let output = if call.function.name == CAD_TOOL_NAME {
                    tool.call(&call.function.arguments, &request.task_id).await
                } else {
                    format!("Error: unknown tool '{}'", call.function.name)
                };
                messages.push(ChatMessage::tool_result(&call.id, &output));
                tool_outputs.push(output);
            }
            text.clear();
        }

        self.memory.record(
            &request.user_id,
            &request.session_id,
            vec![ChatMessage::user(&request.prompt), ChatMessage::assistant(&text)],
        );
        Ok(Generation { text, tool_outputs })
    }
}
