//! The generation pipeline as an explicit state machine.
//!
//! ```text
//! Spec ─► Code ─► Verify ─► approved: done
//!          ▲        │
//!          └─ Retry ◄┘ (or Code fails)     ceiling reached: Exhausted
//! ```
//!
//! Every human-readable step output goes to the [`EventSink`] as soon as it
//! exists. Failures inside an iteration become the next specification;
//! only generation-backend errors abort the run.

pub mod extract;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use forma_core::config::{LlmConfig, PipelineSettings};
use forma_sandbox::{FailureCategory, SandboxError, SandboxExecutor};
use thiserror::Error;

use crate::generation::{CadTool, GenerationRequest, GenerationStep, LlmGenerationStep};
use crate::llm::LlmClient;
use crate::prompt;
use crate::types::{EventSink, ModelExecutor, RenderStep};

/// Why one CODE/VERIFY iteration did not produce an approved model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IterationFailure {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ExecutionTimeout(String),
    /// Exception, missing result binding, or worker failure
    #[error("{0}")]
    ExecutionFault(String),
    #[error("{0}")]
    RenderFault(String),
    #[error("No code block or STL file found.")]
    NoArtifactFound,
    /// The designer reviewed the preview and asked for changes
    #[error("{0}")]
    Rejected(String),
}

impl IterationFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_violation",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::ExecutionFault(_) => "execution_fault",
            Self::RenderFault(_) => "render_fault",
            Self::NoArtifactFound => "no_artifact_found",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl From<SandboxError> for IterationFailure {
    fn from(e: SandboxError) -> Self {
        let detail = e.to_string();
        match e.category() {
            FailureCategory::ValidationViolation => Self::Validation(detail),
            FailureCategory::TimedOut => Self::ExecutionTimeout(detail),
            FailureCategory::ResourceExceeded
            | FailureCategory::NoResultProduced
            | FailureCategory::ExecutionFault
            | FailureCategory::WorkerError => Self::ExecutionFault(detail),
        }
    }
}

/// Exported files of the model under review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub mesh: PathBuf,
    pub brep: Option<PathBuf>,
}

impl ModelFiles {
    fn from_mesh(mesh: PathBuf) -> Self {
        let brep = extract::sibling_brep(&mesh);
        Self { mesh, brep }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    pub task_id: String,
}

impl PipelineRequest {
    pub fn new(prompt: &str, session_id: &str, task_id: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            session_id: session_id.to_string(),
            user_id: "user".to_string(),
            task_id: task_id.to_string(),
        }
    }

    fn generation(&self, prompt: String, image: Option<Vec<u8>>) -> GenerationRequest {
        GenerationRequest {
            prompt,
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            task_id: self.task_id.clone(),
            image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Approved {
        message: String,
        model: ModelFiles,
        preview: PathBuf,
        iterations: usize,
    },
    Exhausted {
        iterations: usize,
        last_failure: Option<IterationFailure>,
    },
}

enum State {
    Spec,
    Code { spec: String },
    Verify { spec: String, model: ModelFiles },
    Retry { next_spec: String, failure: IterationFailure },
}

pub struct Orchestrator {
    designer: Arc<dyn GenerationStep>,
    coder: Arc<dyn GenerationStep>,
    executor: Arc<dyn ModelExecutor>,
    renderer: Arc<dyn RenderStep>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        designer: Arc<dyn GenerationStep>,
        coder: Arc<dyn GenerationStep>,
        executor: Arc<dyn ModelExecutor>,
        renderer: Arc<dyn RenderStep>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            designer,
            coder,
            executor,
            renderer,
            settings,
        }
    }

    /// Production wiring: LLM designer and coder, the sandbox for both
    /// execution and rendering.
    pub fn with_llm(
        llm: &LlmConfig,
        sandbox: SandboxExecutor,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let client = Arc::new(LlmClient::new(&llm.api_base, &llm.api_key)?);
        let sandbox = Arc::new(sandbox);
        let designer = LlmGenerationStep::new(
            Arc::clone(&client),
            &llm.designer_model,
            prompt::DESIGNER_SYSTEM_PROMPT,
        )
        .with_temperature(llm.temperature);
        let coder = LlmGenerationStep::new(client, &llm.coder_model, prompt::CODER_SYSTEM_PROMPT)
            .with_temperature(llm.temperature)
            .with_tool(Arc::new(CadTool::new(sandbox.clone())));
        Ok(Self::new(
            Arc::new(designer),
            Arc::new(coder),
            sandbox.clone(),
            sandbox,
            settings,
        ))
    }

    /// Drive one request from prompt to approved model or exhausted retries.
    ///
    /// `Err` only when a generation step fails; the caller reports it.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        sink: &mut dyn EventSink,
    ) -> Result<PipelineOutcome> {
        let task_id = request.task_id.as_str();
        let max_iterations = self.settings.max_iterations.max(1);
        let mut original_spec = String::new();
        let mut iterations = 0usize;
        let mut last_failure = None;
        let mut state = State::Spec;

        loop {
            state = match state {
                State::Spec => {
                    let spec = self
                        .designer
                        .invoke(request.generation(request.prompt.clone(), None))
                        .await?
                        .text;
                    tracing::info!(task_id, spec_chars = spec.chars().count(), "specification ready");
                    sink.on_text_chunk(&prompt::spec_preview(&spec));
                    original_spec = spec.clone();
                    State::Code { spec }
                }

                State::Code { spec } => {
                    if iterations >= max_iterations {
                        tracing::warn!(task_id, iterations, "retry ceiling reached");
                        sink.on_text_chunk(prompt::EXHAUSTED_MESSAGE);
                        return Ok(PipelineOutcome::Exhausted {
                            iterations,
                            last_failure,
                        });
                    }
                    iterations += 1;
                    sink.on_iteration_start(iterations as u32);
                    tracing::info!(task_id, iteration = iterations, "running coder");

                    let generation = self
                        .coder
                        .invoke(request.generation(prompt::coder_input(&spec), None))
                        .await?;
                    if !generation.text.is_empty() {
                        sink.on_text_chunk(&generation.text);
                    }
                    match self.resolve_model(&generation.transcript(), task_id).await {
                        Ok(model) => State::Verify { spec, model },
                        Err(failure) => State::Retry {
                            next_spec: prompt::retry_after_error(&original_spec, &failure.to_string()),
                            failure,
                        },
                    }
                }

                State::Verify { spec, model } => {
                    tracing::info!(task_id, mesh = %model.mesh.display(), "rendering model");
                    let preview = match self.renderer.render(&model.mesh).await {
                        Ok(rendered) => tokio::fs::read(&rendered.preview)
                            .await
                            .map(|png| (rendered.preview, png))
                            .map_err(|e| format!("cannot read preview: {}", e)),
                        Err(e) => Err(e.to_string()),
                    };
                    match preview {
                        Err(detail) => {
                            sink.on_text_chunk(prompt::RENDER_FAILED_CHUNK);
                            State::Retry {
                                next_spec: spec,
                                failure: IterationFailure::RenderFault(detail),
                            }
                        }
                        Ok((preview, png)) => {
                            sink.on_text_chunk(&format!("Generated Image: {}\n", preview.display()));
                            let review = self
                                .designer
                                .invoke(request.generation(prompt::review_input(&original_spec), Some(png)))
                                .await?
                                .text;
                            match prompt::approval_message(&review) {
                                Some(message) => {
                                    tracing::info!(task_id, iterations, "design approved");
                                    sink.on_text_chunk(&format!("{}\n", message));
                                    return Ok(PipelineOutcome::Approved {
                                        message,
                                        model,
                                        preview,
                                        iterations,
                                    });
                                }
                                None => {
                                    sink.on_text_chunk(&format!("Designer Feedback: {}\n", review));
                                    State::Retry {
                                        next_spec: prompt::retry_after_feedback(&original_spec, &review),
                                        failure: IterationFailure::Rejected(review),
                                    }
                                }
                            }
                        }
                    }
                }

                State::Retry { next_spec, failure } => {
                    tracing::info!(task_id, iteration = iterations, kind = failure.kind(), "iteration failed");
                    last_failure = Some(failure);
                    State::Code { spec: next_spec }
                }
            };
        }
    }

    /// Referenced STL first, then the code-block fallback.
    async fn resolve_model(&self, transcript: &str, task_id: &str) -> Result<ModelFiles, IterationFailure> {
        if let Some(mesh) = extract::find_stl_reference(transcript, self.executor.output_dir()) {
            return Ok(ModelFiles::from_mesh(mesh));
        }
        let code = extract::extract_code_block(transcript).ok_or(IterationFailure::NoArtifactFound)?;
        tracing::debug!(task_id, "no STL referenced; executing fenced code block");
        let exported = self.executor.execute(&code, task_id).await?;
        Ok(ModelFiles {
            mesh: exported.mesh,
            brep: Some(exported.brep),
        })
    }
}
