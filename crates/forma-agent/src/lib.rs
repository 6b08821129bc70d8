//! Generation pipeline for Forma: designer and coder steps over an
//! OpenAI-compatible LLM, the orchestrating state machine, and the task
//! runner that reports progress into the task store.

pub mod generation;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod task_runner;
pub mod types;

#[cfg(test)]
mod test_support;

pub use generation::{Generation, GenerationRequest, GenerationStep, LlmGenerationStep};
pub use orchestrator::{IterationFailure, ModelFiles, Orchestrator, PipelineOutcome, PipelineRequest};
pub use task_runner::{run_pipeline_task, spawn_pipeline_task};
pub use types::{EventSink, ModelExecutor, RenderStep, TerminalEventSink};
