//! Runs a pipeline on behalf of a task and reports into the [`TaskStore`].
//!
//! One tokio task per submitted task. Progress chunks become WORKING agent
//! messages; the outcome becomes the terminal message.

use std::path::Path;
use std::sync::Arc;

use forma_executor::{Message, Part, TaskState, TaskStore};
use tokio::task::JoinHandle;

use crate::orchestrator::{ModelFiles, Orchestrator, PipelineOutcome, PipelineRequest};
use crate::prompt;
use crate::types::EventSink;

/// URL prefix the HTTP layer serves the artifact directory under.
pub const DOWNLOAD_PREFIX: &str = "/download";

/// Appends every progress chunk to the task history as WORKING.
pub struct TaskProgressSink {
    store: TaskStore,
    task_id: String,
}

impl TaskProgressSink {
    pub fn new(store: TaskStore, task_id: &str) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
        }
    }
}

impl EventSink for TaskProgressSink {
    fn on_text_chunk(&mut self, chunk: &str) {
        let text = chunk.trim();
        if text.is_empty() {
            return;
        }
        self.store
            .update(&self.task_id, TaskState::Working, Some(Message::agent_text(text)));
    }
}

/// Spawn the pipeline for `request.task_id`. The handle resolves once the
/// task is terminal; dropping it does not cancel the run.
pub fn spawn_pipeline_task(
    orchestrator: Arc<Orchestrator>,
    store: TaskStore,
    request: PipelineRequest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = request.task_id.clone();
        let inner_store = store.clone();
        let run = tokio::spawn(async move {
            run_pipeline_task(&orchestrator, &inner_store, &request).await;
        });
        if let Err(e) = run.await {
            tracing::error!(task_id = %task_id, error = %e, "pipeline task aborted");
            store.update(
                &task_id,
                TaskState::Failed,
                Some(Message::agent_text(format!(
                    "Internal error during generation: {}",
                    e
                ))),
            );
        }
    })
}

/// Drive one task to a terminal state.
pub async fn run_pipeline_task(orchestrator: &Orchestrator, store: &TaskStore, request: &PipelineRequest) {
    let task_id = request.task_id.as_str();
    tracing::info!(task_id, context_id = %request.session_id, "processing task");
    store.update(task_id, TaskState::Working, None);

    let mut sink = TaskProgressSink::new(store.clone(), task_id);
    let (state, message) = match orchestrator.run(request, &mut sink).await {
        Ok(PipelineOutcome::Approved {
            message,
            model,
            iterations,
            ..
        }) => {
            tracing::info!(task_id, iterations, "task completed");
            (TaskState::Completed, completion_message(&message, &model))
        }
        Ok(PipelineOutcome::Exhausted {
            iterations,
            last_failure,
        }) => {
            tracing::warn!(
                task_id,
                iterations,
                last_failure = last_failure.as_ref().map(|f| f.kind()),
                "task failed after retries"
            );
            (
                TaskState::Failed,
                Message::agent_text(prompt::EXHAUSTED_MESSAGE.trim_end()),
            )
        }
        Err(e) => {
            tracing::error!(task_id, error = ?e, "task errored");
            (
                TaskState::Failed,
                Message::agent_text(format!("Internal error during generation: {}", e)),
            )
        }
    };
    store.update(task_id, state, Some(message));
}

/// Friendly text plus download references for the mesh and, when present,
/// the B-rep.
pub fn completion_message(text: &str, model: &ModelFiles) -> Message {
    let mut parts = vec![Part::text(text)];
    parts.extend(download_part(&model.mesh, "model/stl"));
    if let Some(brep) = &model.brep {
        parts.extend(download_part(brep, "model/step"));
    }
    Message::agent(parts)
}

fn download_part(path: &Path, media_type: &str) -> Option<Part> {
    let name = path.file_name()?.to_str()?;
    Some(Part::file_uri(
        format!("{}/{}", DOWNLOAD_PREFIX, name),
        name,
        media_type,
    ))
}
