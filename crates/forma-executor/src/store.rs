//! In-memory task registry shared by the HTTP handlers and the pipelines.
//!
//! `update` is the only mutator. Tasks live for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;

use crate::task::{Artifact, Message, Task, TaskState, TaskStatus};

/// What [`TaskStore::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    UnknownTask,
    /// The task is terminal and the requested state is not.
    TransitionRefused { current: TaskState },
}

/// Concurrency-safe `task id → Task` map. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new SUBMITTED task. A context id is generated when absent.
    pub fn create(&self, context_id: Option<&str>) -> Task {
        let context_id = context_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            context_id,
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Utc::now(),
            },
            artifacts: None,
            history: Vec::new(),
            metadata: None,
        };
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task.clone());
        tracing::debug!(task_id = %task.id, context_id = %task.context_id, "task created");
        task
    }

    /// Snapshot of the task.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    /// Set state and timestamp; with a message, make it the status message,
    /// append it to history and record its file parts as artifacts.
    ///
    /// Unknown ids are ignored. A terminal task only accepts terminal states.
    pub fn update(&self, task_id: &str, state: TaskState, message: Option<Message>) -> UpdateOutcome {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let Some(task) = tasks.get_mut(task_id) else {
            tracing::debug!(task_id, "update for unknown task ignored");
            return UpdateOutcome::UnknownTask;
        };

        let current = task.status.state;
        if current.is_terminal() && !state.is_terminal() {
            tracing::warn!(task_id, ?current, requested = ?state, "refusing to reopen terminal task");
            return UpdateOutcome::TransitionRefused { current };
        }

        task.status.state = state;
        task.status.timestamp = Utc::now();
        if let Some(mut message) = message {
            message.task_id = Some(task.id.clone());
            message.context_id = Some(task.context_id.clone());
            if message.message_id.is_none() {
                message.message_id = Some(uuid::Uuid::new_v4().to_string());
            }
            let files: Vec<_> = message
                .parts
                .iter()
                .filter(|p| p.as_file().is_some())
                .cloned()
                .collect();
            if !files.is_empty() {
                task.artifacts
                    .get_or_insert_with(Artifact::default)
                    .parts
                    .extend(files);
            }
            task.history.push(message.clone());
            task.status.message = Some(message);
        }
        UpdateOutcome::Applied
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
