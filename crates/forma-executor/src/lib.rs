//! Task bookkeeping: the A2A task model and the in-memory store the
//! pipelines report into.

pub mod store;
pub mod task;

pub use store::{TaskStore, UpdateOutcome};
pub use task::{Artifact, FilePart, Message, Part, PartContent, Role, Task, TaskState, TaskStatus};
