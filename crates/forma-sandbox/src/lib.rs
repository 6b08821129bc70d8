//! Static validation and isolated execution of generated CAD scripts.

pub mod common;
pub mod log;
pub mod runner;
pub mod validator;
pub mod worker;

pub use common::ResourceLimits;
pub use runner::{
    artifact_base_name, ExecutionResult, ExportedModel, FailureCategory, RenderedPreview,
    SandboxConfig, SandboxError, SandboxExecutor,
};
pub use validator::{validate_code, CodeValidator, ValidationError, Violation, ViolationKind};
