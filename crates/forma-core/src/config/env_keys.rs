//! Environment variable keys and their aliases.
//!
//! Primary keys use the `FORMA_*` prefix. Aliases keep `.env` files written
//! for OpenAI-compatible tooling and older deployments working.

/// Generation backend (OpenAI-compatible API)
pub mod llm {
    pub const API_BASE: &str = "FORMA_API_BASE";
    pub const API_BASE_ALIASES: &[&str] = &["VLLM_API_BASE", "OPENAI_API_BASE", "OPENAI_BASE_URL"];

    pub const API_KEY: &str = "FORMA_API_KEY";
    pub const API_KEY_ALIASES: &[&str] = &["VLLM_API_KEY", "OPENAI_API_KEY"];

    /// Model used for the designer (spec + review) step
    pub const DESIGNER_MODEL: &str = "FORMA_DESIGNER_MODEL";
    /// Model used for the coder step
    pub const CODER_MODEL: &str = "FORMA_CODER_MODEL";
    /// Fallback for either step
    pub const MODEL: &str = "FORMA_MODEL";
    pub const MODEL_ALIASES: &[&str] = &["VLLM_MODEL_NAME", "OPENAI_MODEL"];

    pub const TEMPERATURE: &str = "FORMA_TEMPERATURE";
}

/// Artifact directory
pub mod paths {
    pub const OUTPUT_DIR: &str = "FORMA_OUTPUT_DIR";
    pub const OUTPUT_DIR_ALIASES: &[&str] = &["OUTPUT_DIR"];
}

/// Worker process settings
pub mod sandbox {
    pub const PYTHON: &str = "FORMA_PYTHON";
    pub const GEOMETRY_MODULE: &str = "FORMA_GEOMETRY_MODULE";
    /// Extra module search paths for the worker, `:`-separated
    pub const PYTHONPATH: &str = "FORMA_PYTHONPATH";
    pub const EXEC_TIMEOUT_SECS: &str = "FORMA_EXEC_TIMEOUT_SECS";
    pub const RENDER_TIMEOUT_SECS: &str = "FORMA_RENDER_TIMEOUT_SECS";
    pub const MAX_MEMORY_MB: &str = "FORMA_MAX_MEMORY_MB";
}

/// Pipeline behaviour
pub mod pipeline {
    pub const MAX_ITERATIONS: &str = "FORMA_MAX_ITERATIONS";
}

/// HTTP surface
pub mod server {
    pub const BIND_ADDR: &str = "FORMA_BIND_ADDR";
    pub const APP_NAME: &str = "FORMA_APP_NAME";
    pub const APP_NAME_ALIASES: &[&str] = &["APP_NAME"];
    pub const PUBLIC_URL: &str = "FORMA_PUBLIC_URL";
}

/// Observability and logging
pub mod observability {
    pub const QUIET: &str = "FORMA_QUIET";
    pub const LOG_LEVEL: &str = "FORMA_LOG_LEVEL";
    pub const LOG_JSON: &str = "FORMA_LOG_JSON";
    pub const AUDIT_LOG: &str = "FORMA_AUDIT_LOG";
}
