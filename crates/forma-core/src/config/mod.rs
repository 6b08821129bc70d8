//! Unified configuration layer.
//!
//! All environment reads live here; business code works with the structs.
//!
//! - `loader`: `env_or`, `env_optional`, `env_bool`, `env_parse`, `.env` loading
//! - `schema`: `LlmConfig`, `PathsConfig`, `SandboxSettings`, `PipelineSettings`,
//!   `ServerConfig`, `ObservabilityConfig`
//! - `env_keys`: key constants and aliases

pub mod env_keys;
pub mod loader;
pub mod schema;

pub use loader::{env_bool, env_optional, env_or, env_parse, load_dotenv};
pub use schema::{
    LlmConfig, ObservabilityConfig, PathsConfig, PipelineSettings, SandboxSettings, ServerConfig,
};
