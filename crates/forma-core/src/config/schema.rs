//! Config structs grouped by concern, loaded from the environment.

use super::env_keys::{llm, observability as obv_keys, paths, pipeline, sandbox, server};
use super::loader::{env_bool, env_optional, env_or, env_parse, load_dotenv};
use std::path::PathBuf;

/// Default vision-capable model served by the local vLLM endpoint.
pub const DEFAULT_MODEL: &str = "Qwen/Qwen3-VL-30B-A3B-Instruct-FP8";

/// Generation backend settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub designer_model: String,
    pub coder_model: String,
    pub temperature: Option<f64>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let fallback_model = env_or(llm::MODEL, llm::MODEL_ALIASES, || DEFAULT_MODEL.to_string());
        Self {
            api_base: env_or(llm::API_BASE, llm::API_BASE_ALIASES, || {
                "http://localhost:8000/v1".to_string()
            }),
            // vLLM accepts any bearer token; "EMPTY" is its documented placeholder.
            api_key: env_or(llm::API_KEY, llm::API_KEY_ALIASES, || "EMPTY".to_string()),
            designer_model: env_or(llm::DESIGNER_MODEL, &[], || fallback_model.clone()),
            coder_model: env_or(llm::CODER_MODEL, &[], || fallback_model.clone()),
            temperature: env_optional(llm::TEMPERATURE, &[]).and_then(|t| t.parse().ok()),
        }
    }
}

/// Where generated artifacts land.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
}

impl PathsConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            output_dir: PathBuf::from(env_or(paths::OUTPUT_DIR, paths::OUTPUT_DIR_ALIASES, || {
                "outputs".to_string()
            })),
        }
    }

    /// Create the output directory if missing and return its absolute form.
    pub fn ensure_output_dir(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::canonicalize(&self.output_dir)
    }
}

/// Worker process settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Explicit interpreter; `None` means look up `python3` on PATH.
    pub python: Option<String>,
    pub geometry_module: String,
    pub search_paths: Vec<PathBuf>,
    pub exec_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub max_memory_mb: u64,
}

impl SandboxSettings {
    pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
    /// OpenCascade kernels are memory hungry; scripts stay well under this.
    pub const DEFAULT_MAX_MEMORY_MB: u64 = 2048;

    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            python: env_optional(sandbox::PYTHON, &[]),
            geometry_module: env_or(sandbox::GEOMETRY_MODULE, &[], || "build123d".to_string()),
            search_paths: env_optional(sandbox::PYTHONPATH, &[])
                .map(|s| {
                    s.split(':')
                        .filter(|p| !p.trim().is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            exec_timeout_secs: env_parse(
                sandbox::EXEC_TIMEOUT_SECS,
                &[],
                Self::DEFAULT_EXEC_TIMEOUT_SECS,
            ),
            render_timeout_secs: env_parse(
                sandbox::RENDER_TIMEOUT_SECS,
                &[],
                Self::DEFAULT_RENDER_TIMEOUT_SECS,
            ),
            max_memory_mb: env_parse(sandbox::MAX_MEMORY_MB, &[], Self::DEFAULT_MAX_MEMORY_MB),
        }
    }
}

/// Orchestrator loop settings.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub max_iterations: usize,
}

impl PipelineSettings {
    pub const DEFAULT_MAX_ITERATIONS: usize = 3;

    pub fn from_env() -> Self {
        load_dotenv();
        let max_iterations =
            env_parse(pipeline::MAX_ITERATIONS, &[], Self::DEFAULT_MAX_ITERATIONS).max(1);
        Self { max_iterations }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub app_name: String,
    /// Base URL advertised in the agent card; derived from the request when unset.
    pub public_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        Self {
            bind_addr: env_or(server::BIND_ADDR, &[], || "0.0.0.0:8000".to_string()),
            app_name: env_or(server::APP_NAME, server::APP_NAME_ALIASES, || {
                "forma-ai-service".to_string()
            }),
            public_url: env_optional(server::PUBLIC_URL, &[])
                .map(|u| u.trim_end_matches('/').to_string()),
        }
    }
}

/// Logging and audit settings. Read once per process.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub quiet: bool,
    pub log_level: String,
    pub log_json: bool,
    pub audit_log: Option<String>,
}

impl ObservabilityConfig {
    pub fn from_env() -> &'static Self {
        use std::sync::OnceLock;
        static CACHE: OnceLock<ObservabilityConfig> = OnceLock::new();
        CACHE.get_or_init(|| {
            load_dotenv();
            Self {
                quiet: env_bool(obv_keys::QUIET, &[], false),
                log_level: env_or(obv_keys::LOG_LEVEL, &[], || "forma=info".to_string()),
                log_json: env_bool(obv_keys::LOG_JSON, &[], false),
                audit_log: env_optional(obv_keys::AUDIT_LOG, &[]),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        assert_eq!(PipelineSettings::default().max_iterations, 3);
    }

    #[test]
    fn test_ensure_output_dir_creates_and_canonicalizes() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = PathsConfig {
            output_dir: tmp.path().join("nested").join("outputs"),
        };
        let abs = cfg.ensure_output_dir().unwrap();
        assert!(abs.is_absolute());
        assert!(abs.is_dir());
    }
}
