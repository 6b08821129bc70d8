use crate::common::{run_worker, tail, ResourceLimits, Termination, WorkerOutput};
use crate::info_log;
use crate::validator::{CodeValidator, ValidationError};
use crate::worker::{
    harness_command, parse_reply, ExecRequest, RenderRequest, WorkerReply, CAD_WORKER_SOURCE,
    RENDER_VIEWS, RENDER_WORKER_SOURCE,
};
use anyhow::Context;
use forma_core::config::{PathsConfig, SandboxSettings};
use forma_core::observability;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// How much worker stderr is kept in error messages.
const STDERR_EXCERPT_BYTES: usize = 2000;

/// Resolved worker configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Python interpreter that has the geometry backend installed
    pub python: PathBuf,
    /// Module providing the geometry symbols and exporters
    pub geometry_module: String,
    /// Extra module search paths handed to the worker
    pub search_paths: Vec<PathBuf>,
    /// Absolute directory receiving exported artifacts and previews
    pub output_dir: PathBuf,
    pub exec_limits: ResourceLimits,
    pub render_limits: ResourceLimits,
}

impl SandboxConfig {
    /// Build from env-backed settings. Resolves the interpreter and creates
    /// the output directory.
    pub fn from_settings(settings: &SandboxSettings, paths: &PathsConfig) -> anyhow::Result<Self> {
        let python = match &settings.python {
            Some(p) => PathBuf::from(p),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .context("No python3 interpreter found on PATH; set FORMA_PYTHON")?,
        };
        let output_dir = paths
            .ensure_output_dir()
            .with_context(|| format!("Cannot create output dir {}", paths.output_dir.display()))?;
        Ok(Self {
            python,
            geometry_module: settings.geometry_module.clone(),
            search_paths: settings.search_paths.clone(),
            output_dir,
            exec_limits: ResourceLimits {
                timeout_secs: settings.exec_timeout_secs,
                max_memory_mb: settings.max_memory_mb,
            },
            render_limits: ResourceLimits {
                timeout_secs: settings.render_timeout_secs,
                max_memory_mb: settings.max_memory_mb,
            },
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_settings(&SandboxSettings::from_env(), &PathsConfig::from_env())
    }
}

/// Coarse failure classes, used for logs, audit records and retry prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    ValidationViolation,
    TimedOut,
    ResourceExceeded,
    NoResultProduced,
    ExecutionFault,
    WorkerError,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationViolation => "validation_violation",
            Self::TimedOut => "timed_out",
            Self::ResourceExceeded => "resource_exceeded",
            Self::NoResultProduced => "no_result_produced",
            Self::ExecutionFault => "execution_fault",
            Self::WorkerError => "worker_error",
        }
    }
}

/// Everything that can go wrong running or rendering a script.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error("Execution timed out ({0}s limit). The model might be too complex.")]
    TimedOut(u64),

    #[error("Rendering timed out ({0}s limit).")]
    RenderTimedOut(u64),

    #[error("Worker exceeded memory limit ({limit_mb} MB, observed {observed_mb} MB)")]
    MemoryExceeded { limit_mb: u64, observed_mb: u64 },

    #[error("No 'result' or 'part' variable defined.")]
    NoResult,

    #[error("{message}\n{traceback}")]
    Fault { message: String, traceback: String },

    #[error("File not found: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl SandboxError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Rejected(_) => FailureCategory::ValidationViolation,
            Self::TimedOut(_) | Self::RenderTimedOut(_) => FailureCategory::TimedOut,
            Self::MemoryExceeded { .. } => FailureCategory::ResourceExceeded,
            Self::NoResult => FailureCategory::NoResultProduced,
            Self::Fault { .. } | Self::ArtifactMissing(_) => FailureCategory::ExecutionFault,
            Self::Worker(_) => FailureCategory::WorkerError,
        }
    }
}

/// Files produced by one successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedModel {
    pub base_name: String,
    /// Triangle mesh (STL)
    pub mesh: PathBuf,
    /// Boundary representation (STEP)
    pub brep: PathBuf,
    /// The script that produced them
    pub script: PathBuf,
}

impl ExportedModel {
    /// Artifact kind → path.
    pub fn files(&self) -> BTreeMap<&'static str, &Path> {
        BTreeMap::from([
            ("stl", self.mesh.as_path()),
            ("step", self.brep.as_path()),
            ("py", self.script.as_path()),
        ])
    }
}

pub type ExecutionResult = Result<ExportedModel, SandboxError>;

/// PNG previews of a mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPreview {
    /// The isometric view, shown to the reviewer
    pub preview: PathBuf,
    pub views: Vec<PathBuf>,
}

/// Collision-free artifact base name: `{task_id}_{8 hex}`.
pub fn artifact_base_name(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe = if safe.is_empty() { "model".to_string() } else { safe };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", safe, &suffix[..8])
}

/// Runs validated scripts and renders in disposable Python workers.
///
/// Cheap to clone; every call spawns its own worker and shares nothing with
/// other calls except the output directory.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: Arc<SandboxConfig>,
    validator: CodeValidator,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config: Arc::new(config),
            validator: CodeValidator::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Validate and run `code` for `task_id`, exporting under a fresh base name.
    pub async fn execute(&self, code: &str, task_id: &str) -> ExecutionResult {
        let base_name = artifact_base_name(task_id);
        self.execute_as(code, task_id, &base_name).await
    }

    /// Validate and run `code`, exporting to `{output_dir}/{base_name}.*`.
    pub async fn execute_as(&self, code: &str, task_id: &str, base_name: &str) -> ExecutionResult {
        let code_hash = observability::code_hash(code);

        if let Err(e) = self.validator.validate(code) {
            tracing::warn!(task_id, code_hash = %code_hash, error = %e, "script rejected by validator");
            observability::audit_validation_rejected(task_id, &code_hash, &e.messages());
            return Err(e.into());
        }

        observability::audit_execution_started(task_id, &code_hash, base_name);
        info_log!(task_id, base_name, "starting CAD worker");

        let config = Arc::clone(&self.config);
        let code_owned = code.to_string();
        let base_owned = base_name.to_string();
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            run_cad_worker(&config, &code_owned, &base_owned)
        })
        .await
        .unwrap_or_else(|e| Err(SandboxError::Worker(format!("worker task panicked: {}", e))));

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.category().as_str(),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        observability::audit_execution_completed(task_id, base_name, outcome, duration_ms);
        match &result {
            Ok(model) => info_log!(
                task_id,
                mesh = %model.mesh.display(),
                duration_ms,
                "CAD worker succeeded"
            ),
            Err(e) => tracing::warn!(task_id, outcome, duration_ms, error = %e, "CAD worker failed"),
        }
        result
    }

    /// Render `mesh` to PNG previews next to it.
    pub async fn render(&self, mesh: &Path) -> Result<RenderedPreview, SandboxError> {
        if !mesh.is_file() {
            return Err(SandboxError::ArtifactMissing(mesh.to_path_buf()));
        }
        let config = Arc::clone(&self.config);
        let mesh_owned = mesh.to_path_buf();
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || run_render_worker(&config, &mesh_owned))
            .await
            .unwrap_or_else(|e| {
                Err(SandboxError::Worker(format!("render task panicked: {}", e)))
            });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.category().as_str(),
        };
        observability::audit_render_completed(
            &mesh.display().to_string(),
            outcome,
            started.elapsed().as_millis() as u64,
        );
        if let Err(e) = &result {
            tracing::warn!(mesh = %mesh.display(), error = %e, "render failed");
        }
        result
    }
}

fn run_cad_worker(config: &SandboxConfig, code: &str, base_name: &str) -> ExecutionResult {
    std::fs::create_dir_all(&config.output_dir)
        .map_err(|e| SandboxError::Worker(format!("cannot create output dir: {}", e)))?;

    let request = ExecRequest::new(
        code,
        &config.geometry_module,
        &config.output_dir,
        base_name,
        &config.search_paths,
    );
    let output = spawn_harness(config, CAD_WORKER_SOURCE, "cad_worker.py", &request, config.exec_limits)?;

    if let Some(err) = killed_error(&output, config.exec_limits, false) {
        remove_partial_outputs(&config.output_dir, base_name);
        return Err(err);
    }

    let reply = expect_reply(&output)?;
    if !reply.ok {
        remove_partial_outputs(&config.output_dir, base_name);
        return Err(reply_error(reply));
    }

    let file = |kind: &str| -> Result<PathBuf, SandboxError> {
        reply
            .files
            .get(kind)
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .ok_or_else(|| SandboxError::Worker(format!("worker reported no {} export", kind)))
    };
    let mesh = file("stl")?;
    let brep = file("step")?;

    let script = config.output_dir.join(format!("{}.py", base_name));
    std::fs::write(&script, code)
        .map_err(|e| SandboxError::Worker(format!("cannot save script: {}", e)))?;

    Ok(ExportedModel {
        base_name: base_name.to_string(),
        mesh,
        brep,
        script,
    })
}

fn run_render_worker(config: &SandboxConfig, mesh: &Path) -> Result<RenderedPreview, SandboxError> {
    let output_dir = mesh.parent().unwrap_or(&config.output_dir);
    let base_name = mesh
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "preview".to_string());
    let request = RenderRequest {
        mesh_path: mesh,
        output_dir,
        base_name: &base_name,
        views: RENDER_VIEWS,
    };
    let output = spawn_harness(
        config,
        RENDER_WORKER_SOURCE,
        "render_worker.py",
        &request,
        config.render_limits,
    )?;

    if let Some(err) = killed_error(&output, config.render_limits, true) {
        return Err(err);
    }
    let reply = expect_reply(&output)?;
    if !reply.ok {
        return Err(reply_error(reply));
    }
    let views: Vec<PathBuf> = reply.images.into_iter().map(PathBuf::from).collect();
    match views.first() {
        Some(first) => Ok(RenderedPreview {
            preview: first.clone(),
            views,
        }),
        None => Err(SandboxError::Worker("renderer produced no images".to_string())),
    }
}

/// Write the harness into a scratch dir and run it with `request` on stdin.
fn spawn_harness<R: serde::Serialize>(
    config: &SandboxConfig,
    source: &str,
    file_name: &str,
    request: &R,
    limits: ResourceLimits,
) -> Result<WorkerOutput, SandboxError> {
    let scratch = tempfile::tempdir()
        .map_err(|e| SandboxError::Worker(format!("cannot create scratch dir: {}", e)))?;
    let script = scratch.path().join(file_name);
    std::fs::write(&script, source)
        .map_err(|e| SandboxError::Worker(format!("cannot write harness: {}", e)))?;
    let payload = serde_json::to_vec(request)
        .map_err(|e| SandboxError::Worker(format!("cannot encode request: {}", e)))?;

    let cmd = harness_command(&config.python, &script, scratch.path());
    run_worker(cmd, &payload, limits).map_err(|e| SandboxError::Worker(format!("{:#}", e)))
}

fn killed_error(output: &WorkerOutput, limits: ResourceLimits, rendering: bool) -> Option<SandboxError> {
    match output.killed? {
        Termination::Timeout if rendering => Some(SandboxError::RenderTimedOut(limits.timeout_secs)),
        Termination::Timeout => Some(SandboxError::TimedOut(limits.timeout_secs)),
        Termination::MemoryLimit { peak_mb } => Some(SandboxError::MemoryExceeded {
            limit_mb: limits.max_memory_mb,
            observed_mb: peak_mb,
        }),
    }
}

fn expect_reply(output: &WorkerOutput) -> Result<WorkerReply, SandboxError> {
    parse_reply(&output.stdout).ok_or_else(|| {
        SandboxError::Worker(format!(
            "worker exited with code {} without a reply\n{}",
            output.exit_code,
            tail(&output.stderr, STDERR_EXCERPT_BYTES)
        ))
    })
}

fn reply_error(reply: WorkerReply) -> SandboxError {
    let message = reply.message.unwrap_or_else(|| "unknown worker failure".to_string());
    match reply.kind.as_deref() {
        Some("no_result") => SandboxError::NoResult,
        Some("backend") => SandboxError::Worker(message),
        _ => SandboxError::Fault {
            message,
            traceback: reply.traceback.unwrap_or_default(),
        },
    }
}

/// Files from a failed or killed run are never trusted.
fn remove_partial_outputs(output_dir: &Path, base_name: &str) {
    let Ok(entries) = std::fs::read_dir(output_dir) else {
        return;
    };
    let prefix = format!("{}.", base_name);
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for build123d: one shape class, two exporters, and a
    /// module-scope `os` like the real library has.
    const FAKE_BACKEND: &str = r#"
import os

class Box:
    def __init__(self, *dims):
        self.dims = dims

def export_stl(shape, path):
    with open(path, "w") as f:
        f.write("solid fake\nendsolid fake\n")

def export_step(shape, path):
    with open(path, "w") as f:
        f.write("ISO-10303-21;\nEND-ISO-10303-21;\n")
"#;

    struct Fixture {
        _backend: tempfile::TempDir,
        out: tempfile::TempDir,
        executor: SandboxExecutor,
    }

    fn fixture(exec_timeout_secs: u64) -> Option<Fixture> {
        let python = match which::which("python3") {
            Ok(p) => p,
            Err(_) => {
                eprintln!("python3 not found, skipping worker test");
                return None;
            }
        };
        let backend = tempfile::tempdir().unwrap();
        std::fs::write(backend.path().join("fakecad.py"), FAKE_BACKEND).unwrap();
        let out = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(SandboxConfig {
            python,
            geometry_module: "fakecad".to_string(),
            search_paths: vec![backend.path().to_path_buf()],
            output_dir: out.path().to_path_buf(),
            exec_limits: ResourceLimits {
                timeout_secs: exec_timeout_secs,
                max_memory_mb: 1024,
            },
            render_limits: ResourceLimits {
                timeout_secs: 5,
                max_memory_mb: 1024,
            },
        });
        Some(Fixture {
            _backend: backend,
            out,
            executor,
        })
    }

    fn output_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_artifact_base_name_format() {
        let a = artifact_base_name("task-1");
        let b = artifact_base_name("task-1");
        assert_ne!(a, b);
        let (prefix, suffix) = a.rsplit_once('_').unwrap();
        assert_eq!(prefix, "task-1");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(artifact_base_name("../../etc").starts_with("etc_"));
        assert!(artifact_base_name("").starts_with("model_"));
    }

    #[test]
    fn test_failure_categories() {
        assert_eq!(SandboxError::NoResult.category(), FailureCategory::NoResultProduced);
        assert_eq!(SandboxError::TimedOut(120).category(), FailureCategory::TimedOut);
        let oom = SandboxError::MemoryExceeded {
            limit_mb: 2048,
            observed_mb: 2100,
        };
        assert_eq!(oom.category(), FailureCategory::ResourceExceeded);
        assert_eq!(oom.category().as_str(), "resource_exceeded");
        assert_eq!(
            SandboxError::TimedOut(120).to_string(),
            "Execution timed out (120s limit). The model might be too complex."
        );
        assert_eq!(
            SandboxError::RenderTimedOut(30).to_string(),
            "Rendering timed out (30s limit)."
        );
    }

    #[tokio::test]
    async fn test_execute_with_result_exports_mesh_and_brep() {
        let Some(fx) = fixture(30) else { return };
        let model = fx
            .executor
            .execute("import math\nresult = Box(10, 10, math.pi)\n", "task-1")
            .await
            .unwrap();
        assert!(model.base_name.starts_with("task-1_"));
        assert!(model.mesh.is_absolute());
        assert_eq!(model.mesh.extension().unwrap(), "stl");
        assert_eq!(model.brep.extension().unwrap(), "step");
        assert!(model.mesh.is_file());
        assert!(model.brep.is_file());
        assert_eq!(
            std::fs::read_to_string(&model.script).unwrap(),
            "import math\nresult = Box(10, 10, math.pi)\n"
        );
        assert_eq!(model.files().len(), 3);
    }

    #[tokio::test]
    async fn test_execute_accepts_part_binding() {
        let Some(fx) = fixture(30) else { return };
        let model = fx.executor.execute("part = Box(1, 2, 3)", "t").await.unwrap();
        assert!(model.mesh.is_file());
    }

    #[tokio::test]
    async fn test_execute_without_result_reports_no_result() {
        let Some(fx) = fixture(30) else { return };
        let err = fx.executor.execute("shape = Box(1, 1, 1)", "t").await.unwrap_err();
        assert!(matches!(err, SandboxError::NoResult), "{:?}", err);
        assert_eq!(err.to_string(), "No 'result' or 'part' variable defined.");
        assert!(output_files(fx.out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_before_spawning() {
        let Some(fx) = fixture(30) else { return };
        let err = fx
            .executor
            .execute("import os\nresult = os.system('true')", "t")
            .await
            .unwrap_err();
        assert_eq!(err.category(), FailureCategory::ValidationViolation);
        assert!(output_files(fx.out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_execute_reports_exception_with_traceback() {
        let Some(fx) = fixture(30) else { return };
        let err = fx
            .executor
            .execute("result = Box(1 / 0)", "t")
            .await
            .unwrap_err();
        match err {
            SandboxError::Fault { message, traceback } => {
                assert!(message.starts_with("ZeroDivisionError"), "{}", message);
                assert!(traceback.contains("Traceback"));
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_import_guard_backs_up_validator() {
        let Some(fx) = fixture(30) else { return };
        // Straight to the worker, skipping static validation.
        let err = run_cad_worker(fx.executor.config(), "import os\nresult = Box(1)", "guard")
            .unwrap_err();
        match err {
            SandboxError::Fault { message, .. } => {
                assert!(message.contains("import of 'os' is not allowed"), "{}", message)
            }
            other => panic!("expected fault, got {:?}", other),
        }
        let err = run_cad_worker(fx.executor.config(), "result = open('/etc/hostname')", "guard")
            .unwrap_err();
        assert!(err.to_string().contains("NameError"), "{}", err);
    }

    #[tokio::test]
    async fn test_geometry_import_exposes_only_vocabulary() {
        let Some(fx) = fixture(30) else { return };
        let model = fx
            .executor
            .execute("from build123d import Box\nresult = Box(2)", "vocab")
            .await
            .unwrap();
        assert!(model.mesh.is_file());

        let marker = fx.out.path().join("escaped");
        let code = format!(
            "import build123d\nbuild123d.os.system('touch {}')\nresult = Box(1)",
            marker.display()
        );
        let err = fx.executor.execute(&code, "vocab").await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::ValidationViolation);
        assert!(!marker.exists());
    }

    #[test]
    fn test_worker_hides_geometry_module_internals() {
        let Some(fx) = fixture(30) else { return };
        let config = fx.executor.config();
        let marker = fx.out.path().join("escaped");

        let code = format!(
            "import build123d\nbuild123d.os.system('touch {}')\nresult = Box(1)",
            marker.display()
        );
        let err = run_cad_worker(config, &code, "guard").unwrap_err();
        assert!(
            err.to_string().contains("import of 'build123d' is not allowed"),
            "{}",
            err
        );

        let err = run_cad_worker(config, "from build123d import os\nresult = Box(1)", "guard")
            .unwrap_err();
        assert!(err.to_string().contains("cannot import name 'os'"), "{}", err);

        let err = run_cad_worker(
            config,
            "from build123d import *\nresult = Box(os.getpid())",
            "guard",
        )
        .unwrap_err();
        assert!(err.to_string().contains("NameError"), "{}", err);
        assert!(!marker.exists());

        let model = run_cad_worker(config, "from build123d import *\nresult = Box(3)", "guard")
            .unwrap();
        assert!(model.mesh.is_file());
    }

    #[tokio::test]
    async fn test_hanging_script_times_out_and_leaves_nothing() {
        let Some(fx) = fixture(1) else { return };
        let started = std::time::Instant::now();
        let err = fx
            .executor
            .execute("while True:\n    pass\n", "t")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::TimedOut(1)), "{:?}", err);
        assert!(started.elapsed() < std::time::Duration::from_secs(15));
        assert!(output_files(fx.out.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_backend_is_worker_error() {
        let Some(fx) = fixture(30) else { return };
        let mut config = fx.executor.config().clone();
        config.geometry_module = "definitely_not_a_module".to_string();
        let executor = SandboxExecutor::new(config);
        let err = executor.execute("result = 1", "t").await.unwrap_err();
        assert_eq!(err.category(), FailureCategory::WorkerError);
        assert!(err.to_string().contains("cannot load geometry backend"));
    }

    #[tokio::test]
    async fn test_render_missing_artifact() {
        let executor = SandboxExecutor::new(SandboxConfig {
            python: PathBuf::from("python3"),
            geometry_module: "build123d".to_string(),
            search_paths: Vec::new(),
            output_dir: std::env::temp_dir(),
            exec_limits: ResourceLimits {
                timeout_secs: 1,
                max_memory_mb: 64,
            },
            render_limits: ResourceLimits {
                timeout_secs: 1,
                max_memory_mb: 64,
            },
        });
        let err = executor
            .render(Path::new("/nonexistent/forma/model.stl"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ArtifactMissing(_)));
    }
}
