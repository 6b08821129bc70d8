//! Scripted collaborators for pipeline tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use forma_sandbox::{
    artifact_base_name, ExecutionResult, ExportedModel, RenderedPreview, SandboxError,
};

use crate::generation::{Generation, GenerationRequest, GenerationStep};
use crate::types::{ModelExecutor, RenderStep};

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Returns `spec` for text prompts and `review` when shown an image.
pub struct ScriptedDesigner {
    spec: String,
    review: String,
    broken: bool,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedDesigner {
    pub fn new(spec: &str, review: &str) -> Self {
        Self {
            spec: spec.to_string(),
            review: review.to_string(),
            broken: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new("", "")
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationStep for ScriptedDesigner {
    async fn invoke(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        let reviewing = request.image.is_some();
        self.requests.lock().unwrap().push(request);
        if self.broken {
            anyhow::bail!("LLM API error (503): backend unavailable");
        }
        Ok(Generation::text(if reviewing { &self.review } else { &self.spec }))
    }
}

/// Replays queued generations, then repeats the last one.
pub struct ScriptedCoder {
    queue: Mutex<VecDeque<Generation>>,
    fallback: Generation,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCoder {
    pub fn always(generation: Generation) -> Self {
        Self::sequence(vec![generation])
    }

    pub fn sequence(generations: Vec<Generation>) -> Self {
        let fallback = generations.last().cloned().unwrap_or_default();
        Self {
            queue: Mutex::new(generations.into()),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationStep for ScriptedCoder {
    async fn invoke(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        self.prompts.lock().unwrap().push(request.prompt);
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Writes placeholder STL/STEP files instead of running a worker.
pub struct MockExecutor {
    dir: PathBuf,
    failure: Option<fn() -> SandboxError>,
    calls: AtomicUsize,
}

impl MockExecutor {
    pub fn succeeding(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(dir: &Path, failure: fn() -> SandboxError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::succeeding(dir)
        }
    }

    /// Write `{base}.stl` and `{base}.step`; returns the mesh path.
    pub fn export(&self, base: &str) -> PathBuf {
        let mesh = self.dir.join(format!("{}.stl", base));
        std::fs::write(&mesh, b"solid cube\nendsolid cube\n").unwrap();
        std::fs::write(mesh.with_extension("step"), b"ISO-10303-21;\n").unwrap();
        mesh
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelExecutor for MockExecutor {
    async fn execute(&self, code: &str, task_id: &str) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        let base_name = artifact_base_name(task_id);
        let mesh = self.export(&base_name);
        let script = self.dir.join(format!("{}.py", base_name));
        std::fs::write(&script, code).unwrap();
        Ok(ExportedModel {
            base_name,
            brep: mesh.with_extension("step"),
            mesh,
            script,
        })
    }

    fn output_dir(&self) -> &Path {
        &self.dir
    }
}

/// Writes a PNG stub next to the mesh; optionally fails the first calls.
pub struct MockRenderer {
    fail_first: usize,
    calls: AtomicUsize,
}

impl MockRenderer {
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderStep for MockRenderer {
    async fn render(&self, mesh: &Path) -> Result<RenderedPreview, SandboxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(SandboxError::Worker("Rendering failed: no display".to_string()));
        }
        let stem = mesh.file_stem().and_then(|s| s.to_str()).unwrap_or("model");
        let preview = mesh.with_file_name(format!("{}_iso.png", stem));
        std::fs::write(&preview, PNG_MAGIC).unwrap();
        Ok(RenderedPreview {
            views: vec![preview.clone()],
            preview,
        })
    }
}
