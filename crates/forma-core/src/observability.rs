//! Observability: tracing init and the JSONL audit log.
//!
//! Uses [`ObservabilityConfig`] for FORMA_QUIET, FORMA_LOG_LEVEL,
//! FORMA_LOG_JSON and FORMA_AUDIT_LOG.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::ObservabilityConfig;

/// Tracing initialization mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingMode {
    /// Long-running server: honour FORMA_LOG_LEVEL.
    Server,
    /// One-shot CLI run: pipeline output goes to stdout, keep logs to warnings.
    Cli,
}

/// Initialize tracing. Call once at process startup; later calls are no-ops.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(mode: TracingMode) {
    let cfg = ObservabilityConfig::from_env();
    let level = if cfg.quiet || mode == TracingMode::Cli {
        "forma=warn".to_string()
    } else {
        cfg.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let _ = if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
}

/// SHA-256 of a script, hex encoded. Used to correlate audit records.
pub fn code_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn audit_path() -> Option<&'static str> {
    static PATH: OnceLock<Option<String>> = OnceLock::new();
    PATH.get_or_init(|| {
        let path = ObservabilityConfig::from_env().audit_log.clone()?;
        if let Some(parent) = Path::new(&path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Some(path)
    })
    .as_deref()
}

fn append_jsonl(path: &Path, record: &serde_json::Value) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(f, "{}", line);
        }
    }
}

fn audit(event: &str, mut fields: serde_json::Value) {
    let Some(path) = audit_path() else {
        return;
    };
    write_record(Path::new(path), event, &mut fields);
}

fn write_record(path: &Path, event: &str, fields: &mut serde_json::Value) {
    if let Some(obj) = fields.as_object_mut() {
        obj.insert(
            "ts".into(),
            json!(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        obj.insert("event".into(), json!(event));
    }
    append_jsonl(path, fields);
}

/// Audit: a script was refused before any process was spawned.
pub fn audit_validation_rejected(task_id: &str, code_hash: &str, violations: &[String]) {
    audit(
        "validation_rejected",
        json!({
            "task_id": task_id,
            "code_hash": code_hash,
            "violations": violations,
        }),
    );
}

/// Audit: a worker is about to run a script.
pub fn audit_execution_started(task_id: &str, code_hash: &str, base_name: &str) {
    audit(
        "execution_started",
        json!({
            "task_id": task_id,
            "code_hash": code_hash,
            "base_name": base_name,
        }),
    );
}

/// Audit: worker finished. `outcome` is "ok" or a failure category.
pub fn audit_execution_completed(task_id: &str, base_name: &str, outcome: &str, duration_ms: u64) {
    audit(
        "execution_completed",
        json!({
            "task_id": task_id,
            "base_name": base_name,
            "outcome": outcome,
            "duration_ms": duration_ms,
        }),
    );
}

/// Audit: render worker finished.
pub fn audit_render_completed(artifact: &str, outcome: &str, duration_ms: u64) {
    audit(
        "render_completed",
        json!({
            "artifact": artifact,
            "outcome": outcome,
            "duration_ms": duration_ms,
        }),
    );
}
