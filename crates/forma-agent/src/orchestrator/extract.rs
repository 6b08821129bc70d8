//! Pulling a model out of a coder transcript.
//!
//! Two sources, in order: a reference to an exported `.stl` (normally inside
//! a `generate_cad` tool output), then a fenced python block. The code-block
//! fallback is best effort: it catches models that answer with code instead
//! of calling the tool, and nothing more.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

fn stl_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w-]+\.stl\b").ok()).as_ref()
}

fn code_block_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:python|py)[ \t]*\r?\n?(.*?)```").ok())
        .as_ref()
}

/// Last `.stl` referenced in `transcript` that exists in `output_dir`, so a
/// coder that called `generate_cad` twice is judged on its final model.
///
/// Only the file name of a reference is used; directories in the transcript
/// are ignored so a reference can never point outside `output_dir`.
pub fn find_stl_reference(transcript: &str, output_dir: &Path) -> Option<PathBuf> {
    let names: Vec<&str> = stl_name_re()?
        .find_iter(transcript)
        .map(|m| m.as_str())
        .collect();
    names
        .into_iter()
        .rev()
        .map(|name| output_dir.join(name))
        .find(|p| p.is_file())
}

/// Body of the first ```` ```python ```` (or ```` ```py ````) block, trimmed.
pub fn extract_code_block(transcript: &str) -> Option<String> {
    code_block_re()?
        .captures(transcript)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|code| !code.is_empty())
}

/// The STEP file exported next to `mesh`, if there is one.
pub fn sibling_brep(mesh: &Path) -> Option<PathBuf> {
    Some(mesh.with_extension("step")).filter(|p| p.is_file())
}
