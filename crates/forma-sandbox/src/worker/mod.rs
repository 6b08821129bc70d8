//! Python worker harnesses and the data they are driven by.
//!
//! The harness scripts are embedded in the binary and written into a scratch
//! directory per run. Everything a script may touch inside the worker is
//! listed here as data: the geometry symbols, the builtins, and the modules
//! the guarded `__import__` lets through. The geometry module itself never
//! reaches a script; imports of it resolve to a namespace holding only
//! [`GEOMETRY_SYMBOLS`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::validator::{GEOMETRY_IMPORT, MODULE_IMPORTS};

pub const CAD_WORKER_SOURCE: &str = include_str!("cad_worker.py");
pub const RENDER_WORKER_SOURCE: &str = include_str!("render_worker.py");

/// build123d names bound into the script namespace. Names the installed
/// backend lacks are skipped by the harness (and reported on stderr).
pub const GEOMETRY_SYMBOLS: &[&str] = &[
    // builders
    "BuildPart", "BuildSketch", "BuildLine",
    // 3D objects
    "Box", "Cylinder", "Sphere", "Cone", "Torus", "Wedge",
    "Hole", "CounterBoreHole", "CounterSinkHole",
    // 2D objects
    "Circle", "Ellipse", "Rectangle", "RectangleRounded", "Polygon",
    "RegularPolygon", "Trapezoid", "SlotCenterToCenter", "SlotOverall", "Text",
    // 1D objects
    "Line", "Polyline", "Spline", "ThreePointArc", "CenterArc",
    "RadiusArc", "TangentArc", "JernArc", "Helix",
    // operations
    "extrude", "revolve", "loft", "sweep", "fillet", "chamfer", "mirror",
    "offset", "split", "make_face", "make_hull", "add", "scale", "section",
    "thicken", "project",
    // locations and geometry
    "Location", "Locations", "GridLocations", "PolarLocations", "HexLocations",
    "Rotation", "Rot", "Pos", "Plane", "Axis", "Vector",
    // enums
    "Mode", "Align", "Select", "Until", "Keep", "Kind", "SortBy", "GeomType",
    "Transition",
    // topology
    "Part", "Sketch", "Curve", "Compound", "Solid", "Shell", "Face", "Wire",
    "Edge", "Vertex", "BasePartObject", "BaseSketchObject",
    // units
    "MM", "CM", "M", "IN", "FT",
];

/// Builtins available to scripts. `__build_class__` lets scripts define
/// classes; `__import__` is replaced by the guarded import.
pub const SAFE_BUILTINS: &[&str] = &[
    "__build_class__",
    "abs", "all", "any", "bool", "dict", "divmod", "enumerate", "filter",
    "float", "frozenset", "int", "isinstance", "issubclass", "len", "list",
    "map", "max", "min", "pow", "print", "range", "reversed", "round", "set",
    "slice", "sorted", "str", "sum", "super", "tuple", "zip",
    "ArithmeticError", "AssertionError", "Exception", "IndexError", "KeyError",
    "RuntimeError", "TypeError", "ValueError", "ZeroDivisionError",
];

/// Export format (file extension) and the backend function producing it.
pub const EXPORTERS: &[(&str, &str)] = &[("step", "export_step"), ("stl", "export_stl")];

/// Preview angles; the first is the one reviewed by the designer.
pub const RENDER_VIEWS: &[&str] = &["iso", "top", "front", "right"];

/// Environment variables forwarded into the otherwise empty worker env.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "LD_LIBRARY_PATH", "DISPLAY"];

/// Request for `cad_worker.py`.
#[derive(Debug, Serialize)]
pub struct ExecRequest<'a> {
    pub code: &'a str,
    pub geometry_module: &'a str,
    pub symbols: &'a [&'a str],
    pub builtins: &'a [&'a str],
    pub module_imports: &'a [&'a str],
    pub geometry_import: &'a str,
    pub exporters: BTreeMap<&'a str, &'a str>,
    pub output_dir: &'a Path,
    pub base_name: &'a str,
    pub search_paths: &'a [PathBuf],
}

impl<'a> ExecRequest<'a> {
    pub fn new(
        code: &'a str,
        geometry_module: &'a str,
        output_dir: &'a Path,
        base_name: &'a str,
        search_paths: &'a [PathBuf],
    ) -> Self {
        Self {
            code,
            geometry_module,
            symbols: GEOMETRY_SYMBOLS,
            builtins: SAFE_BUILTINS,
            module_imports: MODULE_IMPORTS,
            geometry_import: GEOMETRY_IMPORT,
            exporters: EXPORTERS.iter().copied().collect(),
            output_dir,
            base_name,
            search_paths,
        }
    }
}

/// Request for `render_worker.py`.
#[derive(Debug, Serialize)]
pub struct RenderRequest<'a> {
    pub mesh_path: &'a Path,
    pub output_dir: &'a Path,
    pub base_name: &'a str,
    pub views: &'a [&'a str],
}

/// The single JSON line a harness writes to stdout.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WorkerReply {
    pub ok: bool,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// The reply is the last stdout line that parses as a [`WorkerReply`].
pub fn parse_reply(stdout: &str) -> Option<WorkerReply> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}

/// Command running `script` under `python` in isolated mode, with an empty
/// environment apart from [`PASSTHROUGH_ENV`] and `workdir` as HOME/TMPDIR.
pub fn harness_command(python: &Path, script: &Path, workdir: &Path) -> Command {
    let mut cmd = Command::new(python);
    cmd.arg("-I").arg("-B").arg(script);
    cmd.current_dir(workdir);
    cmd.env_clear();
    for key in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("HOME", workdir);
    cmd.env("TMPDIR", workdir);
    cmd.env("PYTHONDONTWRITEBYTECODE", "1");
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd
}
