//! Static safety validation for generated CAD scripts.
//!
//! Scripts are parsed with tree-sitter and walked once. Anything that could
//! reach outside the geometry vocabulary is reported:
//!
//! 1. **Imports**: `import` only for [`MODULE_IMPORTS`]. The geometry
//!    library is reachable only as `from build123d import <name>` (or `*`)
//!    with names from [`GEOMETRY_SYMBOLS`], never as a module object.
//!    Relative and `__future__` imports are refused.
//! 2. **Capability builtins**: any reference to a name in [`DENIED_NAMES`],
//!    called or not (`f = eval; f(...)` is caught at `eval`).
//! 3. **Introspection**: attribute access to [`DENIED_ATTRIBUTES`] and to any
//!    other dunder except `__init__`; bare dunder names except `__name__`.
//! 4. **Scope escapes**: `global` / `nonlocal` (and Python 2 `exec`).
//!
//! A parse error is reported as [`ValidationError::Syntax`], never as "ok".
//! Validation is pure: a fresh parser per call, no shared state.

use std::fmt;

use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::worker::GEOMETRY_SYMBOLS;

/// Modules a script may import whole.
pub const MODULE_IMPORTS: &[&str] = &["math"];

/// Module name scripts use for the geometry vocabulary.
pub const GEOMETRY_IMPORT: &str = "build123d";

/// Builtins that open a path to code execution, the filesystem, the process
/// or the interpreter's internals.
pub const DENIED_NAMES: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "__import__",
    "open",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "exit",
    "quit",
    "help",
    "memoryview",
    "__builtins__",
    "__loader__",
    "__spec__",
];

/// Attributes that expose frames, classes or globals.
pub const DENIED_ATTRIBUTES: &[&str] = &[
    "__builtins__",
    "__globals__",
    "__class__",
    "__base__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__dict__",
    "__code__",
    "__closure__",
    "__getattribute__",
    "__loader__",
    "__spec__",
    "f_globals",
    "f_locals",
    "f_back",
    "f_builtins",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "tb_frame",
];

/// Dunder attributes scripts legitimately need (`super().__init__()`).
const ALLOWED_DUNDER_ATTRIBUTES: &[&str] = &["__init__"];

/// Dunder names that may appear bare (`def __init__`, `__name__ == ...`).
const ALLOWED_DUNDER_NAMES: &[&str] = &["__init__", "__name__"];

/// Scripts larger than this are refused outright.
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Syntax trees deeper than this are refused instead of walked.
const MAX_TREE_DEPTH: usize = 200;

/// What kind of rule a [`Violation`] broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Import,
    Call,
    Name,
    Attribute,
    Scope,
    Limit,
}

/// One offending construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// 1-based source line.
    pub line: usize,
    pub kind: ViolationKind,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.detail)
    }
}

/// Why a script was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Syntax error at line {line}: {detail}")]
    Syntax { line: usize, detail: String },

    #[error("Security violations found:\n{}", format_violations(.0))]
    Violations(Vec<Violation>),

    #[error("Python grammar could not be loaded: {0}")]
    Parser(String),
}

impl ValidationError {
    /// Human-readable lines, one per problem.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Violations(list) => list.iter().map(|v| v.to_string()).collect(),
            other => vec![other.to_string()],
        }
    }
}

fn format_violations(list: &[Violation]) -> String {
    list.iter()
        .map(|v| format!("- {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validator for generated build123d scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeValidator;

impl CodeValidator {
    pub fn new() -> Self {
        Self
    }

    /// `Ok(())` only when the script parses and nothing was found.
    pub fn validate(&self, code: &str) -> Result<(), ValidationError> {
        if code.len() > MAX_SOURCE_BYTES {
            return Err(ValidationError::Violations(vec![Violation {
                line: 1,
                kind: ViolationKind::Limit,
                detail: format!(
                    "script is {} bytes, limit is {} bytes",
                    code.len(),
                    MAX_SOURCE_BYTES
                ),
            }]));
        }

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| ValidationError::Parser(e.to_string()))?;
        let tree = parser
            .parse(code, None)
            .ok_or_else(|| ValidationError::Parser("parser returned no tree".to_string()))?;

        let root = tree.root_node();
        let src = code.as_bytes();
        if root.has_error() {
            return Err(syntax_error(root, src));
        }

        let violations = walk(root, src, 0);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Violations(violations))
        }
    }
}

/// Convenience wrapper around [`CodeValidator::validate`].
pub fn validate_code(code: &str) -> Result<(), ValidationError> {
    CodeValidator::new().validate(code)
}

fn syntax_error(root: Node, src: &[u8]) -> ValidationError {
    match first_error(root) {
        Some(node) => {
            let detail = if node.is_missing() {
                format!("expected `{}`", node.kind())
            } else {
                let text = node_text(node, src);
                let snippet: String = text.chars().take(40).collect();
                format!("unexpected `{}`", snippet.trim())
            };
            ValidationError::Syntax {
                line: line_of(node),
                detail,
            }
        }
        None => ValidationError::Syntax {
            line: 1,
            detail: "unparseable source".to_string(),
        },
    }
}

fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find_map(first_error);
    found
}

/// Pre-order walk: a node's findings come before its children's.
fn walk(node: Node, src: &[u8], depth: usize) -> Vec<Violation> {
    if depth > MAX_TREE_DEPTH {
        return vec![Violation {
            line: line_of(node),
            kind: ViolationKind::Limit,
            detail: format!("nesting deeper than {} levels", MAX_TREE_DEPTH),
        }];
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .fold(inspect(node, src), |mut acc, child| {
            acc.extend(walk(child, src, depth + 1));
            acc
        })
}

fn inspect(node: Node, src: &[u8]) -> Vec<Violation> {
    match node.kind() {
        "import_statement" => imported_names(node)
            .into_iter()
            .filter_map(|module| check_module_import(module, src))
            .collect(),
        "import_from_statement" => match node.child_by_field_name("module_name") {
            Some(module) if module.kind() == "relative_import" => vec![violation(
                node,
                ViolationKind::Import,
                "relative imports are not allowed".to_string(),
            )],
            Some(module) if node_text(module, src) == GEOMETRY_IMPORT => imported_names(node)
                .into_iter()
                .filter_map(|name| check_geometry_symbol(name, src))
                .collect(),
            Some(module) => check_module_import(module, src).into_iter().collect(),
            None => vec![violation(
                node,
                ViolationKind::Import,
                "import without a module name".to_string(),
            )],
        },
        "future_import_statement" => vec![violation(
            node,
            ViolationKind::Import,
            "import of module '__future__' is not allowed".to_string(),
        )],
        "global_statement" => vec![violation(
            node,
            ViolationKind::Scope,
            "'global' statements are not allowed".to_string(),
        )],
        "nonlocal_statement" => vec![violation(
            node,
            ViolationKind::Scope,
            "'nonlocal' statements are not allowed".to_string(),
        )],
        "exec_statement" => vec![violation(
            node,
            ViolationKind::Call,
            "'exec' statements are not allowed".to_string(),
        )],
        "attribute" => node
            .child_by_field_name("attribute")
            .and_then(|attr| {
                let name = node_text(attr, src);
                let denied = DENIED_ATTRIBUTES.contains(&name)
                    || (is_dunder(name) && !ALLOWED_DUNDER_ATTRIBUTES.contains(&name));
                denied.then(|| {
                    violation(
                        attr,
                        ViolationKind::Attribute,
                        format!("access to attribute '{}' is not allowed", name),
                    )
                })
            })
            .into_iter()
            .collect(),
        "identifier" => check_identifier(node, src).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// The `name` fields of an import, aliases unwrapped. `*` has none.
fn imported_names(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
    names
        .into_iter()
        .filter_map(|name| match name.kind() {
            "aliased_import" => name.child_by_field_name("name"),
            _ => Some(name),
        })
        .collect()
}

fn check_module_import(module: Node, src: &[u8]) -> Option<Violation> {
    let full = node_text(module, src);
    if MODULE_IMPORTS.contains(&full) {
        return None;
    }
    let top = full.split('.').next().unwrap_or(full).trim();
    let detail = if top == GEOMETRY_IMPORT {
        format!(
            "import of module '{}' is not allowed; use 'from {} import <name>'",
            full, GEOMETRY_IMPORT
        )
    } else {
        format!("import of module '{}' is not allowed", full)
    };
    Some(violation(module, ViolationKind::Import, detail))
}

fn check_geometry_symbol(name: Node, src: &[u8]) -> Option<Violation> {
    let symbol = node_text(name, src);
    (!GEOMETRY_SYMBOLS.contains(&symbol)).then(|| {
        violation(
            name,
            ViolationKind::Import,
            format!("'{}' is not part of the {} vocabulary", symbol, GEOMETRY_IMPORT),
        )
    })
}

fn check_identifier(node: Node, src: &[u8]) -> Option<Violation> {
    if let Some(parent) = node.parent() {
        // Attribute names are judged by the `attribute` rule.
        if parent.kind() == "attribute" && parent.child_by_field_name("attribute") == Some(node) {
            return None;
        }
        // `Box(..., align=...)`: keyword names never resolve to builtins.
        if parent.kind() == "keyword_argument" && parent.child_by_field_name("name") == Some(node)
        {
            return None;
        }
    }

    let name = node_text(node, src);
    if DENIED_NAMES.contains(&name) {
        let called = node
            .parent()
            .filter(|p| p.kind() == "call")
            .and_then(|p| p.child_by_field_name("function"))
            == Some(node);
        return Some(if called {
            violation(
                node,
                ViolationKind::Call,
                format!("call to '{}' is not allowed", name),
            )
        } else {
            violation(
                node,
                ViolationKind::Name,
                format!("reference to '{}' is not allowed", name),
            )
        });
    }
    if is_dunder(name) && !ALLOWED_DUNDER_NAMES.contains(&name) {
        return Some(violation(
            node,
            ViolationKind::Name,
            format!("reference to '{}' is not allowed", name),
        ));
    }
    None
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn violation(node: Node, kind: ViolationKind, detail: String) -> Violation {
    Violation {
        line: line_of(node),
        kind,
        detail,
    }
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

fn node_text<'a>(node: Node, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violations(code: &str) -> Vec<Violation> {
        match validate_code(code) {
            Err(ValidationError::Violations(v)) => v,
            other => panic!("expected violations for {:?}, got {:?}", code, other),
        }
    }

    fn kinds(code: &str) -> Vec<ViolationKind> {
        violations(code).into_iter().map(|v| v.kind).collect()
    }

    // ---- Valid scripts ----

    #[test]
    fn test_allowed_imports_pass() {
        for code in [
            "import math",
            "import math as m",
            "from build123d import *",
            "from build123d import Box, Cylinder as Cyl",
            "from build123d import (BuildPart, Locations)",
            "from math import pi, sqrt",
        ] {
            assert_eq!(validate_code(code), Ok(()), "{}", code);
        }
    }

    #[test]
    fn test_typical_build123d_script_passes() {
        let code = r#"
from build123d import *
import math

length, width, height = 100, 100, 100
with BuildPart() as part:
    Box(length, width, height, align=(Align.CENTER, Align.CENTER, Align.MIN))
    with Locations(part.faces().sort_by(Axis.Z)[-1]):
        Hole(radius=2.5)
    fillet(part.edges().filter_by(Axis.Z), radius=math.sqrt(4))

result = part.part
"#;
        assert_eq!(validate_code(code), Ok(()));
    }

    #[test]
    fn test_class_with_init_passes() {
        let code = r#"
class Bracket(BasePartObject):
    def __init__(self, size):
        super().__init__(Box(size, size, size))

if __name__ == "__main__":
    result = Bracket(10)
"#;
        assert_eq!(validate_code(code), Ok(()));
    }

    #[test]
    fn test_harmless_attribute_named_like_builtin_passes() {
        assert_eq!(validate_code("x = sketch.input\ny = Box(1, 1, 1, open=True)"), Ok(()));
    }

    // ---- Imports ----

    #[test]
    fn test_disallowed_imports_rejected() {
        for code in [
            "import os",
            "import os.path",
            "import subprocess as sp",
            "from socket import socket",
            "from importlib import import_module",
        ] {
            assert_eq!(kinds(code), vec![ViolationKind::Import], "{}", code);
        }
    }

    #[test]
    fn test_geometry_module_object_rejected() {
        for code in [
            "import build123d\nbuild123d.os.system('id')",
            "import build123d as bd",
            "import build123d.topology",
            "from build123d.topology import Solid",
        ] {
            let v = violations(code);
            assert_eq!(v[0].kind, ViolationKind::Import, "{}", code);
        }
        let v = violations("import build123d");
        assert!(v[0].detail.contains("use 'from build123d import <name>'"));
    }

    #[test]
    fn test_geometry_import_limited_to_vocabulary() {
        let v = violations("from build123d import Box, os, subprocess as sp");
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|v| v.kind == ViolationKind::Import));
        assert!(v[0].detail.contains("'os'"));
        assert!(v[1].detail.contains("'subprocess'"));
        assert_eq!(kinds("from build123d import exporters"), vec![ViolationKind::Import]);
    }

    #[test]
    fn test_mixed_import_flags_only_offender() {
        let v = violations("import math, os");
        assert_eq!(v.len(), 1);
        assert!(v[0].detail.contains("'os'"));
    }

    #[test]
    fn test_relative_and_future_imports_rejected() {
        assert_eq!(kinds("from . import secrets"), vec![ViolationKind::Import]);
        assert_eq!(
            kinds("from __future__ import annotations"),
            vec![ViolationKind::Import]
        );
    }

    // ---- Dynamic execution ----

    #[test]
    fn test_dynamic_calls_rejected() {
        for code in [
            "eval('1 + 1')",
            "exec('x = 1')",
            "compile('1', 'f', 'eval')",
            "__import__('os').system('ls')",
            "open('/etc/passwd').read()",
            "getattr(Box, 'x')",
            "breakpoint()",
        ] {
            let v = violations(code);
            assert_eq!(v[0].kind, ViolationKind::Call, "{}", code);
        }
    }

    #[test]
    fn test_aliased_builtin_rejected_at_reference() {
        let v = violations("f = eval\nf('1')");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::Name);
        assert_eq!(v[0].line, 1);
    }

    // ---- Introspection ----

    #[test]
    fn test_dunder_chain_rejected() {
        let v = violations("x = ().__class__.__bases__[0].__subclasses__()");
        assert_eq!(v.len(), 3);
        assert!(v.iter().all(|v| v.kind == ViolationKind::Attribute));
    }

    #[test]
    fn test_frame_and_globals_access_rejected() {
        assert_eq!(
            kinds("g = (lambda: 0).__globals__"),
            vec![ViolationKind::Attribute]
        );
        assert_eq!(kinds("f = gen.gi_frame.f_back"), vec![
            ViolationKind::Attribute,
            ViolationKind::Attribute
        ]);
        assert_eq!(kinds("b = __builtins__"), vec![ViolationKind::Name]);
    }

    #[test]
    fn test_unknown_dunder_attribute_rejected() {
        assert_eq!(kinds("Box.__reduce_ex__(2)"), vec![ViolationKind::Attribute]);
    }

    // ---- Scope ----

    #[test]
    fn test_global_and_nonlocal_rejected() {
        let code = "def f():\n    global result\n    def g():\n        nonlocal x\n";
        let v = violations(code);
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|v| v.kind == ViolationKind::Scope));
        assert_eq!(v[0].line, 2);
        assert_eq!(v[1].line, 4);
    }

    // ---- Failure modes ----

    #[test]
    fn test_syntax_error_is_distinct() {
        match validate_code("def broken(:\n    pass\n") {
            Err(ValidationError::Syntax { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_script_rejected() {
        let code = "x = 1\n".repeat(MAX_SOURCE_BYTES / 6 + 1);
        assert_eq!(kinds(&code), vec![ViolationKind::Limit]);
    }

    #[test]
    fn test_violations_reported_in_source_order() {
        let v = violations("import os\nx = 1\neval('2')\n");
        assert_eq!(v.iter().map(|v| v.line).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_validation_is_idempotent() {
        for code in ["import os\nexec('x')", "result = Box(1, 1, 1)", "def x(:"] {
            assert_eq!(validate_code(code), validate_code(code));
        }
    }

    #[test]
    fn test_error_display_lists_each_violation() {
        let err = validate_code("import os\neval('1')").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Security violations found:"));
        assert!(text.contains("- line 1: import of module 'os' is not allowed"));
        assert!(text.contains("- line 2: call to 'eval' is not allowed"));
        assert_eq!(err.messages().len(), 2);
    }
}
