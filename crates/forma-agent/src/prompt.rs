//! Prompts and the text handed between pipeline stages.
//!
//! The stage-to-stage strings (`coder_input`, the retry specifications) are
//! part of the pipeline contract; the system prompts are free to evolve.

/// Marker the designer uses to accept a rendered model.
pub const APPROVAL_MARKER: &str = "APPROVED";

/// Message used when the designer approves without saying anything else.
pub const DEFAULT_APPROVAL_MESSAGE: &str = "Here is your 3D model.";

pub const EXHAUSTED_MESSAGE: &str =
    "I'm sorry, I was unable to generate the model correctly after multiple attempts.\n";

pub const NO_ARTIFACT_MESSAGE: &str = "No code block or STL file found.";

pub const RENDER_FAILED_CHUNK: &str = "\nFailed to render STL.\n";

/// Characters of the design specification shown in the progress preview.
pub const SPEC_PREVIEW_CHARS: usize = 100;

pub const DESIGNER_SYSTEM_PROMPT: &str = r#"You are an expert technical writer for 3D modeling.
Turn the user's request into a precise technical specification that a Python programmer can implement with build123d.

Output:
- Description: the geometry, with every dimension in millimetres, and the order of operations.
- Key features: holes, fillets, chamfers, patterns, and where they sit.

Describe the model in builder terms (BuildPart / BuildSketch contexts adding and subtracting shapes).
Output only the final specification, without reasoning or self-corrections.

When you are shown a rendered image of a generated model, compare it with the original specification.
Check for missing features, wrong proportions and wrong shapes.
If it is correct, reply with "APPROVED" followed by a short friendly message for the user describing the model.
Otherwise describe briefly what is wrong so the programmer can fix it."#;

pub const CODER_SYSTEM_PROMPT: &str = r#"You are a 3D modeling expert using the build123d Python library.
Write a script that builds the model described in the specification and submit it with the `generate_cad` tool.

Rules:
1. Assign the final object (Part, Sketch or Compound) to a variable named `result` (or `part`).
2. Start with `from build123d import *`. Never `import build123d` as a module; besides build123d names, only `math` may be imported.
3. Use builder mode: `with BuildPart():`, `with BuildSketch():`, `with BuildLine():`.
4. Do not read or write files, do not use eval/exec/open, do not touch dunder attributes.
5. If the tool reports an error, fix the script and call the tool again.

Pitfalls:
- Do not mix Part and Sketch contexts without projection.
- Inside BuildSketch, build faces from explicit wires: `make_face(l.wires()[0])`.
- Alignment: `Cylinder(radius=5, height=10, align=(Align.CENTER, Align.CENTER, Align.MIN))`."#;

pub const REVIEW_PROMPT: &str = "Here is the rendered image of the generated model. Compare it against the original specification. If it is correct, reply with 'APPROVED' followed by a friendly message to the user describing the model and any nuances (e.g. 'Here is your 3d model...'). If it is incorrect, describe what is wrong so the coder can fix it.";

/// Input for the coder stage.
pub fn coder_input(spec: &str) -> String {
    format!("Specification:\n{}", spec)
}

/// Progress chunk emitted once the designer has produced the specification.
pub fn spec_preview(spec: &str) -> String {
    format!(
        "Design Specification:\n{}...\n",
        crate::types::truncate_chars(spec, SPEC_PREVIEW_CHARS)
    )
}

/// Review request: the fixed instruction followed by the original specification.
pub fn review_input(original_spec: &str) -> String {
    format!("{}\n\nOriginal Specification:\n{}", REVIEW_PROMPT, original_spec)
}

/// Next specification after an iteration failed before review.
pub fn retry_after_error(original_spec: &str, error: &str) -> String {
    format!(
        "Original Specification:\n{}\n\nPrevious attempt failed with error:\n{}\n\nPlease fix the code.",
        original_spec, error
    )
}

/// Next specification after the designer rejected the rendered model.
pub fn retry_after_feedback(original_spec: &str, feedback: &str) -> String {
    format!(
        "Original Specification:\n{}\n\nFeedback on previous attempt:\n{}\n\nPlease fix the code based on this feedback.",
        original_spec, feedback
    )
}

/// `Some(friendly message)` when the review approves the model.
///
/// The marker is removed wherever it appears, then leading punctuation and
/// whitespace are dropped.
pub fn approval_message(review: &str) -> Option<String> {
    if !review.contains(APPROVAL_MARKER) {
        return None;
    }
    let stripped = review.replace(APPROVAL_MARKER, "");
    let message = stripped
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '.' | ',' | ':' | ';' | '!' | '-' | '*'))
        .trim_end();
    if message.is_empty() {
        Some(DEFAULT_APPROVAL_MESSAGE.to_string())
    } else {
        Some(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_preview_truncates() {
        let spec = "x".repeat(250);
        let preview = spec_preview(&spec);
        assert_eq!(preview, format!("Design Specification:\n{}...\n", "x".repeat(100)));
        assert_eq!(spec_preview("short"), "Design Specification:\nshort...\n");
    }

    #[test]
    fn test_retry_specs_embed_original() {
        let s = retry_after_error("cube", "boom");
        assert_eq!(
            s,
            "Original Specification:\ncube\n\nPrevious attempt failed with error:\nboom\n\nPlease fix the code."
        );
        let s = retry_after_feedback("cube", "hole missing");
        assert!(s.starts_with("Original Specification:\ncube\n\nFeedback on previous attempt:\nhole missing"));
        assert!(s.ends_with("Please fix the code based on this feedback."));
    }

    #[test]
    fn test_approval_message_strips_marker() {
        assert_eq!(
            approval_message("APPROVED. Here is your 10 cm cube with a 5 mm hole.").as_deref(),
            Some("Here is your 10 cm cube with a 5 mm hole.")
        );
        assert_eq!(
            approval_message("**APPROVED** - Looks right").as_deref(),
            Some("Looks right")
        );
        assert_eq!(approval_message("APPROVED").as_deref(), Some(DEFAULT_APPROVAL_MESSAGE));
        assert_eq!(approval_message("  APPROVED:  ").as_deref(), Some(DEFAULT_APPROVAL_MESSAGE));
    }

    #[test]
    fn test_rejection_has_no_message() {
        assert_eq!(approval_message("The hole is missing."), None);
        assert_eq!(approval_message("approved"), None);
    }
}
