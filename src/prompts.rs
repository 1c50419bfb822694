//! System prompts and user-prompt builders for generation and correction.

use crate::protocol::{ModuleContext, Strategy, Violation};
use std::fmt::Write as _;
use std::path::Path;

pub const TEST_GENERATION_SYSTEM: &str = r#"You are a senior Python engineer writing pytest tests for one symbol in a module.

OUTPUT FORMAT:
- Output ONLY a single fenced code block containing a complete, self-contained test file
- No explanations before or after the block

RULES FOR THE TEST FILE:
- Import the module under test by its real import path; do not redefine it
- Every test function name starts with test_
- Every test function contains at least one assertion
- Cover the normal path plus edge cases: empty inputs, error paths, boundary values
- Use pytest.raises for expected exceptions
- No network access, no writes outside the current working directory
- Keep the file runnable as-is: no placeholders, no TODO markers"#;

pub const CORRECTION_SYSTEM: &str = r#"You are a senior Python engineer fixing a generated test file that failed review.

OUTPUT FORMAT:
- Output ONLY a single fenced code block containing the full corrected test file
- No explanations, no partial diffs - the complete file

RULES:
- Fix every violation listed; do not introduce new constructs the violations forbid
- Preserve passing structure and intent; change only what the violations require
- Every test function name starts with test_ and contains an assertion
- Keep the file runnable as-is"#;

/// Build the user prompt for first-pass generation of one symbol.
pub fn build_generation_prompt(
    file: &Path,
    symbol: &str,
    ctx: &ModuleContext,
    strategy: &Strategy,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Module: {}", file.display());
    let _ = writeln!(prompt, "Target symbol: {}", symbol);
    let _ = writeln!(prompt, "Approach: {} - {}", strategy.name, strategy.guidance);

    if let Some(doc) = &ctx.docstring {
        let _ = writeln!(prompt, "\nModule docstring:\n{}", doc);
    }
    if !ctx.dependencies.is_empty() {
        let _ = writeln!(prompt, "\nModule imports: {}", ctx.dependencies.join(", "));
    }
    if !ctx.coverage_gaps.is_empty() {
        let _ = writeln!(prompt, "Uncovered areas: {}", ctx.coverage_gaps.join(", "));
    }

    let _ = write!(
        prompt,
        "\nModule source:\n```python\n{}\n```\n\nWrite a pytest file exercising `{}`.",
        ctx.source, symbol
    );
    prompt
}

/// Build the user prompt for a correction round: the candidate plus the
/// exact violation list.
pub fn build_correction_prompt(
    file: &Path,
    code: &str,
    violations: &[Violation],
    goal: &str,
) -> String {
    let mut listed = String::new();
    for (i, v) in violations.iter().enumerate() {
        let _ = writeln!(listed, "{}. [{}] {}", i + 1, v.rule, v.message);
    }

    format!(
        "Test file for: {}\nGoal: {}\n\nViolations to fix:\n{}\nCurrent test file:\n```python\n{}\n```\n\nOutput the corrected file.",
        file.display(),
        goal,
        listed,
        code
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_generation_prompt_includes_strategy_and_source() {
        let ctx = ModuleContext {
            source: "def add(a, b):\n    return a + b\n".to_string(),
            docstring: Some("Math helpers.".to_string()),
            ..Default::default()
        };
        let strategy = Strategy::new("focused", "one behavior per test");
        let prompt =
            build_generation_prompt(&PathBuf::from("pkg/math.py"), "add", &ctx, &strategy);
        assert!(prompt.contains("pkg/math.py"));
        assert!(prompt.contains("focused"));
        assert!(prompt.contains("def add"));
        assert!(prompt.contains("Math helpers."));
    }

    #[test]
    fn test_correction_prompt_numbers_violations() {
        let violations = vec![
            Violation::error("no-print", "print() in test"),
            Violation::error("structural", "missing assertion"),
        ];
        let prompt = build_correction_prompt(
            &PathBuf::from("pkg/math.py"),
            "def test_x():\n    print('x')\n",
            &violations,
            "tests for add",
        );
        assert!(prompt.contains("1. [no-print]"));
        assert!(prompt.contains("2. [structural]"));
        assert!(prompt.contains("Current test file"));
    }
}
