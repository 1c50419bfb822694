//! Model-assisted correction for candidates the repair chain cannot save.
//!
//! One model round per call: prompt with the candidate and the exact
//! violation list, extract a code block from the response, re-run the
//! repair chain on it, then re-validate. Correction output is never
//! trusted without another repair pass.

use crate::prompts::{build_correction_prompt, CORRECTION_SYSTEM};
use crate::protocol::{ModelClient, ModuleContext, PolicyValidator, PromptRole, Violation};
use crate::repair::apply_all_repairs;
use crate::validate;
use std::path::Path;

/// Result of one correction round.
#[derive(Debug, Clone)]
pub enum CorrectionOutcome {
    /// Corrected candidate passed re-validation.
    Success {
        code: String,
        repairs: Vec<String>,
    },
    /// Model produced a candidate, but it still fails validation.
    FailedValidation {
        code: String,
        violations: Vec<Violation>,
    },
    /// No usable code came back; terminal for this attempt, never retried.
    Error(String),
}

/// Extract the code payload from a model response.
///
/// Prefers the first fenced block (```python or bare ```); falls back to
/// treating the whole response as code when it already looks like a Python
/// module. Returns None when the response contains no recognizable code.
pub fn extract_code_block(response: &str) -> Option<String> {
    let trimmed = response.trim();

    if let Some(open) = trimmed.find("```") {
        let after_fence = &trimmed[open + 3..];
        let body_start = match after_fence.find('\n') {
            Some(newline) => {
                let lang = after_fence[..newline].trim();
                // A language tag rides on the fence line; anything longer is
                // already code that happens to follow the backticks.
                if lang.len() <= 12 && !lang.contains(' ') {
                    newline + 1
                } else {
                    0
                }
            }
            None => return None,
        };
        let body = &after_fence[body_start..];
        let code = match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        };
        let code = code.trim_end();
        if code.trim().is_empty() {
            return None;
        }
        return Some(format!("{}\n", code));
    }

    if trimmed.contains("def ") || trimmed.starts_with("import ") || trimmed.starts_with("from ") {
        return Some(format!("{}\n", trimmed.trim_end()));
    }

    None
}

/// Run one correction round against the model.
pub async fn attempt_correction(
    model: &dyn ModelClient,
    validator: &dyn PolicyValidator,
    file: &Path,
    code: &str,
    violations: &[Violation],
    ctx: &ModuleContext,
    goal: &str,
) -> CorrectionOutcome {
    let user = build_correction_prompt(file, code, violations, goal);

    let response = match model.complete(CORRECTION_SYSTEM, &user, PromptRole::Correction).await {
        Ok(text) => text,
        Err(e) => return CorrectionOutcome::Error(format!("model call failed: {}", e)),
    };

    let Some(corrected) = extract_code_block(&response) else {
        return CorrectionOutcome::Error("no code block in correction response".to_string());
    };

    let (repaired, repairs) = apply_all_repairs(&corrected);

    match validate::validate(validator, file, &repaired, ctx) {
        Ok(remaining) if remaining.is_empty() => CorrectionOutcome::Success {
            code: repaired,
            repairs,
        },
        Ok(remaining) => CorrectionOutcome::FailedValidation {
            code: repaired,
            violations: remaining,
        },
        Err(e) => CorrectionOutcome::Error(format!("re-validation failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PolicyReport;
    use anyhow::Result;
    use std::future::Future;
    use std::path::PathBuf;
    use std::pin::Pin;

    struct FixedModel {
        response: String,
    }

    impl ModelClient for FixedModel {
        fn complete<'a>(
            &'a self,
            _system: &'a str,
            _user: &'a str,
            _role: PromptRole,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            let response = self.response.clone();
            Box::pin(async move { Ok(response) })
        }
    }

    struct CleanValidator;

    impl PolicyValidator for CleanValidator {
        fn validate(&self, _file: &Path, _code: &str) -> Result<PolicyReport> {
            Ok(PolicyReport::clean())
        }
    }

    #[test]
    fn test_extract_fenced_python_block() {
        let response = "Here you go:\n```python\ndef test_a():\n    assert True\n```\nDone.";
        let code = extract_code_block(response).unwrap();
        assert_eq!(code, "def test_a():\n    assert True\n");
    }

    #[test]
    fn test_extract_bare_fence() {
        let response = "```\nimport os\n```";
        assert_eq!(extract_code_block(response).unwrap(), "import os\n");
    }

    #[test]
    fn test_extract_unfenced_code() {
        let response = "import pytest\n\ndef test_a():\n    assert True";
        let code = extract_code_block(response).unwrap();
        assert!(code.ends_with("assert True\n"));
    }

    #[test]
    fn test_extract_prose_fails() {
        assert!(extract_code_block("I could not produce a test file for this symbol.").is_none());
        assert!(extract_code_block("```\n\n```").is_none());
    }

    #[tokio::test]
    async fn test_correction_success_path() {
        let model = FixedModel {
            response: "```python\ndef test_b():\n    assert 2 > 1\n```".to_string(),
        };
        let outcome = attempt_correction(
            &model,
            &CleanValidator,
            &PathBuf::from("pkg/m.py"),
            "def test_b():\n    pass\n",
            &[Violation::error("structural", "missing assertion")],
            &ModuleContext::default(),
            "tests for b",
        )
        .await;
        match outcome {
            CorrectionOutcome::Success { code, .. } => assert!(code.contains("assert 2 > 1")),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_correction_without_code_is_error() {
        let model = FixedModel {
            response: "Sorry, I cannot help with that.".to_string(),
        };
        let outcome = attempt_correction(
            &model,
            &CleanValidator,
            &PathBuf::from("pkg/m.py"),
            "def test_b():\n    pass\n",
            &[],
            &ModuleContext::default(),
            "tests for b",
        )
        .await;
        assert!(matches!(outcome, CorrectionOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_corrected_output_goes_through_repair() {
        // Corrected code with a truncated docstring still converges because
        // the repair chain runs again on model output.
        let model = FixedModel {
            response: "```python\ndef test_c():\n    \"\"\"doc\n    assert True\n```".to_string(),
        };
        let outcome = attempt_correction(
            &model,
            &CleanValidator,
            &PathBuf::from("pkg/m.py"),
            "def test_c():\n    pass\n",
            &[],
            &ModuleContext::default(),
            "tests for c",
        )
        .await;
        match outcome {
            CorrectionOutcome::Success { code, repairs } => {
                assert!(!repairs.is_empty());
                assert_eq!(code.matches("\"\"\"").count() % 2, 0);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }
}
