//! Validation gate for repaired candidates.
//!
//! Two tiers, short-circuiting: a cheap structural heuristic that needs no
//! collaborator, then delegation to the external policy rule engine. The
//! gate classifies; it never mutates code.

use crate::protocol::{ModuleContext, PolicyStatus, PolicyValidator, Violation};
use anyhow::Result;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

const STRUCTURAL_RULE: &str = "structural";

fn test_def_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:async\s+)?def\s+test_\w+\s*\(").unwrap())
}

fn assertion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:^\s*assert\b|pytest\.raises|pytest\.approx|\.assert\w+\()").unwrap()
    })
}

/// True when the candidate defines at least one `test_`-named function.
pub fn has_test_function(code: &str) -> bool {
    test_def_regex().is_match(code)
}

/// True when the candidate contains an assertion-like construct.
pub fn has_assertion(code: &str) -> bool {
    assertion_regex().is_match(code)
}

/// Check a candidate. Empty result means valid. Structural rejections are a
/// single synthetic violation and never reach the policy collaborator.
pub fn validate(
    validator: &dyn PolicyValidator,
    file: &Path,
    code: &str,
    _ctx: &ModuleContext,
) -> Result<Vec<Violation>> {
    if !has_test_function(code) {
        return Ok(vec![Violation::error(
            STRUCTURAL_RULE,
            "candidate defines no test function",
        )]);
    }
    if !has_assertion(code) {
        return Ok(vec![Violation::error(
            STRUCTURAL_RULE,
            "candidate contains no assertion",
        )]);
    }

    let report = validator.validate(file, code)?;
    match report.status {
        PolicyStatus::Clean => Ok(Vec::new()),
        PolicyStatus::Dirty => Ok(report.violations),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PolicyReport;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingValidator {
        calls: AtomicUsize,
        report: fn() -> PolicyReport,
    }

    impl PolicyValidator for CountingValidator {
        fn validate(&self, _file: &Path, _code: &str) -> Result<PolicyReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.report)())
        }
    }

    fn file() -> PathBuf {
        PathBuf::from("pkg/mod.py")
    }

    #[test]
    fn test_missing_test_function_short_circuits() {
        let validator = CountingValidator {
            calls: AtomicUsize::new(0),
            report: PolicyReport::clean,
        };
        let violations = validate(
            &validator,
            &file(),
            "def helper():\n    assert True\n",
            &ModuleContext::default(),
        )
        .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "structural");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_assertion_short_circuits() {
        let validator = CountingValidator {
            calls: AtomicUsize::new(0),
            report: PolicyReport::clean,
        };
        let violations = validate(
            &validator,
            &file(),
            "def test_noop():\n    value = 1\n",
            &ModuleContext::default(),
        )
        .unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("assertion"));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clean_policy_passes() {
        let validator = CountingValidator {
            calls: AtomicUsize::new(0),
            report: PolicyReport::clean,
        };
        let violations = validate(
            &validator,
            &file(),
            "def test_add():\n    assert 1 + 1 == 2\n",
            &ModuleContext::default(),
        )
        .unwrap();
        assert!(violations.is_empty());
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dirty_policy_returns_violations() {
        fn dirty() -> PolicyReport {
            PolicyReport::dirty(vec![Violation::error("no-print", "print() in test")])
        }
        let validator = CountingValidator {
            calls: AtomicUsize::new(0),
            report: dirty,
        };
        let violations = validate(
            &validator,
            &file(),
            "def test_add():\n    print('x')\n    assert True\n",
            &ModuleContext::default(),
        )
        .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "no-print");
    }

    #[test]
    fn test_pytest_raises_counts_as_assertion() {
        assert!(has_assertion(
            "def test_err():\n    with pytest.raises(ValueError):\n        f()\n"
        ));
        assert!(has_assertion(
            "class TestX:\n    def test_a(self):\n        self.assertEqual(1, 1)\n"
        ));
    }
}
