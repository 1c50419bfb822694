//! Sandboxed execution of candidate test files.
//!
//! Every invocation owns a fresh ephemeral root under the system temp dir;
//! an RAII guard removes it on every exit path, including timeout and panic
//! unwinding. Generated code never touches the real repository.

use crate::config::EngineConfig;
use crate::util::{run_with_deadline, sanitize_component, tail_chars};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

const SANDBOX_ROOT_DIR: &str = "testsmith-sandbox";
const OUTPUT_TAIL_MAX_CHARS: usize = 2_000;

/// Outcome of one sandbox invocation. Immutable once built.
///
/// `passed` is true iff every discovered test passed. On timeout, crash, or
/// launch failure all test lists are empty and `error` is set; a timeout is
/// never reinterpreted as a partial pass.
#[derive(Debug, Clone, Default)]
pub struct SandboxResult {
    pub passed: bool,
    pub passed_tests: Vec<String>,
    pub failed_tests: Vec<String>,
    pub total_tests: usize,
    pub error: Option<String>,
}

impl SandboxResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            passed_tests: Vec::new(),
            failed_tests: Vec::new(),
            total_tests: 0,
            error: Some(error.into()),
        }
    }
}

/// In-flight, not-yet-committed source state. When supplied, these files are
/// materialized into the ephemeral root before the candidate so imports
/// resolve against the prospective state rather than the last-committed one.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    files: BTreeMap<PathBuf, String>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    fn materialize(&self, root: &Path) -> Result<()> {
        for (path, content) in &self.files {
            if path.is_absolute() {
                return Err(anyhow!(
                    "Overlay paths must be relative: {}",
                    path.display()
                ));
            }
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(anyhow!(
                    "Parent traversal is not allowed in overlay: {}",
                    path.display()
                ));
            }
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create overlay directory '{}'", parent.display())
                })?;
            }
            fs::write(&target, content).with_context(|| {
                format!("Failed to write overlay file '{}'", target.display())
            })?;
        }
        Ok(())
    }
}

/// Uniquely named temp directory, removed on drop regardless of how the
/// invocation exits.
struct EphemeralRoot {
    path: PathBuf,
}

impl EphemeralRoot {
    fn create() -> Result<Self> {
        let path = std::env::temp_dir()
            .join(SANDBOX_ROOT_DIR)
            .join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&path).with_context(|| {
            format!("Failed to create sandbox root '{}'", path.display())
        })?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EphemeralRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Seam between the orchestrator and the real pytest sandbox, so the state
/// machine can be driven with a scripted executor.
pub trait TestExecutor: Send + Sync {
    fn run(&self, code: &str, symbol: &str, overlay: Option<&Overlay>) -> SandboxResult;
}

/// Real sandbox: pytest in a child process with a hard deadline.
#[derive(Debug, Clone)]
pub struct Sandbox {
    python: String,
    source_root: PathBuf,
    timeout: Duration,
}

impl Sandbox {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            python: config.python.clone(),
            source_root: config.source_root.clone(),
            timeout: config.sandbox_timeout(),
        }
    }

    /// Module search path: ephemeral root, then the real source root, then
    /// whatever the ambient environment already had - in that priority order.
    fn module_search_path(&self, root: &Path) -> std::ffi::OsString {
        let source_root = fs::canonicalize(&self.source_root)
            .unwrap_or_else(|_| self.source_root.clone());
        let mut parts = vec![root.to_path_buf(), source_root];
        if let Some(ambient) = std::env::var_os("PYTHONPATH") {
            parts.extend(std::env::split_paths(&ambient));
        }
        std::env::join_paths(parts).unwrap_or_default()
    }
}

impl TestExecutor for Sandbox {
    fn run(&self, code: &str, symbol: &str, overlay: Option<&Overlay>) -> SandboxResult {
        let root = match EphemeralRoot::create() {
            Ok(root) => root,
            Err(e) => return SandboxResult::failed(format!("sandbox setup failed: {}", e)),
        };

        if let Some(overlay) = overlay {
            if let Err(e) = overlay.materialize(root.path()) {
                return SandboxResult::failed(format!("overlay failed: {}", e));
            }
        }

        let test_file = format!("test_{}.py", sanitize_component(symbol));
        if let Err(e) = fs::write(root.path().join(&test_file), code) {
            return SandboxResult::failed(format!("failed to write candidate: {}", e));
        }

        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "pytest", "-v", "-p", "no:cacheprovider"])
            .arg(&test_file)
            .current_dir(root.path())
            .env("PYTHONPATH", self.module_search_path(root.path()))
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let output = match run_with_deadline(&mut cmd, self.timeout) {
            Ok(output) => output,
            Err(e) => return SandboxResult::failed(format!("failed to launch test run: {}", e)),
        };

        if output.timed_out {
            return SandboxResult::failed(format!(
                "test run timed out after {}s",
                self.timeout.as_secs()
            ));
        }

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let (passed_tests, failed_tests) = parse_test_lines(&combined);
        let total_tests = passed_tests.len() + failed_tests.len();

        if total_tests == 0 {
            let exit_ok = output.status.map(|s| s.success()).unwrap_or(false);
            return SandboxResult::failed(if exit_ok {
                "no tests discovered".to_string()
            } else {
                format!(
                    "test run produced no parseable results:\n{}",
                    tail_chars(&combined, OUTPUT_TAIL_MAX_CHARS)
                )
            });
        }

        SandboxResult {
            passed: failed_tests.is_empty(),
            passed_tests,
            failed_tests,
            total_tests,
            error: None,
        }
    }
}

fn verdict_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^(?:[\w./\\-]+\.py::)?(?:\w+::)*(test_\w+(?:\[[^\]]*\])?)\s+(PASSED|FAILED|ERROR)\b",
        )
        .unwrap()
    })
}

/// Recover per-test verdicts from pytest's verbose output. ERROR counts as
/// a failure.
pub fn parse_test_lines(output: &str) -> (Vec<String>, Vec<String>) {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    for caps in verdict_regex().captures_iter(output) {
        let name = caps[1].to_string();
        match &caps[2] {
            "PASSED" => {
                if !passed.contains(&name) {
                    passed.push(name);
                }
            }
            _ => {
                if !failed.contains(&name) {
                    failed.push(name);
                }
            }
        }
    }
    (passed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbose_output() {
        let output = "\
test_calc.py::test_add PASSED                                            [ 33%]
test_calc.py::test_sub FAILED                                            [ 66%]
test_calc.py::TestDiv::test_div_by_zero PASSED                           [100%]
";
        let (passed, failed) = parse_test_lines(output);
        assert_eq!(passed, vec!["test_add", "test_div_by_zero"]);
        assert_eq!(failed, vec!["test_sub"]);
    }

    #[test]
    fn test_parse_ignores_summary_lines() {
        let output = "\
test_calc.py::test_add PASSED
FAILED test_calc.py::test_sub - AssertionError: 1 != 2
=========================== short test summary info ============================
";
        let (passed, failed) = parse_test_lines(output);
        assert_eq!(passed, vec!["test_add"]);
        assert!(failed.is_empty());
    }

    #[test]
    fn test_parse_collection_error_counts_as_failure() {
        let output = "test_calc.py::test_bad ERROR\n";
        let (passed, failed) = parse_test_lines(output);
        assert!(passed.is_empty());
        assert_eq!(failed, vec!["test_bad"]);
    }

    #[test]
    fn test_parse_parametrized_cases_are_distinct() {
        let output = "\
test_calc.py::test_add[1-2] PASSED
test_calc.py::test_add[3-4] FAILED
";
        let (passed, failed) = parse_test_lines(output);
        assert_eq!(passed, vec!["test_add[1-2]"]);
        assert_eq!(failed, vec!["test_add[3-4]"]);
    }

    #[test]
    fn test_ephemeral_root_removed_on_drop() {
        let path = {
            let root = EphemeralRoot::create().unwrap();
            fs::write(root.path().join("scratch.txt"), "tmp").unwrap();
            root.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_overlay_materializes_nested_files() {
        let root = EphemeralRoot::create().unwrap();
        let mut overlay = Overlay::new();
        overlay.add("pkg/__init__.py", "");
        overlay.add("pkg/mod.py", "VALUE = 42\n");
        overlay.materialize(root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("pkg/mod.py")).unwrap(),
            "VALUE = 42\n"
        );
    }

    #[test]
    fn test_overlay_rejects_escaping_paths() {
        let root = EphemeralRoot::create().unwrap();

        let mut absolute = Overlay::new();
        absolute.add("/etc/passwd", "nope");
        assert!(absolute.materialize(root.path()).is_err());

        let mut traversal = Overlay::new();
        traversal.add("../outside.py", "nope");
        assert!(traversal.materialize(root.path()).is_err());
    }

    #[test]
    fn test_module_search_path_prefers_sandbox_root() {
        let config = EngineConfig::for_repo(Path::new("/repo"));
        let sandbox = Sandbox::new(&config);
        let joined = sandbox.module_search_path(Path::new("/tmp/sb"));
        let parts: Vec<PathBuf> = std::env::split_paths(&joined).collect();
        assert_eq!(parts[0], PathBuf::from("/tmp/sb"));
        assert_eq!(parts[1], PathBuf::from("/repo/src"));
    }

    #[test]
    fn test_launch_failure_is_a_result_not_a_panic() {
        let config = EngineConfig {
            python: "testsmith-no-such-interpreter".to_string(),
            ..EngineConfig::for_repo(Path::new("."))
        };
        let sandbox = Sandbox::new(&config);
        let result = sandbox.run("def test_a():\n    assert True\n", "a", None);
        assert!(!result.passed);
        assert_eq!(result.total_tests, 0);
        assert!(result.error.is_some());
    }
}
