//! Engine configuration
//!
//! One explicit record threaded through every component; there is no
//! ambient/global settings object. Loadable from a project-local
//! `testsmith.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the source tree tests are generated for.
    pub source_root: PathBuf,
    /// Root of the permanent, mirrored test tree.
    pub test_root: PathBuf,
    /// Root of the quarantine store for failed candidates.
    pub quarantine_root: PathBuf,
    /// Where per-file summary artifacts are written. None disables them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_root: Option<PathBuf>,
    /// Interpreter used to run pytest inside the sandbox.
    #[serde(default = "default_python")]
    pub python: String,
    /// Hard deadline for one sandbox invocation.
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,
    /// Model-correction budget per symbol. Automatic repairs are free.
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    /// Consecutive same-pattern failures before a strategy switch.
    #[serde(default = "default_switch_threshold")]
    pub failure_switch_threshold: u32,
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_max_fix_attempts() -> u32 {
    2
}

fn default_switch_threshold() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::for_repo(Path::new("."))
    }
}

impl EngineConfig {
    /// Conventional layout rooted at a repository: sources under `src/`,
    /// promoted tests under `tests/generated/`, failures under
    /// `.testsmith/quarantine/`.
    pub fn for_repo(root: &Path) -> Self {
        Self {
            source_root: root.join("src"),
            test_root: root.join("tests").join("generated"),
            quarantine_root: root.join(".testsmith").join("quarantine"),
            report_root: Some(root.join(".testsmith").join("reports")),
            python: default_python(),
            sandbox_timeout_secs: default_sandbox_timeout(),
            max_fix_attempts: default_max_fix_attempts(),
            failure_switch_threshold: default_switch_threshold(),
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config '{}'", path.display()))?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create '{}'", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config '{}'", path.display()))?;
        Ok(())
    }

    pub fn sandbox_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sandbox_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let toml_str = r#"
source_root = "lib"
test_root = "tests/auto"
quarantine_root = ".morgue"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.python, "python3");
        assert_eq!(config.sandbox_timeout_secs, 30);
        assert_eq!(config.max_fix_attempts, 2);
        assert_eq!(config.failure_switch_threshold, 3);
        assert!(config.report_root.is_none());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testsmith.toml");
        let config = EngineConfig::for_repo(dir.path());
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.source_root, config.source_root);
        assert_eq!(loaded.test_root, config.test_root);
        assert_eq!(loaded.sandbox_timeout_secs, config.sandbox_timeout_secs);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testsmith.toml");
        std::fs::write(&path, "source_root = [not toml").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
