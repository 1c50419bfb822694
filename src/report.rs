//! Per-file summary artifacts for the external reporting layer.
//!
//! One JSON document per file run, written best-effort: a failed write is
//! warned about by the caller, never fatal.

use crate::config::EngineConfig;
use crate::orchestrator::TestGenerationResult;
use crate::util::sanitize_component;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Flatten a source path into a single summary file name component.
fn flatten_path(path: &Path) -> String {
    let joined = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .map(sanitize_component)
        .collect::<Vec<_>>()
        .join("_");
    if joined.is_empty() {
        "module".to_string()
    } else {
        joined
    }
}

/// Write the summary artifact for one completed run. Requires
/// `report_root` to be configured.
pub fn write_summary(config: &EngineConfig, result: &TestGenerationResult) -> Result<PathBuf> {
    let dir = config
        .report_root
        .as_ref()
        .ok_or_else(|| anyhow!("no report root configured"))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory '{}'", dir.display()))?;

    let relative = result
        .file
        .strip_prefix(&config.source_root)
        .unwrap_or(&result.file);
    let path = dir.join(format!("{}__summary.json", flatten_path(relative)));

    let json = serde_json::to_string_pretty(result).context("Failed to serialize summary")?;
    fs::write(&path, json)
        .with_context(|| format!("Failed to write summary '{}'", path.display()))?;
    Ok(path)
}
