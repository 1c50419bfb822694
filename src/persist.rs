//! Promotion and quarantine of validated candidates.
//!
//! Full successes land in the permanent, mirrored test tree. Failures land
//! in the quarantine store for offline analysis. Partial successes do both:
//! the passing subset is promoted, the full original is archived. IO errors
//! surface in the result and never abort the surrounding run.

use crate::classify::Disposition;
use crate::config::EngineConfig;
use crate::util::sanitize_component;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

/// Status tag written into quarantine headers.
const TAG_SANDBOX_FAILED: &str = "sandbox_failed";
const TAG_PARTIAL_FAILURE: &str = "partial_failure";

/// Outcome of a single persistence decision.
#[derive(Debug, Clone, Default)]
pub struct PersistResult {
    pub ok: bool,
    pub path: Option<PathBuf>,
    /// Individually promoted test functions, not whole files.
    pub tests_saved: usize,
    pub error: Option<String>,
}

/// Deterministic mapping from a source location to its test location:
/// strip the source-root prefix, keep the remaining directory structure
/// under the test root, name the file `test_<stem>__<sanitized_symbol>.py`.
/// Re-promotion of the same (path, symbol) overwrites.
pub fn mirrored_path(config: &EngineConfig, source_file: &Path, symbol: &str) -> PathBuf {
    let relative = source_file
        .strip_prefix(&config.source_root)
        .unwrap_or_else(|_| {
            source_file
                .file_name()
                .map(Path::new)
                .unwrap_or(source_file)
        });
    let stem = relative
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    let file_name = format!("test_{}__{}.py", stem, sanitize_component(symbol));
    match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            config.test_root.join(parent).join(file_name)
        }
        _ => config.test_root.join(file_name),
    }
}

/// Timestamp-qualified location in the failure store. Unique per invocation
/// so repeated failures accumulate into an append-only forensic log.
pub fn quarantine_path(
    config: &EngineConfig,
    timestamp: DateTime<Local>,
    source_file: &Path,
    symbol: &str,
) -> PathBuf {
    let stem = source_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    config.quarantine_root.join(format!(
        "{}__{}__{}.py",
        timestamp.format("%Y%m%d_%H%M%S%.3f"),
        sanitize_component(stem),
        sanitize_component(symbol)
    ))
}

fn provenance_header(
    source_file: &Path,
    symbol: &str,
    timestamp: DateTime<Local>,
    status: &str,
    promoted: Option<&[String]>,
) -> String {
    let mut header = format!(
        "# Generated by testsmith\n# Source: {}\n# Symbol: {}\n# Generated: {}\n# Status: {}\n",
        source_file.display(),
        symbol,
        timestamp.to_rfc3339(),
        status
    );
    if let Some(names) = promoted {
        header.push_str(&format!("# Promoted tests: {}\n", names.join(", ")));
    }
    header.push('\n');
    header
}

/// Apply the promotion policy for one classified candidate.
pub fn persist(
    config: &EngineConfig,
    source_file: &Path,
    symbol: &str,
    code: &str,
    disposition: Disposition,
    passed_tests: &[String],
) -> PersistResult {
    let now = Local::now();
    match disposition {
        Disposition::FullSuccess => {
            let path = mirrored_path(config, source_file, symbol);
            let header = provenance_header(source_file, symbol, now, "passed", None);
            match write_file(&path, &format!("{}{}", header, code)) {
                Ok(()) => PersistResult {
                    ok: true,
                    path: Some(path),
                    tests_saved: passed_tests.len(),
                    error: None,
                },
                Err(e) => PersistResult {
                    ok: false,
                    path: None,
                    tests_saved: 0,
                    error: Some(e.to_string()),
                },
            }
        }
        Disposition::PartialSuccess => match extract_test_functions(code, passed_tests) {
            Some(reduced) => promote_partial(config, source_file, symbol, code, &reduced, passed_tests, now),
            // Passing subset could not be isolated: full-failure handling.
            None => quarantine(config, source_file, symbol, code, TAG_SANDBOX_FAILED, now),
        },
        Disposition::FullFailure => {
            quarantine(config, source_file, symbol, code, TAG_SANDBOX_FAILED, now)
        }
    }
}

fn promote_partial(
    config: &EngineConfig,
    source_file: &Path,
    symbol: &str,
    full_code: &str,
    reduced: &str,
    passed_tests: &[String],
    now: DateTime<Local>,
) -> PersistResult {
    let path = mirrored_path(config, source_file, symbol);
    let header = provenance_header(source_file, symbol, now, "partial", Some(passed_tests));
    if let Err(e) = write_file(&path, &format!("{}{}", header, reduced)) {
        return PersistResult {
            ok: false,
            path: None,
            tests_saved: 0,
            error: Some(e.to_string()),
        };
    }

    // Archive the full original, failing tests included, for later analysis.
    let archive = quarantine(config, source_file, symbol, full_code, TAG_PARTIAL_FAILURE, now);
    PersistResult {
        ok: archive.ok,
        path: Some(path),
        tests_saved: passed_tests.len(),
        error: archive.error,
    }
}

fn quarantine(
    config: &EngineConfig,
    source_file: &Path,
    symbol: &str,
    code: &str,
    tag: &str,
    now: DateTime<Local>,
) -> PersistResult {
    let path = quarantine_path(config, now, source_file, symbol);
    let header = provenance_header(source_file, symbol, now, tag, None);
    match write_file(&path, &format!("{}{}", header, code)) {
        Ok(()) => PersistResult {
            ok: true,
            path: Some(path),
            tests_saved: 0,
            error: None,
        },
        Err(e) => PersistResult {
            ok: false,
            path: None,
            tests_saved: 0,
            error: Some(e.to_string()),
        },
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create '{}'", dir.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write '{}'", path.display()))
}

/// Enumerate quarantined artifacts, oldest first.
pub fn list_quarantined(config: &EngineConfig) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = WalkDir::new(&config.quarantine_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == "py").unwrap_or(false))
        .collect();
    entries.sort();
    entries
}

fn test_def_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:async\s+)?def\s+(test_\w+)\s*\(").unwrap())
}

/// Build a reduced source containing only the requested test functions.
///
/// Non-test top-level segments (imports, fixtures, helpers) are always kept
/// so the promoted subset still runs. Returns None when any requested test
/// cannot be isolated at module level - class-based tests included.
pub fn extract_test_functions(code: &str, names: &[String]) -> Option<String> {
    if names.is_empty() {
        return None;
    }

    let lines: Vec<&str> = code.lines().collect();
    let segments = top_level_segments(&lines);

    // Parametrized case names collapse onto their defining function.
    let wanted: Vec<&str> = names
        .iter()
        .map(|n| n.split('[').next().unwrap_or(n))
        .collect();

    let mut found: Vec<&str> = Vec::new();
    let mut kept_lines: Vec<&str> = Vec::new();
    for (start, end) in &segments {
        match segment_test_name(&lines[*start..*end]) {
            Some(name) => {
                if wanted.iter().any(|w| *w == name) {
                    found.push(name);
                    kept_lines.extend_from_slice(&lines[*start..*end]);
                }
            }
            None => kept_lines.extend_from_slice(&lines[*start..*end]),
        }
    }

    for w in &wanted {
        if !found.contains(w) {
            return None;
        }
    }

    let mut reduced = kept_lines.join("\n");
    if !reduced.ends_with('\n') {
        reduced.push('\n');
    }
    Some(reduced)
}

/// Split a module into top-level segments, attaching decorator lines to the
/// definition that follows them.
fn top_level_segments(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut starts: Vec<usize> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let is_top_level =
            !line.trim().is_empty() && !line.starts_with(' ') && !line.starts_with('\t');
        if is_top_level {
            let continues_decorator = starts
                .last()
                .map(|&s| {
                    lines[s..i]
                        .iter()
                        .all(|l| l.trim().is_empty() || l.trim_start().starts_with('@'))
                        && lines[s].trim_start().starts_with('@')
                })
                .unwrap_or(false);
            if !continues_decorator {
                starts.push(i);
            }
        }
    }

    let mut segments = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(lines.len());
        segments.push((start, end));
    }
    segments
}

/// The test function a segment defines, if it is a module-level test def.
fn segment_test_name<'a>(segment: &[&'a str]) -> Option<&'a str> {
    for line in segment {
        let trimmed = line.trim_start();
        if trimmed.starts_with('@') || trimmed.is_empty() {
            continue;
        }
        return test_def_name_regex()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str());
    }
    None
}
