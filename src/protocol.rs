//! Contracts for the collaborators the engine consumes.
//!
//! Classification, strategy inference, context retrieval, policy rules, and
//! the model transport all live outside this crate. Each is a single-purpose
//! trait injected into the orchestrator at construction.

use crate::sandbox::SandboxResult;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Everything the engine is given about the module under test.
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    /// Full source text of the target module.
    pub source: String,
    /// Module docstring, if the provider extracted one.
    pub docstring: Option<String>,
    /// Symbols declared in the module, in source order.
    pub symbols: Vec<SymbolInfo>,
    /// Import names the module depends on.
    pub dependencies: Vec<String>,
    /// Symbols or branches the provider flagged as uncovered.
    pub coverage_gaps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based line of the definition in the source module.
    pub line: usize,
    /// False when the upstream classifier ruled the symbol out
    /// (e.g. excessive complexity); the engine never generates for it.
    pub eligible: bool,
    pub skip_reason: Option<String>,
}

impl SymbolInfo {
    pub fn eligible(name: impl Into<String>, kind: SymbolKind, line: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            line,
            eligible: true,
            skip_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Method,
    Class,
}

/// A generation approach chosen by the external strategist. The engine
/// treats it as data: the name keys reporting, the guidance is prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub guidance: String,
}

impl Strategy {
    pub fn new(name: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidance: guidance.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One policy or structural defect in a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub message: String,
    pub severity: Severity,
    pub rule: String,
}

impl Violation {
    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            rule: rule.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStatus {
    Clean,
    Dirty,
}

#[derive(Debug, Clone)]
pub struct PolicyReport {
    pub status: PolicyStatus,
    pub violations: Vec<Violation>,
}

impl PolicyReport {
    pub fn clean() -> Self {
        Self {
            status: PolicyStatus::Clean,
            violations: Vec::new(),
        }
    }

    pub fn dirty(violations: Vec<Violation>) -> Self {
        Self {
            status: PolicyStatus::Dirty,
            violations,
        }
    }
}

/// Which kind of completion is being requested; implementations may map
/// roles to different model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    Generation,
    Correction,
}

/// Builds the enriched per-module context used in prompts.
pub trait ContextProvider: Send + Sync {
    fn build(&self, file: &Path) -> Result<ModuleContext>;
}

/// Chooses the generation approach, and a replacement when the engine
/// reports a repeated failure pattern.
pub trait Strategist: Send + Sync {
    fn select(&self, file: &Path) -> Strategy;
    fn switch(&self, current: &Strategy, failure_pattern: &str) -> Strategy;
}

/// Language-model transport. The engine owns extraction of a code block
/// from the raw text and treats extraction failure as terminal for the
/// attempt.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        role: PromptRole,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// External static-policy rule engine.
pub trait PolicyValidator: Send + Sync {
    fn validate(&self, file: &Path, code: &str) -> Result<PolicyReport>;
}

/// Reduces a sandbox outcome to a coarse failure-pattern label used for
/// strategy switching and reporting.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, result: &SandboxResult) -> String;
}
