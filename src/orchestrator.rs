//! Orchestration of one file's generation run.
//!
//! Drives each symbol through generate → repair → validate → correct →
//! sandbox → classify → persist, tracks repeated failure patterns, and asks
//! the strategist for a new approach when the same pattern keeps recurring.
//! Symbols run sequentially: that bounds model spend and keeps the
//! consecutive-failure counter meaningful within a single strategy.

use crate::classify::{classify, Disposition};
use crate::config::EngineConfig;
use crate::correct::{attempt_correction, extract_code_block, CorrectionOutcome};
use crate::persist;
use crate::prompts::{build_generation_prompt, TEST_GENERATION_SYSTEM};
use crate::protocol::{
    ContextProvider, FailureClassifier, ModelClient, ModuleContext, PolicyValidator, PromptRole,
    Strategist, Strategy, SymbolInfo,
};
use crate::repair::apply_all_repairs;
use crate::report;
use crate::sandbox::{Overlay, Sandbox, TestExecutor};
use crate::validate;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Pattern label for failures before any candidate exists.
pub const PATTERN_GENERATION_ERROR: &str = "generation_error";
/// Pattern label for candidates that never passed validation.
pub const PATTERN_VALIDATION_EXHAUSTED: &str = "validation_exhausted";

/// One symbol's journey through the pipeline. Created once, mutated in
/// place as stages complete, appended to the run's attempt list.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationAttempt {
    pub symbol: String,
    pub source_file: PathBuf,
    /// Final candidate text. Not serialized into summaries; the promoted or
    /// quarantined artifact already carries it.
    #[serde(skip_serializing)]
    pub code: String,
    pub repairs_applied: Vec<String>,
    pub validated: bool,
    pub validation_failed: bool,
    pub sandbox_ran: bool,
    pub sandbox_passed: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub persist_path: Option<PathBuf>,
    pub persisted: bool,
    pub disposition: Option<Disposition>,
    pub failure_pattern: Option<String>,
    pub error: Option<String>,
}

impl GenerationAttempt {
    fn new(symbol: &str, source_file: &Path) -> Self {
        Self {
            symbol: symbol.to_string(),
            source_file: source_file.to_path_buf(),
            code: String::new(),
            repairs_applied: Vec::new(),
            validated: false,
            validation_failed: false,
            sandbox_ran: false,
            sandbox_passed: false,
            skipped: false,
            skip_reason: None,
            persist_path: None,
            persisted: false,
            disposition: None,
            failure_pattern: None,
            error: None,
        }
    }

    fn skipped(symbol: &str, source_file: &Path, reason: Option<String>) -> Self {
        let mut attempt = Self::new(symbol, source_file);
        attempt.skipped = true;
        attempt.skip_reason = reason;
        attempt
    }
}

/// Per-file aggregate, built once from the completed attempt list. Doubles
/// as the summary artifact schema consumed by the external reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct TestGenerationResult {
    pub file: PathBuf,
    /// Attempts that ended in a full or partial promotion.
    pub generated: usize,
    /// Attempts that ran and ended unpromoted.
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub strategy_switches: u32,
    pub failure_patterns: BTreeMap<String, u32>,
    pub duration_ms: u64,
    pub attempts: Vec<GenerationAttempt>,
}

/// The injected collaborator set. Everything the engine does not own.
pub struct Collaborators {
    pub context: Box<dyn ContextProvider>,
    pub strategist: Box<dyn Strategist>,
    pub model: Box<dyn ModelClient>,
    pub validator: Box<dyn PolicyValidator>,
    pub patterns: Box<dyn FailureClassifier>,
}

pub struct Orchestrator {
    config: EngineConfig,
    context: Box<dyn ContextProvider>,
    strategist: Box<dyn Strategist>,
    model: Box<dyn ModelClient>,
    validator: Box<dyn PolicyValidator>,
    patterns: Box<dyn FailureClassifier>,
    executor: Box<dyn TestExecutor>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let executor: Box<dyn TestExecutor> = Box::new(Sandbox::new(&config));
        Self {
            config,
            context: collaborators.context,
            strategist: collaborators.strategist,
            model: collaborators.model,
            validator: collaborators.validator,
            patterns: collaborators.patterns,
            executor,
        }
    }

    /// Replace the pytest sandbox with a custom executor.
    pub fn with_executor(mut self, executor: Box<dyn TestExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Generate, validate, and persist tests for every eligible symbol in
    /// one file. Safe to call concurrently for independent files: runs
    /// share no mutable state.
    pub async fn run_file(
        &self,
        file: &Path,
        overlay: Option<&Overlay>,
    ) -> Result<TestGenerationResult> {
        let started = Instant::now();
        let ctx = self.context.build(file)?;
        let mut strategy = self.strategist.select(file);

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut failure_patterns: BTreeMap<String, u32> = BTreeMap::new();
        let mut strategy_switches = 0u32;
        // Consecutive failures sharing one pattern label under the current
        // strategy.
        let mut streak: Option<(String, u32)> = None;

        for symbol in &ctx.symbols {
            if !symbol.eligible {
                attempts.push(GenerationAttempt::skipped(
                    &symbol.name,
                    file,
                    symbol.skip_reason.clone(),
                ));
                continue;
            }

            let attempt = self.run_symbol(file, symbol, &ctx, &strategy, overlay).await;

            match attempt.failure_pattern.clone() {
                Some(pattern) => {
                    *failure_patterns.entry(pattern.clone()).or_insert(0) += 1;
                    let count = match &mut streak {
                        Some((current, count)) if *current == pattern => {
                            *count += 1;
                            *count
                        }
                        _ => {
                            streak = Some((pattern.clone(), 1));
                            1
                        }
                    };
                    if count >= self.config.failure_switch_threshold {
                        strategy = self.strategist.switch(&strategy, &pattern);
                        strategy_switches += 1;
                        streak = None;
                    }
                }
                None => streak = None,
            }

            attempts.push(attempt);
        }

        let mut generated = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        for attempt in &attempts {
            if attempt.skipped {
                skipped += 1;
            } else if attempt.persisted
                && matches!(
                    attempt.disposition,
                    Some(Disposition::FullSuccess | Disposition::PartialSuccess)
                )
            {
                generated += 1;
            } else {
                failed += 1;
            }
        }
        let ran = generated + failed;
        let success_rate = if ran == 0 {
            0.0
        } else {
            generated as f64 / ran as f64
        };

        let result = TestGenerationResult {
            file: file.to_path_buf(),
            generated,
            failed,
            skipped,
            success_rate,
            strategy_switches,
            failure_patterns,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
        };

        if self.config.report_root.is_some() {
            if let Err(e) = report::write_summary(&self.config, &result) {
                eprintln!(
                    "  Warning: failed to write summary for {}: {}",
                    file.display(),
                    e
                );
            }
        }

        Ok(result)
    }

    async fn run_symbol(
        &self,
        file: &Path,
        symbol: &SymbolInfo,
        ctx: &ModuleContext,
        strategy: &Strategy,
        overlay: Option<&Overlay>,
    ) -> GenerationAttempt {
        let mut attempt = GenerationAttempt::new(&symbol.name, file);

        let user = build_generation_prompt(file, &symbol.name, ctx, strategy);
        let raw = match self
            .model
            .complete(TEST_GENERATION_SYSTEM, &user, PromptRole::Generation)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                attempt.error = Some(format!("generation failed: {}", e));
                attempt.failure_pattern = Some(PATTERN_GENERATION_ERROR.to_string());
                return attempt;
            }
        };

        let Some(candidate) = extract_code_block(&raw) else {
            attempt.error = Some("no code block in generation response".to_string());
            attempt.failure_pattern = Some(PATTERN_GENERATION_ERROR.to_string());
            return attempt;
        };

        let (mut code, repairs) = apply_all_repairs(&candidate);
        attempt.repairs_applied = repairs;

        let mut violations = match validate::validate(self.validator.as_ref(), file, &code, ctx) {
            Ok(violations) => violations,
            Err(e) => {
                attempt.code = code;
                attempt.error = Some(format!("validation failed: {}", e));
                attempt.failure_pattern = Some(PATTERN_VALIDATION_EXHAUSTED.to_string());
                return attempt;
            }
        };

        // Model corrections consume the fix budget whether they succeed or
        // not; the automatic repairs above were free.
        let mut corrections_used = 0u32;
        while !violations.is_empty() && corrections_used < self.config.max_fix_attempts {
            corrections_used += 1;
            let goal = format!("tests for {}", symbol.name);
            match attempt_correction(
                self.model.as_ref(),
                self.validator.as_ref(),
                file,
                &code,
                &violations,
                ctx,
                &goal,
            )
            .await
            {
                CorrectionOutcome::Success {
                    code: fixed,
                    repairs,
                } => {
                    code = fixed;
                    for repair in repairs {
                        if !attempt.repairs_applied.contains(&repair) {
                            attempt.repairs_applied.push(repair);
                        }
                    }
                    violations.clear();
                }
                CorrectionOutcome::FailedValidation {
                    code: fixed,
                    violations: remaining,
                } => {
                    code = fixed;
                    violations = remaining;
                }
                CorrectionOutcome::Error(e) => {
                    attempt.error = Some(e);
                    break;
                }
            }
        }

        attempt.code = code.clone();

        if !violations.is_empty() || attempt.error.is_some() {
            attempt.validation_failed = true;
            attempt.failure_pattern = Some(PATTERN_VALIDATION_EXHAUSTED.to_string());
            let persisted = persist::persist(
                &self.config,
                file,
                &symbol.name,
                &code,
                Disposition::FullFailure,
                &[],
            );
            record_persist(&mut attempt, persisted);
            return attempt;
        }
        attempt.validated = true;

        let result = self.executor.run(&code, &symbol.name, overlay);
        attempt.sandbox_ran = true;
        attempt.sandbox_passed = result.passed;

        let disposition = classify(&result);
        attempt.disposition = Some(disposition);
        if disposition != Disposition::FullSuccess {
            attempt.failure_pattern = Some(self.patterns.classify(&result));
        }
        if let Some(error) = &result.error {
            attempt.error = Some(error.clone());
        }

        let persisted = persist::persist(
            &self.config,
            file,
            &symbol.name,
            &code,
            disposition,
            &result.passed_tests,
        );
        record_persist(&mut attempt, persisted);
        attempt
    }
}

fn record_persist(attempt: &mut GenerationAttempt, result: persist::PersistResult) {
    attempt.persisted = result.ok;
    attempt.persist_path = result.path;
    if let Some(error) = result.error {
        eprintln!(
            "  Warning: persistence problem for {}: {}",
            attempt.symbol, error
        );
        if attempt.error.is_none() {
            attempt.error = Some(error);
        }
    }
}
