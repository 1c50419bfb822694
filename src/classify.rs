//! Three-way reduction of a sandbox outcome.
//!
//! The single decision point the persistence policy consumes.

use crate::sandbox::SandboxResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Every discovered test passed.
    FullSuccess,
    /// Some tests passed, some failed.
    PartialSuccess,
    /// Nothing passed, or the run timed out/crashed.
    FullFailure,
}

/// Classify a sandbox result. A timeout or crash carries empty test lists,
/// so it can never look like a partial success.
pub fn classify(result: &SandboxResult) -> Disposition {
    if result.passed {
        Disposition::FullSuccess
    } else if !result.passed_tests.is_empty() {
        Disposition::PartialSuccess
    } else {
        Disposition::FullFailure
    }
}
