//! Combined outcome of a harness run, printed as text or JSON.

use serde::Serialize;
use std::fmt;

use crate::applier::ConvergeReport;
use crate::verifier::VerificationReport;

/// What a `run`, `apply` or `verify` command produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converge: Option<ConvergeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
}

impl RunReport {
    /// Every stage that ran passed
    pub fn passed(&self) -> bool {
        self.converge.as_ref().is_none_or(|c| c.passed())
            && self.verification.as_ref().is_none_or(|v| v.all_passed())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(converge) = &self.converge {
            writeln!(f, "Convergence ({} idempotence):", converge.policy)?;
            for (i, run) in converge.runs.iter().enumerate() {
                let dry = if run.dry_run { " [dry run]" } else { "" };
                writeln!(f, "  apply #{}: {} in {}ms{}", i + 1, run.exit, run.elapsed_ms, dry)?;
            }
            match &converge.failure {
                Some(reason) => writeln!(f, "✗ {}", reason)?,
                None => writeln!(f, "✓ manifest applied and idempotent")?,
            }
        }
        if let Some(verification) = &self.verification {
            writeln!(f, "Verification:")?;
            writeln!(f, "{}", verification)?;
        }
        write!(f, "{}", if self.passed() { "PASSED" } else { "FAILED" })
    }
}
