//! dashverify library
//!
//! Applies the metrics dashboard manifest through a convergence engine,
//! checks the second application is idempotent, and probes the resulting
//! time-series database and dashboard over the network.

pub mod applier;
pub mod cli;
pub mod config_file;
pub mod error;
pub mod line_protocol;
pub mod manifest;
pub mod process_guard;
pub mod report;
pub mod sanity;
pub mod types;
pub mod verifier;

// Re-export main types for convenience
pub use applier::{
    ApplyOutput, ConvergeReport, ConvergenceEngine, PuppetApply, apply_manifest, converge,
    disable_dry_run, enable_dry_run, is_dry_run,
};
pub use config_file::{Credentials, EngineConfig, ProbeConfig, TargetConfig, VerifyConfig};
pub use error::DashverifyError;
pub use line_protocol::{FieldValue, Point};
pub use manifest::{ManifestOptions, ManifestValue};
pub use process_guard::{EngineCommandExt, EngineRegistry, ProcessGuard};
pub use report::RunReport;
pub use types::{ApplyExitCode, CheckKind, IdempotencePolicy};
pub use verifier::{Check, CheckResult, VerificationReport, Verifier};
