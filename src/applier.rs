//! Manifest application through an external convergence engine.
//!
//! Every engine run goes through `apply_manifest`, which isolates the engine
//! in its own process group and registers it for cleanup. `converge` applies
//! the same manifest twice and judges the second run against the
//! idempotence policy.

use serde::Serialize;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config_file::EngineConfig;
use crate::error::{DashverifyError, Result};
use crate::process_guard::{EngineCommandExt, delivered_signal, track_engine};
use crate::types::{ApplyExitCode, IdempotencePolicy};

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Log engine invocations instead of running them.
pub fn enable_dry_run() {
    DRY_RUN.store(true, Ordering::SeqCst);
}

pub fn disable_dry_run() {
    DRY_RUN.store(false, Ordering::SeqCst);
}

pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// The seam between the harness and the tool that converges the host.
///
/// Implementors only describe the invocation; spawning, cleanup and exit
/// classification stay in `apply_manifest`.
pub trait ConvergenceEngine {
    /// Short name used in logs and reports
    fn name(&self) -> &str;

    /// Full command line for applying `manifest`. The first word is the
    /// executable; the result is never empty.
    fn command_line(&self, manifest: &str) -> Vec<String>;

    /// Extra environment for the engine process
    fn env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// `puppet apply --detailed-exitcodes --execute <manifest>`
#[derive(Debug, Clone)]
pub struct PuppetApply {
    pub program: String,
    pub prefix: Vec<String>,
    pub extra_args: Vec<String>,
}

impl PuppetApply {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            prefix: config.prefix.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

impl Default for PuppetApply {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ConvergenceEngine for PuppetApply {
    fn name(&self) -> &str {
        "puppet apply"
    }

    fn command_line(&self, manifest: &str) -> Vec<String> {
        let mut cmd = self.prefix.clone();
        cmd.push(self.program.clone());
        cmd.push("apply".to_string());
        cmd.push("--detailed-exitcodes".to_string());
        cmd.extend(self.extra_args.iter().cloned());
        cmd.push("--execute".to_string());
        cmd.push(manifest.to_string());
        cmd
    }
}

/// Output from one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ApplyExitCode,
    pub elapsed_ms: u64,
    pub dry_run: bool,
}

impl ApplyOutput {
    /// Fail if the engine reported the fatal sentinel or never finished.
    pub fn ensure_not_fatal(&self, context: &str) -> Result<()> {
        if self.exit.is_fatal() {
            return Err(DashverifyError::engine(format!(
                "{} failed: {}{}",
                context,
                self.exit,
                stderr_suffix(&self.stderr)
            )));
        }
        Ok(())
    }

    /// Fail unless the engine reported nothing left to change.
    pub fn ensure_idempotent(&self, context: &str) -> Result<()> {
        if !self.exit.is_idempotent() {
            return Err(DashverifyError::engine(format!(
                "{} is not idempotent: {}{}",
                context,
                self.exit,
                stderr_suffix(&self.stderr)
            )));
        }
        Ok(())
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        // Last lines carry the engine's error summary
        let tail: Vec<&str> = trimmed.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        format!(": {}", tail.join(" | "))
    }
}

/// Fail with `Interrupted` once the harness has been signalled.
fn check_interrupted() -> Result<()> {
    match delivered_signal() {
        Some(sig) => Err(DashverifyError::Interrupted(sig)),
        None => Ok(()),
    }
}

/// Apply `manifest` once through `engine`.
///
/// A non-zero exit is not an error here, it is classified into
/// `ApplyOutput::exit`. Errors are reserved for failing to run the engine
/// and for runs cut short by a signal to the harness.
pub fn apply_manifest<E: ConvergenceEngine + ?Sized>(
    engine: &E,
    manifest: &str,
) -> Result<ApplyOutput> {
    let command_line = engine.command_line(manifest);
    let Some((program, args)) = command_line.split_first() else {
        return Err(DashverifyError::engine(format!(
            "{} produced an empty command line",
            engine.name()
        )));
    };
    let env_vars = engine.env_vars();

    debug!(program = %program, args = ?args, env = ?env_vars, "engine command");

    if is_dry_run() {
        info!(engine = engine.name(), "[DRY RUN] skipped: {}", command_line.join(" "));
        return Ok(ApplyOutput {
            stdout: format!("[DRY RUN] Skipped: {}\n", engine.name()),
            stderr: String::new(),
            exit: ApplyExitCode::NoChanges,
            elapsed_ms: 0,
            dry_run: true,
        });
    }

    check_interrupted()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .isolate_engine();
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let child = cmd.spawn().map_err(|e| {
        DashverifyError::engine(format!("failed to spawn {}: {}", program, e))
    })?;
    let tracked = track_engine(child.id());
    let waited = child.wait_with_output();
    drop(tracked);

    // The engine died because the harness is stopping it
    check_interrupted()?;
    let output = waited
        .map_err(|e| DashverifyError::engine(format!("failed waiting for {}: {}", program, e)))?;
    let elapsed_ms = duration_ms(start.elapsed());
    let exit = ApplyExitCode::from_code(output.status.code());

    info!(engine = engine.name(), exit = %exit, elapsed_ms, "engine run finished");

    Ok(ApplyOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit,
        elapsed_ms,
        dry_run: false,
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Result of applying the manifest twice.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeReport {
    pub policy: IdempotencePolicy,
    /// Runs in order; only one when the first run was fatal
    pub runs: Vec<ApplyOutput>,
    pub failure: Option<String>,
}

impl ConvergeReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run the engine once; a run that could not happen becomes a failure reason.
fn attempt<E: ConvergenceEngine + ?Sized>(
    engine: &E,
    manifest: &str,
    label: &str,
) -> Result<std::result::Result<ApplyOutput, String>> {
    match apply_manifest(engine, manifest) {
        Ok(output) => Ok(Ok(output)),
        Err(e @ DashverifyError::Interrupted(_)) => Err(e),
        Err(e) => {
            warn!(error = %e, "{} could not run", label);
            Ok(Err(format!("{} could not run: {}", label, e)))
        }
    }
}

/// Apply the manifest twice and judge idempotence.
///
/// The first run must not be fatal. Under `Strict` the second run must
/// report no changes; under `Lenient` it only has to be non-fatal.
/// A fatal first run stops before the second. An engine that cannot be
/// started is a failed report, not an error; only an interrupt is.
pub fn converge<E: ConvergenceEngine + ?Sized>(
    engine: &E,
    manifest: &str,
    policy: IdempotencePolicy,
) -> Result<ConvergeReport> {
    info!(engine = engine.name(), %policy, "applying manifest (run 1 of 2)");
    let first = match attempt(engine, manifest, "apply #1")? {
        Ok(output) => output,
        Err(failure) => {
            return Ok(ConvergeReport {
                policy,
                runs: Vec::new(),
                failure: Some(failure),
            });
        }
    };
    if let Err(e) = first.ensure_not_fatal("apply #1") {
        warn!(error = %e, "first application failed");
        return Ok(ConvergeReport {
            policy,
            runs: vec![first],
            failure: Some(e.to_string()),
        });
    }
    if first.exit.has_failures() {
        warn!(exit = %first.exit, "first application reported resource failures");
    }

    info!(engine = engine.name(), "applying manifest (run 2 of 2)");
    let second = match attempt(engine, manifest, "apply #2")? {
        Ok(output) => output,
        Err(failure) => {
            return Ok(ConvergeReport {
                policy,
                runs: vec![first],
                failure: Some(failure),
            });
        }
    };
    let verdict = match policy {
        IdempotencePolicy::Strict => second.ensure_idempotent("apply #2"),
        IdempotencePolicy::Lenient => second.ensure_not_fatal("apply #2"),
    };
    let failure = verdict.err().map(|e| {
        warn!(error = %e, "second application failed");
        e.to_string()
    });

    Ok(ConvergeReport {
        policy,
        runs: vec![first, second],
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs a bash one-liner instead of a real engine
    struct ShellEngine(&'static str);

    impl ConvergenceEngine for ShellEngine {
        fn name(&self) -> &str {
            "shell"
        }

        fn command_line(&self, manifest: &str) -> Vec<String> {
            vec![
                "bash".to_string(),
                "-c".to_string(),
                self.0.to_string(),
                "engine".to_string(),
                manifest.to_string(),
            ]
        }
    }

    #[test]
    fn test_puppet_command_line() {
        let engine = PuppetApply {
            program: "/opt/puppetlabs/bin/puppet".to_string(),
            prefix: vec!["sudo".to_string(), "-n".to_string()],
            extra_args: vec!["--verbose".to_string()],
        };
        let cmd = engine.command_line("class { 'x': }");
        assert_eq!(
            cmd,
            vec![
                "sudo",
                "-n",
                "/opt/puppetlabs/bin/puppet",
                "apply",
                "--detailed-exitcodes",
                "--verbose",
                "--execute",
                "class { 'x': }",
            ]
        );
    }

    #[test]
    fn test_default_puppet_command_line() {
        let cmd = PuppetApply::default().command_line("m");
        assert_eq!(cmd[0], "puppet");
        assert_eq!(cmd.last().map(String::as_str), Some("m"));
    }

    #[test]
    fn test_apply_captures_output_and_manifest() {
        let engine = ShellEngine("echo \"got: $1\"; echo warn >&2; exit 2");
        let output = apply_manifest(&engine, "node default {}").unwrap();
        assert_eq!(output.exit, ApplyExitCode::Changes);
        assert_eq!(output.stdout.trim(), "got: node default {}");
        assert_eq!(output.stderr.trim(), "warn");
        assert!(!output.dry_run);
    }

    #[test]
    fn test_apply_missing_program_is_error() {
        struct Missing;
        impl ConvergenceEngine for Missing {
            fn name(&self) -> &str {
                "missing"
            }
            fn command_line(&self, _manifest: &str) -> Vec<String> {
                vec!["/nonexistent/engine-binary".to_string()]
            }
        }
        let result = apply_manifest(&Missing, "m");
        assert!(matches!(result, Err(DashverifyError::Engine(_))));
    }

    #[test]
    fn test_apply_empty_command_line_is_error() {
        struct Empty;
        impl ConvergenceEngine for Empty {
            fn name(&self) -> &str {
                "empty"
            }
            fn command_line(&self, _manifest: &str) -> Vec<String> {
                Vec::new()
            }
        }
        assert!(apply_manifest(&Empty, "m").is_err());
    }

    #[test]
    fn test_ensure_not_fatal() {
        let mut output = ApplyOutput {
            stdout: String::new(),
            stderr: "Error: Could not find class\n".to_string(),
            exit: ApplyExitCode::Fatal,
            elapsed_ms: 0,
            dry_run: false,
        };
        let err = output.ensure_not_fatal("apply #1").unwrap_err().to_string();
        assert!(err.contains("apply #1"));
        assert!(err.contains("Could not find class"));

        output.exit = ApplyExitCode::Failures;
        assert!(output.ensure_not_fatal("apply #1").is_ok());
        assert!(output.ensure_idempotent("apply #2").is_err());

        output.exit = ApplyExitCode::NoChanges;
        assert!(output.ensure_idempotent("apply #2").is_ok());
    }

    #[test]
    fn test_converge_fatal_first_run_stops() {
        let report = converge(
            &ShellEngine("exit 1"),
            "m",
            IdempotencePolicy::Strict,
        )
        .unwrap();
        assert!(!report.passed());
        assert_eq!(report.runs.len(), 1);
    }

    #[test]
    fn test_converge_always_changing_fails_strict_passes_lenient() {
        let engine = ShellEngine("exit 2");

        let strict = converge(&engine, "m", IdempotencePolicy::Strict).unwrap();
        assert!(!strict.passed());
        assert_eq!(strict.runs.len(), 2);

        let lenient = converge(&engine, "m", IdempotencePolicy::Lenient).unwrap();
        assert!(lenient.passed());
    }

    #[test]
    fn test_converge_records_engine_that_cannot_start() {
        struct Missing;
        impl ConvergenceEngine for Missing {
            fn name(&self) -> &str {
                "missing"
            }
            fn command_line(&self, _manifest: &str) -> Vec<String> {
                vec!["/nonexistent/engine-binary".to_string()]
            }
        }
        let report = converge(&Missing, "m", IdempotencePolicy::Strict).unwrap();
        assert!(!report.passed());
        assert!(report.runs.is_empty());
        let failure = report.failure.unwrap();
        assert!(failure.starts_with("apply #1 could not run"), "{}", failure);
    }

    #[test]
    fn test_stderr_suffix_keeps_tail() {
        let stderr = (1..=8).map(|i| format!("line{}", i)).collect::<Vec<_>>().join("\n");
        let suffix = stderr_suffix(&stderr);
        assert_eq!(suffix, ": line4 | line5 | line6 | line7 | line8");
        assert_eq!(stderr_suffix("  \n"), "");
    }
}
