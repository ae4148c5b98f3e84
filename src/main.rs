//! dashverify - main entry point

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use dashverify::cli::{ApplyArgs, Cli, Commands};
use dashverify::{
    ConvergeReport, IdempotencePolicy, ProcessGuard, PuppetApply, RunReport, Verifier,
    VerifyConfig, converge, enable_dry_run, is_dry_run, process_guard, sanity,
};

/// Logs go to stderr so stdout carries only the report or manifest.
/// `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    // Interrupting a run must not leave the engine converging the host
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!(error = %e, "failed to initialize signal handlers");
    }
    let _guard = ProcessGuard::new();

    if cli.dry_run {
        enable_dry_run();
    }

    let outcome = run(&cli);

    // An interrupted engine run is not a failure to report
    if let Some(sig) = process_guard::delivered_signal() {
        warn!(signal = sig, "run interrupted");
        return ExitCode::from(process_guard::interrupt_exit_code(sig));
    }

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Execute the command; `Ok(false)` means a check or apply step failed.
fn run(cli: &Cli) -> Result<bool> {
    match &cli.command {
        Commands::Validate { config } => Ok(validate_config_file(config)),
        Commands::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            VerifyConfig::default().save_to_file(path)?;
            println!("✓ Default configuration written to {}", path.display());
            Ok(true)
        }
        Commands::Manifest => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", config.render_manifest());
            Ok(true)
        }
        Commands::Apply { apply } => {
            let config = load_config(cli.config.as_deref())?;
            let report = RunReport {
                converge: Some(apply_stage(&config, apply)?),
                verification: None,
            };
            print_report(&report, cli.json)
        }
        Commands::Verify => {
            let config = load_config(cli.config.as_deref())?;
            let report = RunReport {
                converge: None,
                verification: Some(Verifier::new(&config)?.run_all()),
            };
            print_report(&report, cli.json)
        }
        Commands::Run { apply } => {
            let config = load_config(cli.config.as_deref())?;
            let converge_report = apply_stage(&config, apply)?;
            if !converge_report.passed() {
                // Each check still reports on its own
                warn!("convergence failed, verifying anyway");
            }
            let report = RunReport {
                converge: Some(converge_report),
                verification: Some(Verifier::new(&config)?.run_all()),
            };
            print_report(&report, cli.json)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<VerifyConfig> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            VerifyConfig::load_from_file(path)?
        }
        None => {
            debug!("no configuration file given, using defaults");
            VerifyConfig::default()
        }
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn validate_config_file(path: &Path) -> bool {
    info!(path = %path.display(), "validating configuration file");
    match VerifyConfig::load_from_file(path).and_then(|c| c.validate()) {
        Ok(()) => {
            println!("✓ Configuration file is valid: {}", path.display());
            true
        }
        Err(e) => {
            error!("configuration validation failed: {:#}", e);
            eprintln!("✗ Configuration validation failed: {:#}", e);
            false
        }
    }
}

fn apply_stage(config: &VerifyConfig, args: &ApplyArgs) -> Result<ConvergeReport> {
    if !args.skip_preflight && !is_dry_run() {
        sanity::run_preflight_checks(&config.engine, false);
    }

    let policy = if args.lenient {
        IdempotencePolicy::Lenient
    } else {
        config.engine.policy
    };
    let engine = PuppetApply::from_config(&config.engine);
    let manifest = config.render_manifest();
    debug!(%manifest, "rendered manifest");

    converge(&engine, &manifest, policy).context("Failed to apply manifest")
}

fn print_report(report: &RunReport, json: bool) -> Result<bool> {
    if json {
        println!("{}", report.to_json().context("Failed to serialize report")?);
    } else {
        println!("{}", report);
    }
    Ok(report.passed())
}
