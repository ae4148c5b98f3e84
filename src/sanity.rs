//! Pre-flight sanity checks for the apply stage
//!
//! Before the engine is run twice against the host we verify:
//! - the engine executable (and any prefix command such as `sudo`) is on PATH
//! - the harness runs with root privileges (EUID 0), which package
//!   installation and service management need
//!
//! The verify stage only talks to the network and skips these checks.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::config_file::EngineConfig;

/// Set to `1` or `true` to skip the root check
pub const SKIP_ROOT_ENV: &str = "DASHVERIFY_SKIP_ROOT_CHECK";

/// Prefix commands that run the engine with root privileges
const ELEVATION_COMMANDS: &[&str] = &["sudo", "doas", "pkexec", "run0"];

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Check if a binary is available, either as a path or on PATH
fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Binaries the engine invocation needs
fn required_binaries(engine: &EngineConfig) -> Vec<&str> {
    let mut required: Vec<&str> = engine.prefix.first().map(String::as_str).into_iter().collect();
    required.push(engine.program.as_str());
    required
}

/// The prefix runs the engine elevated, so the harness itself need not be root
pub fn prefix_elevates(engine: &EngineConfig) -> bool {
    engine
        .prefix
        .first()
        .and_then(|cmd| Path::new(cmd).file_name())
        .and_then(|name| name.to_str())
        .is_some_and(|name| ELEVATION_COMMANDS.contains(&name))
}

pub fn verify_environment(engine: &EngineConfig) -> SanityCheckResult {
    let missing = required_binaries(engine)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .map(str::to_string)
        .collect();

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Skip root check (for development/testing)
pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Print what is wrong to stderr and exit with status 1
pub fn print_error_and_exit(result: &SanityCheckResult) -> ! {
    eprintln!();
    eprintln!("✗ Pre-flight check failed");
    eprintln!();

    if !result.is_root {
        eprintln!("  Root privileges required: the convergence engine installs packages");
        eprintln!("  and manages services. Run as root, configure engine.prefix");
        eprintln!("  (e.g. [\"sudo\", \"-n\"]), or set {}=1.", SKIP_ROOT_ENV);
        eprintln!();
    }

    if !result.missing_binaries.is_empty() {
        eprintln!("  Missing executables:");
        for binary in &result.missing_binaries {
            eprintln!("    • {}", binary);
        }
        eprintln!();
    }

    std::process::exit(1);
}

/// Run the checks, exiting the process if they fail.
///
/// An elevating prefix (`sudo`, `doas`) makes the root check unnecessary.
/// Other prefixes such as `env` or `bash` do not.
pub fn run_preflight_checks(engine: &EngineConfig, skip_root: bool) {
    debug!(skip_root, "running pre-flight sanity checks");

    let mut result = verify_environment(engine);

    if skip_root || should_skip_root_check() || prefix_elevates(engine) {
        if !result.is_root {
            warn!("root check skipped");
        }
        result.is_root = true;
    }

    if !result.is_ok() {
        print_error_and_exit(&result);
    }

    info!("pre-flight checks passed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists_bash() {
        assert!(binary_exists("bash"), "bash should be available");
    }

    #[test]
    fn test_binary_exists_nonexistent() {
        assert!(!binary_exists("this_binary_definitely_does_not_exist_12345"));
        assert!(!binary_exists("/nonexistent/dir/puppet"));
    }

    #[test]
    fn test_required_binaries_include_prefix() {
        let engine = EngineConfig {
            prefix: vec!["sudo".to_string(), "-n".to_string()],
            ..Default::default()
        };
        assert_eq!(required_binaries(&engine), vec!["sudo", "puppet"]);
        assert_eq!(required_binaries(&EngineConfig::default()), vec!["puppet"]);
    }

    #[test]
    fn test_verify_environment_reports_missing_engine() {
        let engine = EngineConfig {
            program: "this_engine_does_not_exist_12345".to_string(),
            ..Default::default()
        };
        let result = verify_environment(&engine);
        assert_eq!(
            result.missing_binaries,
            vec!["this_engine_does_not_exist_12345".to_string()]
        );
        assert!(!result.is_ok());
    }

    #[test]
    fn test_only_elevating_prefixes_skip_root_check() {
        let with_prefix = |prefix: &[&str]| EngineConfig {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        assert!(prefix_elevates(&with_prefix(&["sudo", "-n"])));
        assert!(prefix_elevates(&with_prefix(&["/usr/bin/doas"])));

        assert!(!prefix_elevates(&with_prefix(&["bash"])));
        assert!(!prefix_elevates(&with_prefix(&["env", "sudo"])));
        assert!(!prefix_elevates(&with_prefix(&["/opt/sudoers-helper"])));
        assert!(!prefix_elevates(&EngineConfig::default()));
    }

    #[test]
    fn test_sanity_result_is_ok() {
        let ok = SanityCheckResult {
            missing_binaries: vec![],
            is_root: true,
        };
        assert!(ok.is_ok());

        let not_root = SanityCheckResult {
            missing_binaries: vec![],
            is_root: false,
        };
        assert!(!not_root.is_ok());
    }
}
