//! Configuration file handling for saving and loading verification configs.
//!
//! Every section has defaults matching a stock single-node install, so an
//! empty JSON object (`{}`) is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::manifest::{DEFAULT_CLASS, ManifestOptions};
use crate::types::IdempotencePolicy;

/// How the convergence engine is invoked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable (looked up on PATH)
    pub program: String,
    /// Command words placed before the program, e.g. `["sudo", "-n"]`
    pub prefix: Vec<String>,
    /// Extra arguments appended after `apply --detailed-exitcodes`
    pub extra_args: Vec<String>,
    /// What the second application must report
    pub policy: IdempotencePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "puppet".to_string(),
            prefix: Vec::new(),
            extra_args: Vec::new(),
            policy: IdempotencePolicy::Strict,
        }
    }
}

/// Where the converged services are reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    /// Time-series database HTTP port
    pub database_port: u16,
    /// Dashboard data source to look up (default: `influxdb_<database>`)
    pub datasource_name: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            database_port: 8086,
            datasource_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub database_user: String,
    pub database_password: String,
    pub dashboard_user: String,
    pub dashboard_password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            database_user: "admin".to_string(),
            database_password: "puppetlabs".to_string(),
            dashboard_user: "admin".to_string(),
            dashboard_password: "puppet".to_string(),
        }
    }
}

/// Probe behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Connect and request timeout in seconds
    pub timeout_secs: u64,
    /// Fixed timestamp for the written point (default: now)
    pub timestamp: Option<i64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            timestamp: None,
        }
    }
}

/// Full verification configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Class the manifest declares
    pub class_name: String,
    pub manifest: ManifestOptions,
    pub engine: EngineConfig,
    pub target: TargetConfig,
    pub credentials: Credentials,
    pub probe: ProbeConfig,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            class_name: DEFAULT_CLASS.to_string(),
            manifest: ManifestOptions::default(),
            engine: EngineConfig::default(),
            target: TargetConfig::default(),
            credentials: Credentials::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl VerifyConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.class_name.trim().is_empty() {
            anyhow::bail!("Class name must be specified");
        }

        self.manifest.validate()?;

        if self.engine.program.trim().is_empty() {
            anyhow::bail!("Engine program must be specified");
        }

        if self.target.host.trim().is_empty() {
            anyhow::bail!("Target host must be specified");
        }
        if self.target.database_port == 0 {
            anyhow::bail!("Database port must be between 1 and 65535");
        }
        if let Some(name) = &self.target.datasource_name {
            if name.trim().is_empty() || name.contains('/') {
                anyhow::bail!("Data source name cannot be empty or contain '/'");
            }
        }

        if self.credentials.database_user.trim().is_empty() {
            anyhow::bail!("Database user must be specified");
        }
        // Basic auth splits user and password on the first colon
        if self.credentials.dashboard_user.trim().is_empty()
            || self.credentials.dashboard_user.contains(':')
        {
            anyhow::bail!("Dashboard user must be non-empty and cannot contain ':'");
        }

        if self.probe.timeout_secs == 0 {
            anyhow::bail!("Probe timeout must be at least 1 second");
        }

        Ok(())
    }

    /// Dashboard port, as declared in the manifest
    pub fn dashboard_port(&self) -> u16 {
        self.manifest.dashboard_http_port
    }

    /// Database the write and query probes target
    pub fn database(&self) -> &str {
        self.manifest.primary_database().unwrap_or("puppet_metrics")
    }

    /// Data source the dashboard lookup expects
    pub fn datasource_name(&self) -> String {
        match &self.target.datasource_name {
            Some(name) => name.clone(),
            None => format!("influxdb_{}", self.database()),
        }
    }

    /// Rendered manifest text
    pub fn render_manifest(&self) -> String {
        self.manifest.render(&self.class_name)
    }
}
