//! Declarative manifest for the metrics dashboard module.
//!
//! Typed options are rendered into a single class declaration that the
//! convergence engine evaluates. Options the typed set does not model can be
//! passed through `extra`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DashverifyError, Result};

/// Class the manifest declares unless configured otherwise
pub const DEFAULT_CLASS: &str = "puppet_metrics_dashboard";

/// One manifest parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

/// Single-quote a string, escaping backslashes and quotes.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

impl fmt::Display for ManifestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{}", quote(s)),
            Self::List(items) => {
                let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
                write!(f, "[{}]", quoted.join(", "))
            }
        }
    }
}

/// Options of the metrics dashboard class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestOptions {
    /// Port the dashboard application listens on
    pub dashboard_http_port: u16,
    /// Databases created in the time-series database
    pub database_name: Vec<String>,
    /// Run the metrics collection agent
    pub enable_agent: bool,
    /// Manage the agent's configuration
    pub configure_agent: bool,
    /// Install the example dashboards
    pub add_examples: bool,
    /// Parameters passed through verbatim
    pub extra: BTreeMap<String, ManifestValue>,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            dashboard_http_port: 3000,
            database_name: vec!["puppet_metrics".to_string()],
            enable_agent: false,
            configure_agent: false,
            add_examples: false,
            extra: BTreeMap::new(),
        }
    }
}

fn is_parameter_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ManifestOptions {
    /// Database used for the write and query probes.
    pub fn primary_database(&self) -> Option<&str> {
        self.database_name.first().map(String::as_str)
    }

    /// Parameters in render order: typed options first, then `extra` by name.
    pub fn parameters(&self) -> Vec<(String, ManifestValue)> {
        let mut params = vec![
            (
                "grafana_http_port".to_string(),
                ManifestValue::Int(i64::from(self.dashboard_http_port)),
            ),
            (
                "influxdb_database_name".to_string(),
                ManifestValue::List(self.database_name.clone()),
            ),
            (
                "configure_telegraf".to_string(),
                ManifestValue::Bool(self.configure_agent),
            ),
            (
                "enable_telegraf".to_string(),
                ManifestValue::Bool(self.enable_agent),
            ),
            (
                "add_dashboard_examples".to_string(),
                ManifestValue::Bool(self.add_examples),
            ),
        ];
        params.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    /// Check that every value is well-formed for the target class.
    pub fn validate(&self) -> Result<()> {
        if self.dashboard_http_port == 0 {
            return Err(DashverifyError::manifest(
                "dashboard_http_port must be between 1 and 65535",
            ));
        }

        if self.database_name.is_empty() {
            return Err(DashverifyError::manifest(
                "database_name must list at least one database",
            ));
        }
        for name in &self.database_name {
            if name.trim().is_empty() {
                return Err(DashverifyError::manifest("database names cannot be empty"));
            }
            if name.contains(['\'', '"']) {
                return Err(DashverifyError::manifest(format!(
                    "database name {:?} cannot contain quotes",
                    name
                )));
            }
        }

        const TYPED: [&str; 5] = [
            "grafana_http_port",
            "influxdb_database_name",
            "configure_telegraf",
            "enable_telegraf",
            "add_dashboard_examples",
        ];
        for key in self.extra.keys() {
            if !is_parameter_name(key) {
                return Err(DashverifyError::manifest(format!(
                    "invalid parameter name {:?}",
                    key
                )));
            }
            if TYPED.contains(&key.as_str()) {
                return Err(DashverifyError::manifest(format!(
                    "parameter {} is set by a typed option, remove it from extra",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Render the class declaration.
    pub fn render(&self, class_name: &str) -> String {
        let mut out = format!("class {{ {}:\n", quote(class_name));
        for (name, value) in self.parameters() {
            out.push_str(&format!("  {} => {},\n", name, value));
        }
        out.push_str("}\n");
        out
    }
}
