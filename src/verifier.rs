//! Health verification of the converged metrics stack.
//!
//! A fixed sequence of independent probes: TCP reachability of the dashboard
//! and database ports, a line-protocol write, a query for the written
//! measurement, and a dashboard data-source lookup. Every probe opens its own
//! connection and a failure never skips the probes after it.

use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config_file::VerifyConfig;
use crate::error::Result;
use crate::line_protocol::{Point, unix_now};
use crate::types::CheckKind;

/// Longest response body kept in a check result
const BODY_EXCERPT_CHARS: usize = 200;

/// One probe in the verification sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    TcpPort { service: &'static str, port: u16 },
    MetricWrite,
    MetricQuery,
    DatasourceLookup,
}

impl Check {
    pub fn kind(&self) -> CheckKind {
        match self {
            Self::TcpPort { .. } => CheckKind::TcpPort,
            Self::MetricWrite => CheckKind::MetricWrite,
            Self::MetricQuery => CheckKind::MetricQuery,
            Self::DatasourceLookup => CheckKind::DatasourceLookup,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TcpPort { service, port } => write!(f, "{} port {} is listening", service, port),
            Self::MetricWrite => write!(f, "database accepts data"),
            Self::MetricQuery => write!(f, "database answers data queries"),
            Self::DatasourceLookup => write!(f, "dashboard has a data source"),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub kind: CheckKind,
    pub passed: bool,
    /// HTTP status, for HTTP probes that got a response
    pub status: Option<u16>,
    /// What was observed, or why the check failed
    pub detail: String,
    pub body_excerpt: Option<String>,
    pub elapsed_ms: u64,
}

/// Results of one verification run, in execution order
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub results: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            let mark = if r.passed { "✓" } else { "✗" };
            writeln!(f, "{} {} ({}ms): {}", mark, r.name, r.elapsed_ms, r.detail)?;
        }
        let failed = self.failures().count();
        write!(
            f,
            "{} check(s), {} passed, {} failed",
            self.results.len(),
            self.results.len() - failed,
            failed
        )
    }
}

/// `host:port`, bracketing IPv6 literals
fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// InfluxQL selecting every series of `measurement`
pub fn select_all_query(measurement: &str) -> String {
    format!(
        "SELECT * FROM \"{}\"",
        measurement.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

/// A write succeeds with any 200-209 status
pub fn is_write_accepted(status: u16) -> bool {
    (200..=209).contains(&status)
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs the verification sequence against one host.
pub struct Verifier {
    config: VerifyConfig,
    client: Client,
    timeout: Duration,
    point: Point,
}

impl Verifier {
    pub fn new(config: &VerifyConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.probe.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("dashverify/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let point = Point::sample(config.probe.timestamp.unwrap_or_else(unix_now));
        point.validate()?;

        Ok(Self {
            config: config.clone(),
            client,
            timeout,
            point,
        })
    }

    /// The point the write probe sends and the query probe looks for.
    pub fn point(&self) -> &Point {
        &self.point
    }

    /// Probes in execution order
    pub fn checks(&self) -> Vec<Check> {
        vec![
            Check::TcpPort {
                service: "dashboard",
                port: self.config.dashboard_port(),
            },
            Check::TcpPort {
                service: "database",
                port: self.config.target.database_port,
            },
            Check::MetricWrite,
            Check::MetricQuery,
            Check::DatasourceLookup,
        ]
    }

    /// Run every probe. Failures are recorded, never short-circuited.
    pub fn run_all(&self) -> VerificationReport {
        let results = self
            .checks()
            .iter()
            .map(|check| self.run_check(check))
            .collect();
        VerificationReport { results }
    }

    pub fn run_check(&self, check: &Check) -> CheckResult {
        debug!(check = %check, "running check");
        let start = Instant::now();
        let (passed, status, detail, body) = match check {
            Check::TcpPort { port, .. } => {
                let (passed, detail) = self.probe_port(*port);
                (passed, None, detail, None)
            }
            Check::MetricWrite => self.probe_write(),
            Check::MetricQuery => self.probe_query(),
            Check::DatasourceLookup => self.probe_datasource(),
        };
        let elapsed_ms = duration_ms(start.elapsed());

        if passed {
            info!(check = %check, elapsed_ms, "check passed");
        } else {
            warn!(check = %check, reason = %detail, "check failed");
        }

        CheckResult {
            name: check.to_string(),
            kind: check.kind(),
            passed,
            status,
            detail,
            body_excerpt: body.map(|b| excerpt(&b)),
            elapsed_ms,
        }
    }

    fn probe_port(&self, port: u16) -> (bool, String) {
        let host = &self.config.target.host;
        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => return (false, format!("cannot resolve {}: {}", host, e)),
        };
        if addrs.is_empty() {
            return (false, format!("{} resolved to no addresses", host));
        }

        let mut last_error = String::new();
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(_stream) => return (true, format!("connected to {}", addr)),
                Err(e) => last_error = format!("connect to {} failed: {}", addr, e),
            }
        }
        (false, last_error)
    }

    fn database_url(&self, path: &str) -> String {
        format!(
            "http://{}{}",
            authority(&self.config.target.host, self.config.target.database_port),
            path
        )
    }

    fn probe_write(&self) -> (bool, Option<u16>, String, Option<String>) {
        let creds = &self.config.credentials;
        let line = self.point.to_string();
        let response = self
            .client
            .post(self.database_url("/write"))
            .query(&[
                ("db", self.config.database()),
                ("precision", "s"),
                ("u", creds.database_user.as_str()),
                ("p", creds.database_password.as_str()),
            ])
            .body(line)
            .send();

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                if is_write_accepted(status) {
                    (true, Some(status), format!("HTTP {}", status), Some(body))
                } else {
                    (
                        false,
                        Some(status),
                        format!("expected HTTP 200-209, got {}", status),
                        Some(body),
                    )
                }
            }
            Err(e) => (false, None, format!("write request failed: {}", e), None),
        }
    }

    fn probe_query(&self) -> (bool, Option<u16>, String, Option<String>) {
        let creds = &self.config.credentials;
        let measurement = self.point.measurement();
        let response = self
            .client
            .post(self.database_url("/query"))
            .query(&[
                ("db", self.config.database()),
                ("u", creds.database_user.as_str()),
                ("p", creds.database_password.as_str()),
            ])
            .form(&[("q", select_all_query(measurement))])
            .send();

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = match resp.text() {
                    Ok(body) => body,
                    Err(e) => {
                        return (false, Some(status), format!("unreadable body: {}", e), None);
                    }
                };
                if body.contains(measurement) {
                    (true, Some(status), format!("found {}", measurement), Some(body))
                } else {
                    (
                        false,
                        Some(status),
                        format!("response does not mention {}", measurement),
                        Some(body),
                    )
                }
            }
            Err(e) => (false, None, format!("query request failed: {}", e), None),
        }
    }

    /// Lookup URL with `name` percent-encoded as a single path segment
    pub fn datasource_url(&self, name: &str) -> Option<Url> {
        let base = format!(
            "http://{}/",
            authority(&self.config.target.host, self.config.dashboard_port())
        );
        let mut url = Url::parse(&base).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["api", "datasources", "name", name]);
        Some(url)
    }

    fn probe_datasource(&self) -> (bool, Option<u16>, String, Option<String>) {
        let creds = &self.config.credentials;
        let name = self.config.datasource_name();
        let Some(url) = self.datasource_url(&name) else {
            return (
                false,
                None,
                format!("cannot build a lookup URL for {}", self.config.target.host),
                None,
            );
        };
        let response = self
            .client
            .get(url)
            .basic_auth(&creds.dashboard_user, Some(&creds.dashboard_password))
            .send();

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = match resp.text() {
                    Ok(body) => body,
                    Err(e) => {
                        return (false, Some(status), format!("unreadable body: {}", e), None);
                    }
                };
                if body.contains(&name) {
                    (true, Some(status), format!("found data source {}", name), Some(body))
                } else {
                    (
                        false,
                        Some(status),
                        format!("data source {} not in response (HTTP {})", name, status),
                        Some(body),
                    )
                }
            }
            Err(e) => (false, None, format!("data source request failed: {}", e), None),
        }
    }
}
