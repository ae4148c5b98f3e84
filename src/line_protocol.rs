//! InfluxDB line protocol serialization for the write probe.
//!
//! `measurement[,tag=value...] field=value[,field=value...] timestamp`

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DashverifyError, Result};

/// Measurement written by the default sample point
pub const SAMPLE_MEASUREMENT: &str = "puppetserver.jruby-metrics.num-free-jrubies";

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}i", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "\"{}\"", escape_string_field(v)),
        }
    }
}

fn escape_with(s: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
const KEY_SPECIALS: &[char] = &[',', '=', ' '];

/// Escape a measurement name (commas and spaces).
pub fn escape_measurement(s: &str) -> String {
    escape_with(s, MEASUREMENT_SPECIALS)
}

/// Escape a tag key, tag value or field key (commas, equals signs, spaces).
pub fn escape_key(s: &str) -> String {
    escape_with(s, KEY_SPECIALS)
}

/// Escape the contents of a string field value (double quotes, backslashes).
pub fn escape_string_field(s: &str) -> String {
    escape_with(s, &['"', '\\'])
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One timestamped point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: Option<i64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: None,
        }
    }

    /// The point the write and query probes use.
    pub fn sample(timestamp: i64) -> Self {
        Self::new(SAMPLE_MEASUREMENT)
            .tag("server", "127-0-0-1")
            .field("num-free-jrubies", FieldValue::Float(1.0))
            .timestamp(timestamp)
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    /// Timestamp in the precision the write request declares.
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Reject points whose rendering would not parse back as one line.
    pub fn validate(&self) -> Result<()> {
        check_text("measurement", &self.measurement, MEASUREMENT_SPECIALS)?;
        if self.fields.is_empty() {
            return Err(DashverifyError::line_protocol(format!(
                "point {} needs at least one field",
                self.measurement
            )));
        }
        for (key, value) in &self.tags {
            check_text("tag key", key, KEY_SPECIALS)?;
            check_text("tag value", value, KEY_SPECIALS)?;
        }
        for (key, value) in &self.fields {
            check_text("field key", key, KEY_SPECIALS)?;
            match value {
                FieldValue::Float(v) if !v.is_finite() => {
                    return Err(DashverifyError::line_protocol(format!(
                        "field {} is not a finite number",
                        key
                    )));
                }
                FieldValue::Str(v) if v.contains(['\n', '\r']) => {
                    return Err(DashverifyError::line_protocol(format!(
                        "field {} contains a line break",
                        key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Non-empty, single-line, and no backslash that would escape a delimiter
/// (or the separator after the text) once rendered.
fn check_text(what: &str, s: &str, specials: &[char]) -> Result<()> {
    if s.is_empty() {
        return Err(DashverifyError::line_protocol(format!("{} cannot be empty", what)));
    }
    if s.contains(['\n', '\r']) {
        return Err(DashverifyError::line_protocol(format!(
            "{} {:?} contains a line break",
            what, s
        )));
    }
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().is_none_or(|next| specials.contains(next)) {
            return Err(DashverifyError::line_protocol(format!(
                "{} {:?} has a backslash before a delimiter or at its end",
                what, s
            )));
        }
    }
    Ok(())
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escape_measurement(&self.measurement))?;
        for (key, value) in &self.tags {
            write!(f, ",{}={}", escape_key(key), escape_key(value))?;
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ' ' } else { ',' };
            write!(f, "{}{}={}", sep, escape_key(key), value)?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " {}", ts)?;
        }
        Ok(())
    }
}
