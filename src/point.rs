//! Time-series points.
//!
//! A [`Point`] is one line of InfluxDB line protocol: a measurement name, a
//! set of string tags, a set of typed fields and an optional timestamp.
//!
//! ```text
//! heat_pump,operating_state=DHW flow_temp=35.2,error_number=0i 1700000000000000000
//! ```

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Value of a field after its transform has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Scaled fixed-point or floating point reading
    Float(f64),
    /// Integer reading
    Int(i64),
    /// Enumeration label
    Text(String),
}

impl FieldValue {
    /// Numeric view, `None` for text values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Text(_) => None,
        }
    }

    /// Whether the value is a number.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldValue::Text(_))
    }

    /// Value equality as used by change detection.
    ///
    /// Numbers compare by value regardless of representation (`Int(2)`
    /// equals `Float(2.0)`); text never equals a number.
    pub fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    fn write_line_protocol(&self, out: &mut String) {
        match self {
            FieldValue::Float(v) => out.push_str(&v.to_string()),
            FieldValue::Int(v) => {
                out.push_str(&v.to_string());
                out.push('i');
            }
            FieldValue::Text(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }

    fn is_writable(&self) -> bool {
        match self {
            FieldValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// A named measurement with tags, fields and an optional timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<DateTime<Utc>>,
}

impl Point {
    /// Start an empty point for `measurement`.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Attach a tag, replacing any previous value for `key`.
    pub fn tag(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Attach a field, replacing any previous value for `key`.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the point timestamp. Without one the server assigns its receive time.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// All tags, ordered by key.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// All fields, ordered by key.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Tag value for `key`.
    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Field value for `key`.
    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Timestamp, if one was set.
    pub fn get_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Serialize to one line of InfluxDB line protocol.
    ///
    /// Returns an empty string when the point has no writable field, since a
    /// line without fields is not valid line protocol. Non-finite floats are
    /// not writable.
    pub fn to_line_protocol(&self) -> String {
        let writable: Vec<_> = self
            .fields
            .iter()
            .filter(|(_, value)| value.is_writable())
            .collect();
        if writable.is_empty() {
            return String::new();
        }

        let mut line = String::with_capacity(64);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        line.push(' ');
        for (i, (key, value)) in writable.into_iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            value.write_line_protocol(&mut line);
        }

        if let Some(nanos) = self.timestamp.and_then(|ts| ts.timestamp_nanos_opt()) {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }

        line
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_protocol())
    }
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
