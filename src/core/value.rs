//! Typed small values carried on the artifact/parameter channel

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A small, structured value produced by a node (a metric, a path, a flag).
///
/// Bulk data never travels through these; it moves through the shared
/// workspace volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    /// Boolean flag
    Bool(bool),
    /// Integer metric or count
    Integer(i64),
    /// Floating-point metric
    Float(f64),
    /// Short string (a path, a tag, a model reference)
    String(String),
}

impl OutputValue {
    /// Parse a value from its textual form, preferring the narrowest type.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(b) = trimmed.parse::<bool>() {
            return OutputValue::Bool(b);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return OutputValue::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return OutputValue::Float(f);
        }
        OutputValue::String(trimmed.to_string())
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OutputValue::Integer(i) => Some(*i as f64),
            OutputValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Compare two values for guard evaluation.
    ///
    /// Integers and floats compare numerically across variants; strings
    /// compare lexicographically; booleans only support equality ordering.
    /// Mixed, incomparable types yield `None`.
    pub fn compare(&self, other: &OutputValue) -> Option<Ordering> {
        match (self, other) {
            (OutputValue::String(a), OutputValue::String(b)) => Some(a.cmp(b)),
            (OutputValue::Bool(a), OutputValue::Bool(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Bool(b) => write!(f, "{}", b),
            OutputValue::Integer(i) => write!(f, "{}", i),
            OutputValue::Float(x) => write!(f, "{}", x),
            OutputValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for OutputValue {
    fn from(s: &str) -> Self {
        OutputValue::String(s.to_string())
    }
}

impl From<String> for OutputValue {
    fn from(s: String) -> Self {
        OutputValue::String(s)
    }
}

impl From<i64> for OutputValue {
    fn from(i: i64) -> Self {
        OutputValue::Integer(i)
    }
}

impl From<f64> for OutputValue {
    fn from(f: f64) -> Self {
        OutputValue::Float(f)
    }
}

impl From<bool> for OutputValue {
    fn from(b: bool) -> Self {
        OutputValue::Bool(b)
    }
}
