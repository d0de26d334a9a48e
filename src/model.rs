//! Shared scalar value type and row-record shape used across the pipeline.
//!
//! `Value` is deliberately not `Option<f64>` or `Option<String>` — a single
//! value flows through scan trees, function chains, and the RPN evaluator,
//! sometimes as a number, sometimes as a string (e.g. an interface name),
//! and `Undefined` has to propagate the same way through all of them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar value as it flows through scans, values, and functions.
///
/// `Undefined` is a first-class member, not an `Option<Value>` wrapper,
/// because most of the function table and the whole RPN evaluator treat it
/// as a value that participates in (and usually contaminates) operations
/// rather than a missing-slot marker to be matched away early.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    #[serde(serialize_with = "serialize_undefined")]
    Undefined,
}

fn serialize_undefined<S: serde::Serializer>(s: S) -> Result<S::Ok, S::Error> {
    s.serialize_none()
}

impl Value {
    pub fn is_defined(&self) -> bool {
        !matches!(self, Value::Undefined)
    }

    /// Coerce to `f64` for arithmetic. Strings that parse as numbers are
    /// accepted (scan index values and RPN `$name` lookups are often
    /// strings); anything else is undefined.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Undefined => None,
        }
    }

    /// Render as a string for string ops (`regexp`, `replace`, `concat`, …).
    /// `Undefined` has no string form; callers that need "no result" must
    /// check `is_defined()` first.
    pub fn as_str_lossy(&self) -> Option<String> {
        match self {
            Value::Number(n) => Some(format_number(*n)),
            Value::Text(s) => Some(s.clone()),
            Value::Undefined => None,
        }
    }

    /// The "nonzero, non-empty, defined" truthiness rule used by `and`/`or`/`not`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Undefined => false,
        }
    }

    pub fn from_number(n: f64) -> Value {
        Value::Number(n)
    }

    pub fn from_str(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Text(s) => write!(f, "{}", s),
            Value::Undefined => write!(f, "undefined"),
        }
    }
}

/// One row of the final output: a flat map of val-id -> scalar plus the
/// sample (or request) time, per spec.md §3 "Row record".
#[derive(Debug, Clone, Serialize)]
pub struct RowRecord {
    pub time: i64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl RowRecord {
    pub fn new(time: i64) -> Self {
        RowRecord {
            time,
            fields: BTreeMap::new(),
        }
    }
}

/// A raw `{value, time}` sample as returned by the cache service for a
/// single fully-qualified OID.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSample {
    pub value: Option<serde_json::Value>,
    pub time: Option<i64>,
}

impl CacheSample {
    pub fn value_as_value(&self) -> Value {
        match &self.value {
            None => Value::Undefined,
            Some(serde_json::Value::Number(n)) => {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
            Some(serde_json::Value::String(s)) => Value::Text(s.clone()),
            Some(other) => Value::Text(other.to_string()),
        }
    }
}

/// `{host -> {oid -> {value, time}}}`, the wire shape of `get`/`get_rate`.
pub type CacheRows = BTreeMap<String, BTreeMap<String, CacheSample>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_display_drops_trailing_zero() {
        assert_eq!(Value::Number(100.0).to_string(), "100");
        assert_eq!(Value::Number(0.5).to_string(), "0.5");
    }

    #[test]
    fn truthiness_rules() {
        assert!(Value::Number(1.0).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Text(String::new()).is_truthy());
        assert!(Value::Text("0".into()).is_truthy());
        assert!(!Value::Undefined.is_truthy());
    }

    #[test]
    fn string_coerces_to_number() {
        assert_eq!(Value::Text("42".into()).as_f64(), Some(42.0));
        assert_eq!(Value::Text("eth0".into()).as_f64(), None);
    }
}
