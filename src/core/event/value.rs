// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Dynamically typed cache value.
///
/// `Object` models struct-like entries (a portfolio, a position) so that
/// continuous query predicates can address individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum AttributeValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    #[default]
    Null,
    Object(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Build an object value from field/value pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AttributeValue)>,
    {
        AttributeValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Numeric view used for cross-type comparison.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Long(l) => Some(*l as f64),
            AttributeValue::Float(f) => Some(*f as f64),
            AttributeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Resolve a dotted field path (`"position.secId"`). An empty path is the
    /// value itself.
    pub fn field(&self, path: &str) -> Option<&AttributeValue> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for part in path.split('.') {
            match current {
                AttributeValue::Object(fields) => current = fields.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Ordering between comparable values. Numbers compare across widths,
    /// strings and bools compare within their own type, everything else is
    /// incomparable.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => Some(a.cmp(b)),
            (AttributeValue::Bool(a), AttributeValue::Bool(b)) => Some(a.cmp(b)),
            (AttributeValue::Int(a), AttributeValue::Int(b)) => Some(a.cmp(b)),
            (AttributeValue::Long(a), AttributeValue::Long(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "string",
            AttributeValue::Int(_) => "int",
            AttributeValue::Long(_) => "long",
            AttributeValue::Float(_) => "float",
            AttributeValue::Double(_) => "double",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Null => "null",
            AttributeValue::Object(_) => "object",
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{s}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Long(l) => write!(f, "{l}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Null => write!(f, "null"),
            AttributeValue::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Long(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_width_numeric_compare() {
        assert_eq!(
            AttributeValue::Int(10).compare(&AttributeValue::Double(10.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            AttributeValue::Long(3).compare(&AttributeValue::Int(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            AttributeValue::String("a".into()).compare(&AttributeValue::Int(1)),
            None
        );
    }

    #[test]
    fn test_nested_field_lookup() {
        let position = AttributeValue::object([("secId", AttributeValue::from("SUN"))]);
        let portfolio = AttributeValue::object([
            ("ID", AttributeValue::Int(2)),
            ("position", position),
        ]);
        assert_eq!(portfolio.field("ID"), Some(&AttributeValue::Int(2)));
        assert_eq!(
            portfolio.field("position.secId"),
            Some(&AttributeValue::from("SUN"))
        );
        assert_eq!(portfolio.field("position.missing"), None);
        assert_eq!(AttributeValue::Int(1).field("ID"), None);
        assert_eq!(AttributeValue::Int(1).field(""), Some(&AttributeValue::Int(1)));
    }
}
