// SPDX-License-Identifier: MIT OR Apache-2.0

//! Continuous query predicates.
//!
//! A [`Condition`] is a serializable predicate tree built programmatically
//! (`Condition::gt("value", 10i32)`); durable queries must use one so they can
//! be written to a session record. Arbitrary closures are accepted through
//! [`predicate_fn`] for non-persisted queries.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::event::AttributeValue;

/// Outcome of evaluating a predicate against one entry. `Err` is an
/// evaluation fault, distinct from "does not match".
pub type PredicateResult = Result<bool, String>;

/// Membership test of a continuous query.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, key: &str, value: &AttributeValue) -> PredicateResult;

    /// The serializable form of this predicate, if it has one.
    fn as_condition(&self) -> Option<&Condition> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Serializable predicate tree.
///
/// Field paths are dotted (`"position.mktValue"`); the empty path addresses
/// the entry value itself. A comparison on a missing or null field is false,
/// while a comparison between incompatible types is a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    True,
    Compare {
        field: String,
        op: CompareOp,
        value: AttributeValue,
    },
    IsNull {
        field: String,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<AttributeValue>) -> Self {
        Condition::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Condition::IsNull {
            field: field.into(),
        }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::And(mut parts) => {
                parts.push(other);
                Condition::And(parts)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut parts) => {
                parts.push(other);
                Condition::Or(parts)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Evaluate against a value. Short-circuits like the boolean operators.
    pub fn matches(&self, value: &AttributeValue) -> PredicateResult {
        match self {
            Condition::True => Ok(true),
            Condition::Compare {
                field,
                op,
                value: constant,
            } => {
                let actual = match value.field(field) {
                    Some(v) if !v.is_null() => v,
                    _ => return Ok(false),
                };
                if let Some(ordering) = actual.compare(constant) {
                    return Ok(op.holds(ordering));
                }
                match op {
                    CompareOp::Eq | CompareOp::Ne if actual.type_name() == constant.type_name() => {
                        Ok((actual == constant) == (*op == CompareOp::Eq))
                    }
                    _ => Err(format!(
                        "cannot compare {} field '{}' with {} {}",
                        actual.type_name(),
                        display_path(field),
                        constant.type_name(),
                        op.symbol()
                    )),
                }
            }
            Condition::IsNull { field } => Ok(value.field(field).map_or(true, |v| v.is_null())),
            Condition::And(parts) => {
                for part in parts {
                    if !part.matches(value)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(parts) => {
                for part in parts {
                    if part.matches(value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => inner.matches(value).map(|m| !m),
        }
    }
}

fn display_path(field: &str) -> &str {
    if field.is_empty() {
        "<value>"
    } else {
        field
    }
}

impl Predicate for Condition {
    fn evaluate(&self, _key: &str, value: &AttributeValue) -> PredicateResult {
        self.matches(value)
    }

    fn as_condition(&self) -> Option<&Condition> {
        Some(self)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::True => f.write_str("true"),
            Condition::Compare { field, op, value } => match value {
                AttributeValue::String(s) => {
                    write!(f, "{} {} '{}'", display_path(field), op.symbol(), s)
                }
                other => write!(f, "{} {} {}", display_path(field), op.symbol(), other),
            },
            Condition::IsNull { field } => write!(f, "{} IS NULL", display_path(field)),
            Condition::And(parts) => write_joined(f, parts, " AND "),
            Condition::Or(parts) => write_joined(f, parts, " OR "),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{part}")?;
    }
    f.write_str(")")
}

/// Adapts a closure into a [`Predicate`].
pub struct FnPredicate<F>
where
    F: Fn(&str, &AttributeValue) -> PredicateResult + Send + Sync,
{
    predicate: F,
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&str, &AttributeValue) -> PredicateResult + Send + Sync,
{
    fn evaluate(&self, key: &str, value: &AttributeValue) -> PredicateResult {
        (self.predicate)(key, value)
    }
}

pub fn predicate_fn<F>(predicate: F) -> Arc<dyn Predicate>
where
    F: Fn(&str, &AttributeValue) -> PredicateResult + Send + Sync + 'static,
{
    Arc::new(FnPredicate { predicate })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(qty: i64, sec: &str) -> AttributeValue {
        AttributeValue::object([
            ("qty", AttributeValue::Long(qty)),
            ("secId", AttributeValue::from(sec)),
        ])
    }

    #[test]
    fn test_compare_on_value_itself() {
        let cond = Condition::gt("", 10i32);
        assert_eq!(cond.matches(&AttributeValue::Int(15)), Ok(true));
        assert_eq!(cond.matches(&AttributeValue::Int(5)), Ok(false));
        assert_eq!(cond.matches(&AttributeValue::Double(10.5)), Ok(true));
    }

    #[test]
    fn test_compare_on_field_path() {
        let cond = Condition::ge("qty", 100i64).and(Condition::eq("secId", "IBM"));
        assert_eq!(cond.matches(&position(150, "IBM")), Ok(true));
        assert_eq!(cond.matches(&position(150, "SUN")), Ok(false));
        assert_eq!(cond.matches(&position(10, "IBM")), Ok(false));
    }

    #[test]
    fn test_missing_field_is_false_not_fault() {
        let cond = Condition::gt("price", 1i32);
        assert_eq!(cond.matches(&position(1, "IBM")), Ok(false));
        assert_eq!(Condition::is_null("price").matches(&position(1, "IBM")), Ok(true));
    }

    #[test]
    fn test_type_mismatch_is_fault() {
        let cond = Condition::gt("secId", 10i32);
        let err = cond.matches(&position(1, "IBM")).unwrap_err();
        assert!(err.contains("cannot compare string field 'secId'"));
    }

    #[test]
    fn test_or_short_circuits_before_fault() {
        let cond = Condition::True.or(Condition::gt("secId", 10i32));
        assert_eq!(cond.matches(&position(1, "IBM")), Ok(true));
    }

    #[test]
    fn test_not_and_display() {
        let cond = Condition::gt("", 10i32).and(Condition::ne("status", "inactive")).not();
        assert_eq!(cond.to_string(), "NOT ((<value> > 10 AND status <> 'inactive'))");
    }

    #[test]
    fn test_condition_serde_roundtrip() {
        let cond = Condition::lt("qty", 5i64).or(Condition::is_null("secId"));
        let bytes = bincode::serialize(&cond).unwrap();
        let back: Condition = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, cond);
        assert!(back.as_condition().is_some());
    }

    #[test]
    fn test_closure_predicate() {
        let predicate = predicate_fn(|key, _| Ok(key.starts_with("hot-")));
        assert_eq!(predicate.evaluate("hot-1", &AttributeValue::Null), Ok(true));
        assert!(predicate.as_condition().is_none());
    }
}
