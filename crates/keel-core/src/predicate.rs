//! # Query Predicates
//!
//! Conditions over a record's top-level fields, used for conditional
//! save/delete and for filtered queries.
//!
//! ```rust
//! use keel_core::{QueryPredicate, Record};
//! use serde_json::json;
//!
//! let record = Record::new("Note", "A", json!({"rating": 4, "title": "Draft"}));
//! let predicate = QueryPredicate::gt("rating", 3).and(QueryPredicate::begins_with("title", "Dr"));
//! assert!(predicate.matches(&record));
//! ```
//!
//! ## Comparison Rules
//! - numbers compare numerically (`1` equals `1.0`)
//! - strings compare lexicographically
//! - booleans compare `false < true`
//! - values of different types never match an ordering operator
//! - a missing field only matches `Ne` and `Not { .. }`

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Record;

/// A condition evaluated against one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryPredicate {
    /// Matches every record.
    All,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Ge { field: String, value: Value },
    Lt { field: String, value: Value },
    Le { field: String, value: Value },
    /// Inclusive range.
    Between { field: String, low: Value, high: Value },
    /// Substring for strings, membership for arrays.
    Contains { field: String, value: Value },
    BeginsWith { field: String, prefix: String },
    And { predicates: Vec<QueryPredicate> },
    Or { predicates: Vec<QueryPredicate> },
    Not { predicate: Box<QueryPredicate> },
}

impl QueryPredicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Le {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn between(
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        QueryPredicate::Between {
            field: field.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryPredicate::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn begins_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        QueryPredicate::BeginsWith {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    /// Combines with another predicate; flattens nested `And`s.
    pub fn and(self, other: QueryPredicate) -> Self {
        match self {
            QueryPredicate::And { mut predicates } => {
                predicates.push(other);
                QueryPredicate::And { predicates }
            }
            first => QueryPredicate::And {
                predicates: vec![first, other],
            },
        }
    }

    /// Alternative to another predicate; flattens nested `Or`s.
    pub fn or(self, other: QueryPredicate) -> Self {
        match self {
            QueryPredicate::Or { mut predicates } => {
                predicates.push(other);
                QueryPredicate::Or { predicates }
            }
            first => QueryPredicate::Or {
                predicates: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        QueryPredicate::Not {
            predicate: Box::new(self),
        }
    }

    /// Evaluates the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            QueryPredicate::All => true,
            QueryPredicate::Eq { field, value } => record
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            QueryPredicate::Ne { field, value } => !record
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            QueryPredicate::Gt { field, value } => {
                ordering(record, field, value).is_some_and(|o| o == Ordering::Greater)
            }
            QueryPredicate::Ge { field, value } => {
                ordering(record, field, value).is_some_and(|o| o != Ordering::Less)
            }
            QueryPredicate::Lt { field, value } => {
                ordering(record, field, value).is_some_and(|o| o == Ordering::Less)
            }
            QueryPredicate::Le { field, value } => {
                ordering(record, field, value).is_some_and(|o| o != Ordering::Greater)
            }
            QueryPredicate::Between { field, low, high } => {
                ordering(record, field, low).is_some_and(|o| o != Ordering::Less)
                    && ordering(record, field, high).is_some_and(|o| o != Ordering::Greater)
            }
            QueryPredicate::Contains { field, value } => match record.field(field) {
                Some(Value::String(text)) => value.as_str().is_some_and(|s| text.contains(s)),
                Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, value)),
                _ => false,
            },
            QueryPredicate::BeginsWith { field, prefix } => match record.field(field) {
                Some(Value::String(text)) => text.starts_with(prefix.as_str()),
                _ => false,
            },
            QueryPredicate::And { predicates } => predicates.iter().all(|p| p.matches(record)),
            QueryPredicate::Or { predicates } => predicates.iter().any(|p| p.matches(record)),
            QueryPredicate::Not { predicate } => !predicate.matches(record),
        }
    }
}

impl Default for QueryPredicate {
    fn default() -> Self {
        QueryPredicate::All
    }
}

fn ordering(record: &Record, field: &str, expected: &Value) -> Option<Ordering> {
    let actual = record.field(field)?;
    compare_values(&actual, expected)
}

/// Equality with numeric normalisation.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering between two values of the same kind; `None` across kinds.
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note() -> Record {
        Record::new(
            "Note",
            "A",
            json!({"body": "hello world", "rating": 4, "tags": ["x", "y"], "pinned": false}),
        )
    }

    #[test]
    fn test_equality() {
        assert!(QueryPredicate::eq("rating", 4).matches(&note()));
        assert!(QueryPredicate::eq("rating", 4.0).matches(&note()));
        assert!(QueryPredicate::eq("id", "A").matches(&note()));
        assert!(!QueryPredicate::eq("rating", "4").matches(&note()));
        assert!(QueryPredicate::ne("rating", 5).matches(&note()));
        assert!(QueryPredicate::ne("missing", 5).matches(&note()));
    }

    #[test]
    fn test_ordering_operators() {
        assert!(QueryPredicate::gt("rating", 3).matches(&note()));
        assert!(QueryPredicate::ge("rating", 4).matches(&note()));
        assert!(!QueryPredicate::lt("rating", 4).matches(&note()));
        assert!(QueryPredicate::le("body", "hello x").matches(&note()));
        assert!(QueryPredicate::between("rating", 1, 4).matches(&note()));
        assert!(!QueryPredicate::between("rating", 5, 9).matches(&note()));
    }

    #[test]
    fn test_type_mismatch_never_orders() {
        assert!(!QueryPredicate::gt("body", 1).matches(&note()));
        assert!(!QueryPredicate::le("body", 1).matches(&note()));
        assert!(!QueryPredicate::gt("missing", 1).matches(&note()));
    }

    #[test]
    fn test_contains_and_prefix() {
        assert!(QueryPredicate::contains("body", "world").matches(&note()));
        assert!(QueryPredicate::contains("tags", "y").matches(&note()));
        assert!(!QueryPredicate::contains("tags", "z").matches(&note()));
        assert!(QueryPredicate::begins_with("body", "hell").matches(&note()));
        assert!(!QueryPredicate::begins_with("rating", "4").matches(&note()));
    }

    #[test]
    fn test_combinators() {
        let p = QueryPredicate::eq("pinned", false).and(QueryPredicate::gt("rating", 2));
        assert!(p.matches(&note()));

        let p = QueryPredicate::eq("pinned", true).or(QueryPredicate::eq("rating", 4));
        assert!(p.matches(&note()));

        assert!(!QueryPredicate::All.negate().matches(&note()));

        let chained = QueryPredicate::All
            .and(QueryPredicate::All)
            .and(QueryPredicate::All);
        assert!(matches!(chained, QueryPredicate::And { ref predicates } if predicates.len() == 3));
    }

    #[test]
    fn test_serde_shape() {
        let p = QueryPredicate::eq("body", "x");
        let text = serde_json::to_value(&p).unwrap();
        assert_eq!(text["op"], "eq");
        assert_eq!(text["field"], "body");

        let nested = QueryPredicate::eq("a", 1).or(QueryPredicate::All).negate();
        let text = serde_json::to_string(&nested).unwrap();
        let back: QueryPredicate = serde_json::from_str(&text).unwrap();
        assert_eq!(back, nested);
    }
}
