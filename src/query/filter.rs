//! Filter predicate tree and evaluator
//!
//! A filter is a pure predicate over a document. Trees are built either
//! through the typed constructors (`Filter::eq`, `Filter::and`, ...) or by
//! parsing the operator-map form where object values with `$`-prefixed keys
//! are operator maps and anything else is structural equality.

use std::cmp::Ordering;

use regex::Regex;

use crate::error::{EddyError, Result};
use crate::types::{compare_values, Document, Value};

/// Atomic comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Predicate tree over documents
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Cmp {
        path: String,
        op: CompareOp,
        value: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
    },
    Nin {
        path: String,
        values: Vec<Value>,
    },
    Exists {
        path: String,
        exists: bool,
    },
    Regex {
        path: String,
        regex: Regex,
    },
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Ne,
            value: value.into(),
        }
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Gt,
            value: value.into(),
        }
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Gte,
            value: value.into(),
        }
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Lt,
            value: value.into(),
        }
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            path: path.into(),
            op: CompareOp::Lte,
            value: value.into(),
        }
    }

    pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            path: path.into(),
            values,
        }
    }

    pub fn not_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::Nin {
            path: path.into(),
            values,
        }
    }

    pub fn exists(path: impl Into<String>, exists: bool) -> Self {
        Filter::Exists {
            path: path.into(),
            exists,
        }
    }

    pub fn regex(path: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| EddyError::InvalidArgument(format!("bad regex pattern: {e}")))?;
        Ok(Filter::Regex {
            path: path.into(),
            regex,
        })
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Parse the operator-map form.
    ///
    /// `{ "status": "active", "score": { "$gte": 80 }, "$or": [...] }`
    pub fn parse(value: &Value) -> Result<Filter> {
        let map = match value {
            Value::Object(map) => map,
            _ => {
                return Err(EddyError::InvalidArgument(
                    "filter must be an object".to_string(),
                ))
            }
        };
        if map.is_empty() {
            return Ok(Filter::All);
        }

        let mut clauses = Vec::with_capacity(map.len());
        for (key, v) in map {
            match key.as_str() {
                "$and" => clauses.push(Filter::And(Self::parse_list(v)?)),
                "$or" => clauses.push(Filter::Or(Self::parse_list(v)?)),
                "$not" => clauses.push(Filter::not(Self::parse(v)?)),
                k if k.starts_with('$') => {
                    return Err(EddyError::InvalidArgument(format!(
                        "unknown logical operator: {k}"
                    )))
                }
                path => clauses.push(Self::parse_field(path, v)?),
            }
        }
        Ok(if clauses.len() == 1 {
            clauses.pop().unwrap()
        } else {
            Filter::And(clauses)
        })
    }

    fn parse_list(value: &Value) -> Result<Vec<Filter>> {
        let list = value.as_array().ok_or_else(|| {
            EddyError::InvalidArgument("logical operator expects an array".to_string())
        })?;
        list.iter().map(Self::parse).collect()
    }

    fn parse_field(path: &str, value: &Value) -> Result<Filter> {
        // An object with at least one $-prefixed key is an operator map;
        // any other value is structural equality.
        let ops = match value {
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
            other => return Ok(Filter::eq(path, other.clone())),
        };

        let mut clauses = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let filter = match op.as_str() {
                "$eq" => Filter::eq(path, operand.clone()),
                "$ne" => Filter::ne(path, operand.clone()),
                "$gt" => Filter::gt(path, operand.clone()),
                "$gte" => Filter::gte(path, operand.clone()),
                "$lt" => Filter::lt(path, operand.clone()),
                "$lte" => Filter::lte(path, operand.clone()),
                "$in" => Filter::is_in(path, Self::operand_list(operand)?),
                "$nin" => Filter::not_in(path, Self::operand_list(operand)?),
                "$exists" => Filter::exists(
                    path,
                    operand.as_bool().ok_or_else(|| {
                        EddyError::InvalidArgument("$exists expects a boolean".to_string())
                    })?,
                ),
                "$regex" => {
                    let pattern = operand.as_str().ok_or_else(|| {
                        EddyError::InvalidArgument("$regex expects a pattern string".to_string())
                    })?;
                    Filter::regex(path, pattern)?
                }
                other => {
                    return Err(EddyError::InvalidArgument(format!(
                        "unknown operator: {other}"
                    )))
                }
            };
            clauses.push(filter);
        }
        Ok(if clauses.len() == 1 {
            clauses.pop().unwrap()
        } else {
            Filter::And(clauses)
        })
    }

    fn operand_list(value: &Value) -> Result<Vec<Value>> {
        value
            .as_array()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| EddyError::InvalidArgument("$in/$nin expect an array".to_string()))
    }

    /// Evaluate against a document
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(filter) => !filter.matches(doc),
            Filter::Cmp { path, op, value } => compare_field(doc.field(path), *op, value),
            Filter::In { path, values } => doc
                .field(path)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Filter::Nin { path, values } => doc
                .field(path)
                .map(|v| !values.contains(v))
                .unwrap_or(true),
            Filter::Exists { path, exists } => doc.field(path).is_some() == *exists,
            Filter::Regex { path, regex } => match doc.field(path) {
                // Regex matches only string-typed values.
                Some(Value::String(s)) => regex.is_match(s),
                _ => false,
            },
        }
    }
}

/// Compare one field against an operand.
///
/// Equality is structural; ordering comparisons are false across types
/// and false against a missing field.
fn compare_field(field: Option<&Value>, op: CompareOp, operand: &Value) -> bool {
    match op {
        CompareOp::Eq => field.map(|v| values_equal(v, operand)).unwrap_or(false),
        CompareOp::Ne => !field.map(|v| values_equal(v, operand)).unwrap_or(false),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let field = match field {
                Some(v) if !v.is_null() => v,
                _ => return false,
            };
            if !comparable(field, operand) {
                return false;
            }
            let ord = compare_values(Some(field), Some(operand));
            match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Gte => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Lte => ord != Ordering::Greater,
                _ => unreachable!(),
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    // Numeric equality crosses Int/Float; everything else is structural.
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc(fields: &[(&str, Value)]) -> Document {
        Document::with_id(
            "d1",
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn structural_equality_and_operator_maps() {
        let d = doc(&[("status", Value::from("active")), ("score", Value::from(90))]);

        let mut raw = HashMap::new();
        raw.insert("status".to_string(), Value::from("active"));
        let mut ops = HashMap::new();
        ops.insert("$gte".to_string(), Value::from(80));
        raw.insert("score".to_string(), Value::Object(ops));

        let filter = Filter::parse(&Value::Object(raw)).unwrap();
        assert!(filter.matches(&d));
        assert!(!filter.matches(&doc(&[("status", Value::from("active"))])));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = Filter::parse(&Value::Object(HashMap::new())).unwrap();
        assert!(filter.matches(&doc(&[])));
    }

    #[test]
    fn cross_type_ordering_is_false() {
        let d = doc(&[("score", Value::from("90"))]);
        assert!(!Filter::gt("score", 10).matches(&d));
        assert!(!Filter::lt("score", 10).matches(&d));
        assert!(!Filter::eq("score", 90).matches(&d));
    }

    #[test]
    fn exists_false_matches_missing() {
        let d = doc(&[("a", Value::from(1))]);
        assert!(Filter::exists("b", false).matches(&d));
        assert!(Filter::exists("a", true).matches(&d));
        assert!(!Filter::exists("a", false).matches(&d));
    }

    #[test]
    fn regex_matches_only_strings() {
        let d = doc(&[("name", Value::from("Brian")), ("n", Value::from(42))]);
        assert!(Filter::regex("name", "^Br").unwrap().matches(&d));
        assert!(!Filter::regex("n", "^4").unwrap().matches(&d));
    }

    #[test]
    fn nin_on_missing_field_matches() {
        let d = doc(&[]);
        assert!(Filter::not_in("tag", vec![Value::from("x")]).matches(&d));
        assert!(!Filter::is_in("tag", vec![Value::from("x")]).matches(&d));
    }

    #[test]
    fn logical_combinators() {
        let d = doc(&[("a", Value::from(1)), ("b", Value::from(2))]);
        assert!(Filter::and(vec![Filter::eq("a", 1), Filter::eq("b", 2)]).matches(&d));
        assert!(Filter::or(vec![Filter::eq("a", 9), Filter::eq("b", 2)]).matches(&d));
        assert!(Filter::not(Filter::eq("a", 9)).matches(&d));
    }
}
