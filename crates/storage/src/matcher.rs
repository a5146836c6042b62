//! Query matching for the memory driver
//!
//! Queries are flat objects keyed by dot paths. Each value is either a literal
//! (equality) or an operator object whose keys all start with `$`.
//!
//! | Form | Matches when |
//! |------|--------------|
//! | `{"a.b": v}` | some value at `a.b` equals `v`, or is an array containing `v` |
//! | `{"a": {"$in": [..]}}` | some value at `a` equals one of the listed values |
//! | `{"a": {"$ne": v}}` | no value at `a` equals `v` |
//! | `{"a": {"$exists": true}}` | the path resolves to at least one value |
//!
//! Path resolution fans out through arrays: `friends._id` visits the `_id`
//! of every element of `friends`, which is how multi-link back-link queries
//! match. A numeric segment on an array selects that index instead.

use serde_json::Value;
use trellis_core::{Error, JsonValue, Result};

/// A parsed, validated query
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    path: Vec<String>,
    condition: Condition,
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Ne(Value),
    Exists(bool),
}

impl Query {
    /// Parse a query object
    ///
    /// `null` and `{}` match every record. Unknown operators are rejected.
    pub fn parse(query: &JsonValue) -> Result<Self> {
        let obj = match query.as_inner() {
            Value::Null => return Ok(Self { clauses: vec![] }),
            Value::Object(obj) => obj,
            other => {
                return Err(Error::bad_request(format!(
                    "query must be an object, got {}",
                    trellis_core::json::value_type_name(other)
                )))
            }
        };

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            if key.is_empty() {
                return Err(Error::bad_request("query key must not be empty"));
            }
            let path: Vec<String> = key.split('.').map(str::to_string).collect();
            for condition in parse_conditions(key, value)? {
                clauses.push(Clause {
                    path: path.clone(),
                    condition,
                });
            }
        }
        Ok(Self { clauses })
    }

    /// Whether the query matches every record
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Test a record against every clause
    pub fn matches(&self, record: &JsonValue) -> bool {
        self.clauses.iter().all(|clause| {
            let mut found = Vec::new();
            resolve(record.as_inner(), &clause.path, &mut found);
            clause.condition.test(&found)
        })
    }
}

fn parse_conditions(key: &str, value: &Value) -> Result<Vec<Condition>> {
    let operators = match value {
        Value::Object(obj) if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) => obj,
        other => return Ok(vec![Condition::Eq(other.clone())]),
    };

    operators
        .iter()
        .map(|(op, arg)| match (op.as_str(), arg) {
            ("$in", Value::Array(items)) => Ok(Condition::In(items.clone())),
            ("$in", _) => Err(Error::bad_request(format!(
                "$in on '{}' expects an array",
                key
            ))),
            ("$ne", v) => Ok(Condition::Ne(v.clone())),
            ("$exists", Value::Bool(b)) => Ok(Condition::Exists(*b)),
            ("$exists", _) => Err(Error::bad_request(format!(
                "$exists on '{}' expects a boolean",
                key
            ))),
            (other, _) => Err(Error::bad_request(format!(
                "unsupported query operator '{}' on '{}'",
                other, key
            ))),
        })
        .collect()
}

impl Condition {
    fn test(&self, found: &[&Value]) -> bool {
        match self {
            Condition::Eq(expected) => found.iter().any(|v| value_matches(v, expected)),
            Condition::In(options) => found
                .iter()
                .any(|v| options.iter().any(|o| value_matches(v, o))),
            Condition::Ne(unexpected) => !found.iter().any(|v| value_matches(v, unexpected)),
            Condition::Exists(expected) => !found.is_empty() == *expected,
        }
    }
}

/// Equality, also accepting an array that contains the expected scalar
fn value_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match actual {
        Value::Array(items) if !expected.is_array() => items.iter().any(|i| i == expected),
        _ => false,
    }
}

fn resolve<'a>(value: &'a Value, path: &[String], out: &mut Vec<&'a Value>) {
    let Some((head, tail)) = path.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(obj) => {
            if let Some(child) = obj.get(head) {
                resolve(child, tail, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(idx) => {
                if let Some(child) = items.get(idx) {
                    resolve(child, tail, out);
                }
            }
            Err(_) => {
                for item in items {
                    resolve(item, path, out);
                }
            }
        },
        _ => {}
    }
}
