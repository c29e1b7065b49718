//! Attribute resolution and operator evaluation

use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::Value;

use super::Operator;
use crate::error::EntityKind;
use crate::experiment::{Fields, Project, Status, Trial, TrialGroup};

/// Value found at the head of an attribute path
#[derive(Debug, Clone)]
pub enum Resolved<'a> {
    /// Plain JSON value
    Json(Cow<'a, Value>),
    /// Open key/value bag (parameters, metadata, tags)
    Fields(&'a Fields),
    /// Trial status, compared by name and/or value
    Status(&'a Status),
}

impl<'a> Resolved<'a> {
    fn borrowed(value: &'a Value) -> Self {
        Self::Json(Cow::Borrowed(value))
    }

    fn owned(value: impl Into<Value>) -> Self {
        Self::Json(Cow::Owned(value.into()))
    }

    fn text(value: Option<&str>) -> Self {
        Self::owned(value.map_or(Value::Null, Value::from))
    }

    fn uids<'s>(uids: impl IntoIterator<Item = &'s String>) -> Self {
        Self::owned(uids.into_iter().cloned().map(Value::from).collect::<Vec<_>>())
    }

    fn serialized<T: serde::Serialize>(value: &T) -> Self {
        Self::owned(serde_json::to_value(value).unwrap_or_default())
    }

    /// Follow the remaining path segments. `None` means a key is absent.
    #[must_use]
    pub fn descend(self, rest: &[String]) -> Option<Self> {
        let Some((key, tail)) = rest.split_first() else {
            return Some(self);
        };
        match self {
            Self::Fields(fields) => fields.get(key).and_then(|v| Self::borrowed(v).descend(tail)),
            Self::Status(status) => Self::owned(status.to_json()).descend(rest),
            Self::Json(Cow::Borrowed(value)) => {
                index(value, key).and_then(|v| Self::borrowed(v).descend(tail))
            }
            Self::Json(Cow::Owned(value)) => index(&value, key)
                .cloned()
                .and_then(|v| Self::owned(v).descend(tail)),
        }
    }
}

fn index<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// An entity the query engine can filter.
pub trait Queryable {
    /// Entity kind, used in error messages
    const KIND: EntityKind;

    /// Resolve a top-level attribute; `None` if the type has no such attribute.
    fn attribute(&self, name: &str) -> Option<Resolved<'_>>;
}

impl Queryable for Trial {
    const KIND: EntityKind = EntityKind::Trial;

    fn attribute(&self, name: &str) -> Option<Resolved<'_>> {
        Some(match name {
            "uid" | "_uid" | "id" => Resolved::owned(self.uid()),
            "hash" | "_hash" => Resolved::owned(self.hash()),
            "revision" => Resolved::owned(self.revision()),
            "name" => Resolved::text(self.name()),
            "description" => Resolved::text(self.description()),
            "version" => Resolved::text(self.version()),
            "group_id" => Resolved::text(self.group_id()),
            "project_id" => Resolved::text(self.project_id()),
            "tags" => Resolved::Fields(self.tags()),
            "parameters" => Resolved::Fields(self.parameters()),
            "metadata" => Resolved::Fields(self.metadata()),
            "metrics" => Resolved::serialized(self.metrics()),
            "chronos" => Resolved::serialized(self.chronos()),
            "status" => Resolved::Status(self.status()),
            "errors" => Resolved::serialized(&self.errors()),
            _ => return None,
        })
    }
}

impl Queryable for TrialGroup {
    const KIND: EntityKind = EntityKind::TrialGroup;

    fn attribute(&self, name: &str) -> Option<Resolved<'_>> {
        Some(match name {
            "uid" | "_uid" | "id" => Resolved::owned(self.uid()),
            "name" => Resolved::owned(self.name()),
            "description" => Resolved::text(self.description()),
            "metadata" => Resolved::Fields(self.metadata()),
            "trials" => Resolved::uids(self.trials()),
            "project_id" => Resolved::owned(self.project_id()),
            _ => return None,
        })
    }
}

impl Queryable for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn attribute(&self, name: &str) -> Option<Resolved<'_>> {
        Some(match name {
            "uid" | "_uid" | "id" | "name" => Resolved::owned(self.name()),
            "description" => Resolved::text(self.description()),
            "metadata" => Resolved::Fields(self.metadata()),
            "groups" => Resolved::uids(self.groups()),
            "trials" => Resolved::uids(self.trials()),
            _ => return None,
        })
    }
}

/// Apply one operator. An unresolved path only satisfies `$exists: false`.
pub(super) fn evaluate(op: Operator, actual: Option<&Resolved<'_>>, operand: &Value) -> bool {
    let Some(actual) = actual else {
        return op == Operator::Exists && operand == &Value::Bool(false);
    };
    match op {
        Operator::Exists => operand == &Value::Bool(true),
        Operator::Eq => equals(actual, operand),
        Operator::Ne => !equals(actual, operand),
        Operator::In => any_equal(actual, operand),
        Operator::Nin => !any_equal(actual, operand),
        Operator::Gt => compare(actual, operand).is_some_and(Ordering::is_gt),
        Operator::Gte => compare(actual, operand).is_some_and(Ordering::is_ge),
        Operator::Lt => compare(actual, operand).is_some_and(Ordering::is_lt),
        Operator::Lte => compare(actual, operand).is_some_and(Ordering::is_le),
    }
}

fn any_equal(actual: &Resolved<'_>, operand: &Value) -> bool {
    operand
        .as_array()
        .is_some_and(|values| values.iter().any(|v| equals(actual, v)))
}

fn equals(actual: &Resolved<'_>, literal: &Value) -> bool {
    match actual {
        Resolved::Status(status) => status_matches(status, literal),
        Resolved::Fields(fields) => match literal {
            Value::Object(map) => {
                map.len() == fields.len()
                    && fields
                        .iter()
                        .all(|(k, v)| map.get(k).is_some_and(|other| json_equal(v, other)))
            }
            _ => false,
        },
        Resolved::Json(value) => match (value.as_ref(), literal) {
            // Arrays match a scalar literal by containment
            (Value::Array(items), scalar) if !scalar.is_array() => {
                items.iter().any(|item| json_equal(item, scalar))
            }
            (value, literal) => json_equal(value, literal),
        },
    }
}

fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
        }
        (a, b) => a == b,
    }
}

/// A string names a status, a number is its value, an object gives both.
fn status_matches(status: &Status, literal: &Value) -> bool {
    match literal {
        Value::String(name) => status.name_matches(name),
        Value::Number(value) => value.as_i64() == Some(status.value()),
        Value::Object(parts) => {
            let name_ok = match parts.get("name") {
                Some(Value::String(name)) => status.name_matches(name),
                Some(_) => false,
                None => true,
            };
            let value_ok = parts
                .get("value")
                .map_or(true, |v| v.as_i64() == Some(status.value()));
            name_ok && value_ok && !parts.is_empty()
        }
        _ => false,
    }
}

fn status_rank(literal: &Value) -> Option<i64> {
    match literal {
        Value::Number(value) => value.as_i64(),
        Value::String(name) => Status::builtin(name).map(|s| s.value()),
        Value::Object(parts) => parts.get("value").and_then(Value::as_i64),
        _ => None,
    }
}

fn compare(actual: &Resolved<'_>, literal: &Value) -> Option<Ordering> {
    match actual {
        Resolved::Status(status) => status_rank(literal).map(|rank| status.value().cmp(&rank)),
        Resolved::Fields(_) => None,
        Resolved::Json(value) => match (value.as_ref(), literal) {
            (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
            },
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}
