//! Declarative entity filters
//!
//! A query maps dotted attribute paths to conditions, in the familiar
//! document-store shape:
//!
//! ```json
//! {"name": {"$in": ["0", "10"]}, "metadata.heartbeat": {"$lte": 1700000000}, "status": "new"}
//! ```
//!
//! - A literal is an equality test; an object whose keys all start with `$`
//!   is a set of operator conditions.
//! - Conditions are AND-ed and evaluated in order, stopping at the first
//!   failing one.
//! - `null` or `{}` matches everything.
//! - The first path segment must name an attribute of the entity type
//!   (`InvalidQuery` otherwise). Deeper segments index into open maps, and an
//!   absent key is simply "no match".
//!
//! The same evaluator serves trials, groups and projects through the
//! [`Queryable`] trait.

mod predicate;

use serde_json::Value;

use crate::{Error, Result};

pub use predicate::{Queryable, Resolved};

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `$eq` (also the meaning of a bare literal)
    Eq,
    /// `$ne`
    Ne,
    /// `$in`: equal to any element of the operand array
    In,
    /// `$nin`: equal to none of the operand array
    Nin,
    /// `$gt`
    Gt,
    /// `$gte`
    Gte,
    /// `$lt`
    Lt,
    /// `$lte`
    Lte,
    /// `$exists`: operand is a bool
    Exists,
}

impl Operator {
    /// Parse a `$`-prefixed operator name
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for unknown operators.
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$in" => Self::In,
            "$nin" => Self::Nin,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$exists" => Self::Exists,
            other => return Err(Error::InvalidQuery(format!("unknown operator `{other}`"))),
        })
    }

    /// Operator name as written in queries
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::In => "$in",
            Self::Nin => "$nin",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Exists => "$exists",
        }
    }
}

/// One `(path, operator, operand)` test
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    path: Vec<String>,
    op: Operator,
    operand: Value,
}

impl Condition {
    /// Build a condition, validating the operand shape.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for an empty path, a non-array `$in`/`$nin` operand or
    /// a non-bool `$exists` operand.
    pub fn new(path: &str, op: Operator, operand: Value) -> Result<Self> {
        let path: Vec<String> = path.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(Error::InvalidQuery(format!(
                "invalid attribute path `{}`",
                path.join(".")
            )));
        }
        match (op, &operand) {
            (Operator::In | Operator::Nin, Value::Array(_))
            | (Operator::Exists, Value::Bool(_))
            | (
                Operator::Eq
                | Operator::Ne
                | Operator::Gt
                | Operator::Gte
                | Operator::Lt
                | Operator::Lte,
                _,
            ) => Ok(Self { path, op, operand }),
            (op, operand) => Err(Error::InvalidQuery(format!(
                "{} does not accept {operand}",
                op.as_str()
            ))),
        }
    }

    /// Attribute path, split on dots
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Operator
    #[must_use]
    pub const fn op(&self) -> Operator {
        self.op
    }

    /// Operand
    #[must_use]
    pub const fn operand(&self) -> &Value {
        &self.operand
    }

    /// Evaluate against one entity.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` when the first path segment is not an attribute of `T`.
    pub fn matches<T: Queryable>(&self, entity: &T) -> Result<bool> {
        let (head, rest) = self
            .path
            .split_first()
            .ok_or_else(|| Error::InvalidQuery("empty attribute path".to_string()))?;
        let attribute = entity.attribute(head).ok_or_else(|| {
            Error::InvalidQuery(format!("{} has no attribute `{head}`", T::KIND))
        })?;
        let resolved = attribute.descend(rest);
        Ok(predicate::evaluate(self.op, resolved.as_ref(), &self.operand))
    }
}

/// Conjunction of conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    /// Query matching every entity
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a JSON query document.
    ///
    /// ```rust
    /// use track_store::query::Query;
    /// use serde_json::json;
    ///
    /// let query = Query::parse(&json!({"status": {"$in": ["new", "suspended"]}}))?;
    /// assert_eq!(query.conditions().len(), 1);
    /// assert!(Query::parse(&json!(null))?.is_empty());
    /// # Ok::<(), track_store::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// `InvalidQuery` for non-object documents, unknown operators, mixed
    /// operator/literal objects and malformed operands.
    pub fn parse(document: &Value) -> Result<Self> {
        let map = match document {
            Value::Null => return Ok(Self::all()),
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidQuery(format!(
                    "query must be an object, got {other}"
                )))
            }
        };

        let mut conditions = Vec::with_capacity(map.len());
        for (path, condition) in map {
            match condition {
                Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                    for (op, operand) in ops {
                        conditions.push(Condition::new(path, Operator::parse(op)?, operand.clone())?);
                    }
                }
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    return Err(Error::InvalidQuery(format!(
                        "`{path}` mixes operators and literal keys"
                    )));
                }
                literal => conditions.push(Condition::new(path, Operator::Eq, literal.clone())?),
            }
        }
        Ok(Self { conditions })
    }

    /// Parsed conditions, in evaluation order
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// True when the query matches everything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against one entity, short-circuiting on the first failure.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` when a path does not start with an attribute of `T`.
    pub fn matches<T: Queryable>(&self, entity: &T) -> Result<bool> {
        for condition in &self.conditions {
            if !condition.matches(entity)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn with(mut self, path: &str, op: Operator, operand: Value) -> Self {
        // A malformed path surfaces as `InvalidQuery` on evaluation.
        match Condition::new(path, op, operand) {
            Ok(condition) => self.conditions.push(condition),
            Err(_) => self.conditions.push(Condition {
                path: vec![path.to_string()],
                op: Operator::Exists,
                operand: Value::Bool(false),
            }),
        }
        self
    }

    /// `path == value`
    #[must_use]
    pub fn eq(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Eq, value.into())
    }

    /// `path != value`
    #[must_use]
    pub fn ne(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Ne, value.into())
    }

    /// `path` equals one of `values`
    #[must_use]
    pub fn is_in<V: Into<Value>>(self, path: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.with(path, Operator::In, Value::Array(values))
    }

    /// `path` equals none of `values`
    #[must_use]
    pub fn not_in<V: Into<Value>>(self, path: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.with(path, Operator::Nin, Value::Array(values))
    }

    /// `path > value`
    #[must_use]
    pub fn gt(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Gt, value.into())
    }

    /// `path >= value`
    #[must_use]
    pub fn gte(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Gte, value.into())
    }

    /// `path < value`
    #[must_use]
    pub fn lt(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Lt, value.into())
    }

    /// `path <= value`
    #[must_use]
    pub fn lte(self, path: &str, value: impl Into<Value>) -> Self {
        self.with(path, Operator::Lte, value.into())
    }

    /// `path` is (or is not) present
    #[must_use]
    pub fn exists(self, path: &str, present: bool) -> Self {
        self.with(path, Operator::Exists, Value::Bool(present))
    }
}

impl TryFrom<Value> for Query {
    type Error = Error;

    fn try_from(document: Value) -> Result<Self> {
        Self::parse(&document)
    }
}
