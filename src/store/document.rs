//! Document Model
//!
//! Field maps, conditional filters and update operators for the storage port.
//! Monetary fields are always `Value::Decimal`; there is no float variant.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::StoreError;

/// Primary key field of every document
pub const ID_FIELD: &str = "_id";

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Decimal(Decimal),
    Time(DateTime<Utc>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Ordering between comparable values; numbers compare across Int/Decimal
    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ => match (self.as_decimal(), other.as_decimal()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An ordered field map keyed by field name
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn id(&self) -> Option<&str> {
        self.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_decimal(&self, field: &str) -> Option<Decimal> {
        self.get(field).and_then(Value::as_decimal)
    }

    pub fn get_time(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(Value::as_time)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    /// Array membership; a missing field is an empty set
    pub fn contains(&self, field: &str, value: &Value) -> bool {
        self.get(field)
            .and_then(Value::as_array)
            .is_some_and(|items| items.contains(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

/// Conditional filter evaluated against a single document
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    /// Array field contains the value
    Contains(String, Value),
    /// Array field is missing or does not contain the value
    NotContains(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn id(id: &str) -> Self {
        Filter::eq(ID_FIELD, id)
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn contains(field: &str, value: impl Into<Value>) -> Self {
        Filter::Contains(field.to_string(), value.into())
    }

    pub fn not_contains(field: &str, value: impl Into<Value>) -> Self {
        Filter::NotContains(field.to_string(), value.into())
    }

    /// Conjunction, flattening nested `And`s
    pub fn and(self, other: Filter) -> Self {
        let mut clauses = match self {
            Filter::All => Vec::new(),
            Filter::And(clauses) => clauses,
            f => vec![f],
        };
        match other {
            Filter::All => {}
            Filter::And(more) => clauses.extend(more),
            f => clauses.push(f),
        }
        match clauses.len() {
            0 => Filter::All,
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        }
    }

    /// Disjunction
    pub fn or(self, other: Filter) -> Self {
        let mut clauses = match self {
            Filter::Or(clauses) => clauses,
            f => vec![f],
        };
        match other {
            Filter::Or(more) => clauses.extend(more),
            f => clauses.push(f),
        }
        Filter::Or(clauses)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => match doc.get(field) {
                Some(v) => v == value || v.compare(value) == Some(Ordering::Equal),
                None => *value == Value::Null,
            },
            Filter::Gte(field, value) => doc
                .get(field)
                .and_then(|v| v.compare(value))
                .is_some_and(|o| o != Ordering::Less),
            Filter::Lt(field, value) => doc
                .get(field)
                .and_then(|v| v.compare(value))
                .is_some_and(|o| o == Ordering::Less),
            Filter::Contains(field, value) => doc.contains(field, value),
            Filter::NotContains(field, value) => !doc.contains(field, value),
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
        }
    }
}

/// Single update operator
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Add to a decimal field; a missing field counts as zero
    Inc(String, Decimal),
    Set(String, Value),
    /// Append to an array unless already present
    AddToSet(String, Value),
    /// Remove every occurrence from an array
    Pull(String, Value),
}

/// Ordered list of update operators applied atomically to one document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(mut self, field: &str, by: Decimal) -> Self {
        self.ops.push(UpdateOp::Inc(field.to_string(), by));
        self
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field.to_string(), value.into()));
        self
    }

    pub fn add_to_set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops
            .push(UpdateOp::AddToSet(field.to_string(), value.into()));
        self
    }

    pub fn pull(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Pull(field.to_string(), value.into()));
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Apply to a copy of `doc`; returns the post-image.
    ///
    /// Either every operator applies or none does.
    pub fn apply(&self, doc: &Document) -> Result<Document, StoreError> {
        let mut next = doc.clone();
        for op in &self.ops {
            match op {
                UpdateOp::Inc(field, by) => {
                    let current = match next.get(field) {
                        None | Some(Value::Null) => Decimal::ZERO,
                        Some(v) => v.as_decimal().ok_or_else(|| {
                            StoreError::Internal(format!("cannot $inc non-numeric field {field}"))
                        })?,
                    };
                    let sum = current.checked_add(*by).ok_or_else(|| {
                        StoreError::Internal(format!("decimal overflow on {field}"))
                    })?;
                    next.insert(field, sum);
                }
                UpdateOp::Set(field, value) => {
                    if field == ID_FIELD {
                        return Err(StoreError::Internal("_id is immutable".to_string()));
                    }
                    next.insert(field, value.clone());
                }
                UpdateOp::AddToSet(field, value) => {
                    let mut items = array_field(&next, field)?;
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                    next.insert(field, Value::Array(items));
                }
                UpdateOp::Pull(field, value) => {
                    if next.get(field).is_some() {
                        let mut items = array_field(&next, field)?;
                        items.retain(|v| v != value);
                        next.insert(field, Value::Array(items));
                    }
                }
            }
        }
        Ok(next)
    }
}

fn array_field(doc: &Document, field: &str) -> Result<Vec<Value>, StoreError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(StoreError::Internal(format!(
            "field {field} is not an array"
        ))),
    }
}
