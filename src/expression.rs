use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::document::{Document, Value};
use crate::error::{EngineError, Result};

/// A dotted path such as `address.city`, resolved through nested documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    parts: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(EngineError::invalid_argument("field path cannot be empty"));
        }
        if path.starts_with('$') {
            return Err(EngineError::invalid_argument(format!(
                "field path '{}' cannot start with '$'",
                path
            )));
        }

        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        if parts.iter().any(String::is_empty) {
            return Err(EngineError::invalid_argument(format!(
                "field path '{}' contains an empty component",
                path
            )));
        }

        Ok(Self {
            raw: path.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the value at this path, or `None` when any component is missing
    /// or traverses a non-document value.
    pub fn resolve<'a>(&self, document: &'a Document) -> Option<&'a Value> {
        let (first, rest) = self.parts.split_first()?;
        let mut current = document.get(first)?;
        for part in rest {
            current = current.as_document()?.get(part)?;
        }
        Some(current)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.raw)
    }
}

/// Group keys and accumulator arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Field(FieldPath),
    Literal(Value),
    Object(Vec<(String, Expression)>),
}

impl Expression {
    pub fn field(path: &str) -> Result<Self> {
        FieldPath::parse(path).map(Expression::Field)
    }

    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        match spec {
            serde_json::Value::String(s) if s.starts_with("$$") => Err(EngineError::invalid_argument(
                format!("variables are not supported: '{}'", s),
            )),
            serde_json::Value::String(s) if s.starts_with('$') => Self::field(&s[1..]),
            serde_json::Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (name, value) in map {
                    if name.starts_with('$') {
                        return Err(EngineError::invalid_argument(format!(
                            "unsupported expression operator '{}'",
                            name
                        )));
                    }
                    fields.push((name.clone(), Self::parse(value)?));
                }
                Ok(Expression::Object(fields))
            }
            other => Ok(Expression::Literal(Value::from_json(other.clone()))),
        }
    }

    /// Evaluates against `document`; `None` means the referenced field is missing.
    pub fn evaluate_optional(&self, document: &Document) -> Option<Value> {
        match self {
            Expression::Field(path) => path.resolve(document).cloned(),
            Expression::Literal(value) => Some(value.clone()),
            Expression::Object(fields) => Some(Value::Document(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.evaluate(document)))
                    .collect(),
            )),
        }
    }

    /// Evaluates against `document`, treating missing fields as null.
    pub fn evaluate(&self, document: &Document) -> Value {
        self.evaluate_optional(document).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        match spec.as_f64() {
            Some(d) if d == 1.0 => Ok(SortDirection::Ascending),
            Some(d) if d == -1.0 => Ok(SortDirection::Descending),
            _ => Err(EngineError::invalid_argument(format!(
                "sort direction must be 1 or -1, found {}",
                spec
            ))),
        }
    }
}

/// One component of a [`SortKey`]. A key never mixes directions within a
/// component position, so comparing `Asc` with `Desc` does not happen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyPart {
    Asc(Value),
    Desc(Value),
}

impl KeyPart {
    fn value(&self) -> &Value {
        match self {
            KeyPart::Asc(value) | KeyPart::Desc(value) => value,
        }
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Desc(a), KeyPart::Desc(b)) => b.cmp(a),
            _ => self.value().cmp(other.value()),
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey(Vec<KeyPart>);

impl SortKey {
    pub fn approximate_size(&self) -> usize {
        self.0.iter().map(|part| part.value().approximate_size()).sum()
    }
}

/// The body of a `$sort` stage: an ordered list of paths and directions.
#[derive(Debug, Clone, PartialEq)]
pub struct SortPattern {
    components: Vec<(FieldPath, SortDirection)>,
}

impl SortPattern {
    pub fn new(components: Vec<(FieldPath, SortDirection)>) -> Result<Self> {
        if components.is_empty() {
            return Err(EngineError::invalid_argument("$sort requires at least one field"));
        }
        Ok(Self { components })
    }

    pub fn ascending(path: &str) -> Result<Self> {
        Self::new(vec![(FieldPath::parse(path)?, SortDirection::Ascending)])
    }

    pub fn descending(path: &str) -> Result<Self> {
        Self::new(vec![(FieldPath::parse(path)?, SortDirection::Descending)])
    }

    pub fn parse(spec: &serde_json::Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| EngineError::invalid_argument("$sort must be an object"))?;

        let mut components = Vec::with_capacity(map.len());
        for (path, direction) in map {
            components.push((FieldPath::parse(path)?, SortDirection::parse(direction)?));
        }
        Self::new(components)
    }

    pub fn components(&self) -> &[(FieldPath, SortDirection)] {
        &self.components
    }

    pub fn key_for(&self, document: &Document) -> SortKey {
        SortKey(
            self.components
                .iter()
                .map(|(path, direction)| {
                    let value = path.resolve(document).cloned().unwrap_or(Value::Null);
                    match direction {
                        SortDirection::Ascending => KeyPart::Asc(value),
                        SortDirection::Descending => KeyPart::Desc(value),
                    }
                })
                .collect(),
        )
    }
}
