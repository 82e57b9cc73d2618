pub mod value;

#[cfg(test)]
mod tests;

pub use value::Value;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::constants::{DOCUMENT_BASE_BYTES, FIELD_BASE_BYTES};
use crate::error::{EngineError, Result};

/// An ordered mapping from field name to value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

/// Builds a [`Document`] from `name => value` pairs.
#[macro_export]
macro_rules! doc {
    () => { $crate::document::Document::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut document = $crate::document::Document::new();
        $(document.insert($name, $value);)+
        document
    }};
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Sets `name`, replacing an existing value in place or appending.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        DOCUMENT_BASE_BYTES
            + self
                .fields
                .iter()
                .map(|(name, value)| FIELD_BASE_BYTES + name.len() + value.approximate_size())
                .sum::<usize>()
    }

    /// Parses a JSON object into a document, keeping field order.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match Value::from_json(value) {
            Value::Document(doc) => Ok(doc),
            other => Err(EngineError::invalid_argument(format!(
                "expected a JSON object, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut document = Document::new();
        for (name, value) in iter {
            document.insert(name, value);
        }
        document
    }
}

impl Ord for Document {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((name_a, value_a), (name_b, value_b)) in self.fields.iter().zip(other.fields.iter()) {
            let ordering = name_a
                .as_bytes()
                .cmp(name_b.as_bytes())
                .then_with(|| value_a.cmp(value_b));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }
}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Document {}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fields.len().hash(state);
        for (name, value) in &self.fields {
            name.hash(state);
            value.hash(state);
        }
    }
}
