// pipelite-core/src/document.rs
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::value::Value;

/// Schema-less document: field name -> value
///
/// Fields are kept in key order; field order carries no meaning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    /// Document from JSON text; the text must be an object
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn into_json(self) -> JsonValue {
        let map: serde_json::Map<String, JsonValue> = self
            .fields
            .into_iter()
            .map(|(key, value)| (key, JsonValue::from(value)))
            .collect();
        JsonValue::Object(map)
    }

    /// Top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Dotted-path read.
    ///
    /// Walking into an array of documents yields the array of each element's
    /// value for the remaining path (Null for elements without it).
    pub fn get_path(&self, path: &str) -> Option<Cow<'_, Value>> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = Cow::Borrowed(self.fields.get(first)?);

        for part in parts {
            current = step_into(current, part)?;
        }

        Some(current)
    }

    /// Dotted-path write; missing or non-document intermediates become documents
    pub fn set_path(&mut self, path: &str, value: Value) {
        match path.split_once('.') {
            None => {
                self.fields.insert(path.to_string(), value);
            }
            Some((head, rest)) => {
                let slot = self
                    .fields
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Document(Document::new()));
                if !matches!(slot, Value::Document(_)) {
                    *slot = Value::Document(Document::new());
                }
                if let Value::Document(inner) = slot {
                    inner.set_path(rest, value);
                }
            }
        }
    }

    /// Dotted-path removal; returns the removed value
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.fields.remove(path),
            Some((head, rest)) => match self.fields.get_mut(head) {
                Some(Value::Document(inner)) => inner.remove_path(rest),
                _ => None,
            },
        }
    }
}

fn step_into<'a>(current: Cow<'a, Value>, part: &str) -> Option<Cow<'a, Value>> {
    match current {
        Cow::Borrowed(Value::Document(doc)) => doc.fields.get(part).map(Cow::Borrowed),
        Cow::Owned(Value::Document(mut doc)) => doc.fields.remove(part).map(Cow::Owned),
        Cow::Borrowed(Value::Array(items)) => Some(Cow::Owned(project_elements(items, part))),
        Cow::Owned(Value::Array(items)) => Some(Cow::Owned(project_elements(&items, part))),
        _ => None,
    }
}

fn project_elements(items: &[Value], part: &str) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| match item {
                Value::Document(doc) => doc.fields.get(part).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
            .collect(),
    )
}

impl From<serde_json::Map<String, JsonValue>> for Document {
    fn from(map: serde_json::Map<String, JsonValue>) -> Self {
        Document {
            fields: map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        }
    }
}

impl From<BTreeMap<String, Value>> for Document {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Document { fields }
    }
}

impl From<Document> for JsonValue {
    fn from(doc: Document) -> Self {
        doc.into_json()
    }
}

impl TryFrom<JsonValue> for Document {
    type Error = JsonValue;

    /// Fails with the original value when it is not an object
    fn try_from(json: JsonValue) -> Result<Self, Self::Error> {
        match json {
            JsonValue::Object(map) => Ok(Document::from(map)),
            other => Err(other),
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Document {
            fields: iter.into_iter().collect(),
        }
    }
}
