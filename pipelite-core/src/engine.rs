// pipelite-core/src/engine.rs
// Query entry point and the collection collaborator

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::aggregation::{ExecContext, Pipeline};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::options::EngineOptions;

/// Where pipelines read their documents from
///
/// Implementations materialize the whole collection. A collection that does
/// not exist is an empty sequence, not an error.
pub trait CollectionSource: Send + Sync {
    fn fetch_collection(&self, name: &str) -> Result<Vec<Document>>;
}

impl<T: CollectionSource + ?Sized> CollectionSource for Arc<T> {
    fn fetch_collection(&self, name: &str) -> Result<Vec<Document>> {
        (**self).fetch_collection(name)
    }
}

impl<T: CollectionSource + ?Sized> CollectionSource for &T {
    fn fetch_collection(&self, name: &str) -> Result<Vec<Document>> {
        (**self).fetch_collection(name)
    }
}

/// In-memory collections keyed by name
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one document; returns the collection's new size
    pub fn insert_one(&self, collection: &str, doc: Document) -> usize {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        docs.push(doc);
        docs.len()
    }

    /// Append many documents; returns how many were added
    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) -> usize {
        let mut collections = self.collections.write();
        let existing = collections.entry(collection.to_string()).or_default();
        let before = existing.len();
        existing.extend(docs);
        existing.len() - before
    }

    /// Append a JSON object or an array of JSON objects
    pub fn insert_json(&self, collection: &str, json: &JsonValue) -> Result<usize> {
        let items: Vec<&JsonValue> = match json {
            JsonValue::Array(items) => items.iter().collect(),
            single => vec![single],
        };

        // Check everything before touching the collection
        let docs = items
            .into_iter()
            .map(|item| {
                Document::try_from(item.clone()).map_err(|other| {
                    PipeliteError::InvalidDocument(format!("expected a JSON object, got {}", other))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.insert_many(collection, docs))
    }

    /// Remove a collection; false if it did not exist
    pub fn drop_collection(&self, collection: &str) -> bool {
        self.collections.write().remove(collection).is_some()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl CollectionSource for MemoryCatalog {
    fn fetch_collection(&self, name: &str) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Runs aggregation pipelines against a collection source
pub struct Engine<S: CollectionSource> {
    source: S,
    options: EngineOptions,
}

impl<S: CollectionSource> Engine<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, EngineOptions::default())
    }

    pub fn with_options(source: S, options: EngineOptions) -> Self {
        Engine { source, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run pipeline text against a collection.
    ///
    /// The text may be a JSON array of stages, a single stage object, or a
    /// comma-separated list of stages without brackets.
    pub fn query(&self, collection: &str, pipeline: &str) -> Result<Vec<Document>> {
        let pipeline = Pipeline::parse(pipeline)?;
        self.run(collection, &pipeline)
    }

    pub fn query_json(&self, collection: &str, pipeline: &JsonValue) -> Result<Vec<Document>> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.run(collection, &pipeline)
    }

    /// Run an already validated pipeline
    pub fn run(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>> {
        let docs = self.source.fetch_collection(collection)?;
        if docs.is_empty() {
            debug!(collection = %collection, "collection is empty; no stages run");
            return Ok(Vec::new());
        }

        debug!(
            collection = %collection,
            documents = docs.len(),
            stages = pipeline.len(),
            "running pipeline"
        );

        let ctx = ExecContext {
            source: &self.source,
            options: &self.options,
        };
        pipeline.execute(docs, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Engine<MemoryCatalog> {
        let catalog = MemoryCatalog::new();
        catalog
            .insert_json(
                "users",
                &json!([
                    {"name": "Alice", "age": 30},
                    {"name": "Bob", "age": 25},
                    {"name": "Carol", "age": 35}
                ]),
            )
            .unwrap();
        Engine::new(catalog)
    }

    #[test]
    fn test_catalog_inserts() {
        let catalog = MemoryCatalog::new();
        assert_eq!(catalog.insert_one("a", Document::new()), 1);
        assert_eq!(catalog.insert_many("a", vec![Document::new(), Document::new()]), 2);
        assert_eq!(catalog.insert_json("b", &json!({"x": 1})).unwrap(), 1);
        assert_eq!(catalog.len("a"), 3);
        assert_eq!(catalog.collection_names(), vec!["a".to_string(), "b".to_string()]);

        assert!(catalog.drop_collection("a"));
        assert!(!catalog.drop_collection("a"));
        assert_eq!(catalog.fetch_collection("a").unwrap(), Vec::new());
    }

    #[test]
    fn test_insert_json_rejects_non_objects_atomically() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.insert_json("c", &json!([{"ok": 1}, 5])).is_err());
        assert_eq!(catalog.len("c"), 0);
    }

    #[test]
    fn test_query_text_forms() {
        let engine = engine();
        assert_eq!(engine.query("users", r#"[{"$limit": 2}]"#).unwrap().len(), 2);
        assert_eq!(engine.query("users", r#"{"$limit": 1}"#).unwrap().len(), 1);
        assert_eq!(
            engine
                .query("users", r#"{"$sort": {"age": -1}}, {"$limit": 1}"#)
                .unwrap()[0]
                .get("name")
                .and_then(|v| v.as_str()),
            Some("Carol")
        );
        assert_eq!(engine.query("users", "[]").unwrap().len(), 3);
    }

    #[test]
    fn test_query_missing_collection_is_empty() {
        let engine = engine();
        assert!(engine.query("ghosts", r#"[{"$count": "n"}]"#).unwrap().is_empty());
    }

    #[test]
    fn test_validation_runs_before_fetch() {
        let engine = engine();
        let err = engine.query("ghosts", r#"[{"$limit": "x"}]"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_engine_over_shared_source() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_json("c", &json!([{"v": 1}])).unwrap();
        let engine = Engine::with_options(Arc::clone(&catalog), EngineOptions::new().with_sample_seed(1));
        assert_eq!(engine.options().sample_seed, Some(1));
        assert_eq!(engine.query_json("c", &json!([])).unwrap().len(), 1);

        catalog.insert_json("c", &json!({"v": 2})).unwrap();
        assert_eq!(engine.query_json("c", &json!({"$count": "n"})).unwrap()[0].get("n").and_then(|v| v.to_number()), Some(2.0));
    }
}
