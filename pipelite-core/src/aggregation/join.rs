// pipelite-core/src/aggregation/join.rs
// $lookup (nested-loop equality join) and $unwind

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{path_param, ExecContext, Params};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::Value;

/// $lookup stage - attach matching documents from another collection
#[derive(Debug, Clone)]
pub struct LookupStage {
    from: String,
    local_field: String,
    foreign_field: String,
    as_field: String,
}

/// $unwind stage - one output document per array element
#[derive(Debug, Clone)]
pub struct UnwindStage {
    /// None when the stage was given no usable path; such a stage passes
    /// documents through
    path: Option<String>,
    preserve_null_and_empty: bool,
    include_array_index: Option<String>,
}

impl LookupStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match params.get(key) {
                Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
                Some(_) => Err(PipeliteError::invalid_stage(
                    "$lookup",
                    format!("'{}' must be a non-empty string", key),
                )),
                None => Err(PipeliteError::invalid_stage(
                    "$lookup",
                    format!("missing required field '{}'", key),
                )),
            }
        };

        Ok(LookupStage {
            from: required("from")?,
            local_field: required("localField")?.trim_start_matches('$').to_string(),
            foreign_field: required("foreignField")?.trim_start_matches('$').to_string(),
            as_field: required("as")?,
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>, ctx: ExecContext<'_>) -> Vec<Document> {
        // Materialized once, scanned for every input document
        let foreign = match ctx.source.fetch_collection(&self.from) {
            Ok(foreign) => foreign,
            Err(e) => {
                warn!(from = %self.from, error = %e, "$lookup foreign collection unavailable; documents passed through");
                return docs;
            }
        };

        let foreign_keys: Vec<Value> = foreign
            .iter()
            .map(|doc| {
                doc.get_path(&self.foreign_field)
                    .map(|v| v.into_owned())
                    .unwrap_or(Value::Null)
            })
            .collect();

        docs.into_iter()
            .map(|mut doc| {
                let matched = match doc.get_path(&self.local_field) {
                    Some(local) => foreign
                        .iter()
                        .zip(&foreign_keys)
                        .filter(|(_, key)| **key == *local)
                        .map(|(foreign_doc, _)| Value::Document(foreign_doc.clone()))
                        .collect(),
                    None => {
                        debug!(field = %self.local_field, "$lookup local field missing; no matches");
                        Vec::new()
                    }
                };
                doc.set_path(&self.as_field, Value::Array(matched));
                doc
            })
            .collect()
    }
}

impl UnwindStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let preserve_null_and_empty = match params.get("preserveNullAndEmptyArrays") {
            None => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(_) => {
                return Err(PipeliteError::invalid_stage(
                    "$unwind",
                    "'preserveNullAndEmptyArrays' must be a boolean",
                ))
            }
        };

        let include_array_index = match params.get("includeArrayIndex") {
            None => None,
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                Some(s.trim().trim_start_matches('$').to_string())
            }
            Some(_) => {
                return Err(PipeliteError::invalid_stage(
                    "$unwind",
                    "'includeArrayIndex' must be a non-empty string",
                ))
            }
        };

        Ok(UnwindStage {
            path: path_param(params, "path").map(str::to_string),
            preserve_null_and_empty,
            include_array_index,
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        let Some(path) = &self.path else {
            warn!("$unwind has no usable 'path'; documents passed through");
            return docs;
        };

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let value = doc.get_path(path).map(|v| v.into_owned());
            match value {
                None | Some(Value::Null) => {
                    if self.preserve_null_and_empty {
                        results.push(doc);
                    }
                }
                Some(Value::Array(items)) if items.is_empty() => {
                    if self.preserve_null_and_empty {
                        results.push(doc);
                    }
                }
                Some(Value::Array(items)) => {
                    for (index, item) in items.into_iter().enumerate() {
                        results.push(self.unwound(&doc, path, item, Value::from(index)));
                    }
                }
                // A scalar unwinds to itself; it has no array position
                Some(scalar) => results.push(self.unwound(&doc, path, scalar, Value::Null)),
            }
        }
        results
    }

    fn unwound(&self, source: &Document, path: &str, item: Value, index: Value) -> Document {
        let mut doc = source.clone();
        doc.set_path(path, item);
        if let Some(index_field) = &self.include_array_index {
            doc.set_path(index_field, index);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{run, run_with};
    use super::*;
    use crate::aggregation::Pipeline;
    use crate::engine::{CollectionSource, MemoryCatalog};
    use crate::options::EngineOptions;
    use serde_json::json;

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog
            .insert_json(
                "orders",
                &json!([
                    {"_id": 1, "user": "u1", "total": 10},
                    {"_id": 2, "user": "u2", "total": 20},
                    {"_id": 3, "user": "u1", "total": 30}
                ]),
            )
            .unwrap();
        catalog
    }

    fn lookup_orders() -> JsonValue {
        json!([{"$lookup": {"from": "orders", "localField": "uid", "foreignField": "user", "as": "orders"}}])
    }

    #[test]
    fn test_lookup_collects_matches() {
        let out = run_with(
            lookup_orders(),
            json!([{"uid": "u1"}, {"uid": "u2"}]),
            &catalog(),
            &EngineOptions::default(),
        )
        .unwrap();

        let first = out[0]["orders"].as_array().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["_id"], 1);
        assert_eq!(first[1]["_id"], 3);
        assert_eq!(out[1]["orders"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_no_match_attaches_empty_array() {
        let out = run_with(
            lookup_orders(),
            json!([{"uid": "nobody"}, {"name": "no uid"}]),
            &catalog(),
            &EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(out[0]["orders"], json!([]));
        assert_eq!(out[1]["orders"], json!([]));
    }

    #[test]
    fn test_lookup_missing_collection_is_empty() {
        let out = run(
            json!([{"$lookup": {"from": "ghost", "localField": "a", "foreignField": "b", "as": "joined"}}]),
            json!([{"a": 1}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"a": 1, "joined": []}]));
    }

    struct Unavailable;

    impl CollectionSource for Unavailable {
        fn fetch_collection(&self, name: &str) -> Result<Vec<Document>> {
            Err(PipeliteError::CollectionUnavailable {
                name: name.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    #[test]
    fn test_lookup_fetch_failure_passes_through() {
        let pipeline = Pipeline::from_json(&lookup_orders()).unwrap();
        let options = EngineOptions::default();
        let ctx = ExecContext {
            source: &Unavailable,
            options: &options,
        };
        let input = super::super::test_support::docs(json!([{"uid": "u1"}]));
        let out = pipeline.execute(input.clone(), ctx).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_lookup_structural_equality_on_nested_paths() {
        let catalog = MemoryCatalog::new();
        catalog
            .insert_json("tags", &json!([{"key": {"k": [1, 2]}, "label": "pair"}]))
            .unwrap();
        let out = run_with(
            json!([{"$lookup": {"from": "tags", "localField": "meta.key", "foreignField": "key", "as": "meta.tags"}}]),
            json!([{"meta": {"key": {"k": [1, 2]}}}]),
            &catalog,
            &EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(out[0]["meta"]["tags"][0]["label"], "pair");
    }

    #[test]
    fn test_lookup_validation() {
        assert!(Pipeline::from_json(&json!([{"$lookup": {"from": "a", "localField": "b", "foreignField": "c"}}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$lookup": {"from": "", "localField": "b", "foreignField": "c", "as": "d"}}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$lookup": {"from": 1, "localField": "b", "foreignField": "c", "as": "d"}}])).is_err());
    }

    #[test]
    fn test_unwind_array() {
        let out = run(
            json!([{"$unwind": "$tags"}]),
            json!([{"_id": 1, "tags": ["a", "b"]}, {"_id": 2, "tags": ["c"]}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": 1, "tags": "a"},
                {"_id": 1, "tags": "b"},
                {"_id": 2, "tags": "c"}
            ])
        );
    }

    #[test]
    fn test_unwind_drops_missing_null_and_empty() {
        let out = run(
            json!([{"$unwind": {"path": "$tags"}}]),
            json!([{"_id": 1}, {"_id": 2, "tags": null}, {"_id": 3, "tags": []}, {"_id": 4, "tags": "solo"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": 4, "tags": "solo"}]));
    }

    #[test]
    fn test_unwind_preserve_passes_original_through() {
        let out = run(
            json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true, "includeArrayIndex": "idx"}}]),
            json!([{"_id": 1}, {"_id": 2, "tags": []}, {"_id": 3, "tags": ["x", "y"]}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": 1},
                {"_id": 2, "tags": []},
                {"_id": 3, "tags": "x", "idx": 0},
                {"_id": 3, "tags": "y", "idx": 1}
            ])
        );
    }

    #[test]
    fn test_unwind_scalar_index_is_null() {
        let out = run(
            json!([{"$unwind": {"path": "tags", "includeArrayIndex": "i"}}]),
            json!([{"tags": 7}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"tags": 7, "i": null}]));
    }

    #[test]
    fn test_unwind_nested_path() {
        let out = run(
            json!([{"$unwind": "$a.b"}]),
            json!([{"a": {"b": [1, 2], "c": true}}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"a": {"b": 1, "c": true}}, {"a": {"b": 2, "c": true}}]));
    }

    #[test]
    fn test_unwind_without_path_degrades() {
        let input = json!([{"tags": [1, 2]}]);
        assert_eq!(run(json!([{"$unwind": {}}]), input.clone()).unwrap(), input);
        assert_eq!(run(json!([{"$unwind": ["$tags"]}]), input.clone()).unwrap(), input);
        assert_eq!(run(json!([{"$unwind": "$"}]), input.clone()).unwrap(), input);
    }

    #[test]
    fn test_unwind_option_types_are_validated() {
        assert!(Pipeline::from_json(&json!([{"$unwind": {"path": "$a", "preserveNullAndEmptyArrays": "yes"}}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$unwind": {"path": "$a", "includeArrayIndex": 3}}])).is_err());
    }
}
