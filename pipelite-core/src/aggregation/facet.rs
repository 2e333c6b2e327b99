// pipelite-core/src/aggregation/facet.rs
// $facet - independent sub-pipelines over the same input

use tracing::{debug, warn};

use super::{ExecContext, Params, Pipeline};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::Value;

/// $facet stage
#[derive(Debug, Clone)]
pub struct FacetStage {
    facets: Vec<(String, Pipeline)>,
}

impl FacetStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        if params.is_empty() {
            return Err(PipeliteError::invalid_stage("$facet", "requires at least one facet"));
        }

        // A broken branch is dropped; the rest still run
        let mut facets = Vec::with_capacity(params.len());
        for (name, spec) in params {
            if !spec.is_array() {
                warn!(facet = %name, "$facet branch is not an array of stages; skipped");
                continue;
            }
            match Pipeline::from_json(spec) {
                Ok(pipeline) => facets.push((name.clone(), pipeline)),
                Err(e) => warn!(facet = %name, error = %e, "$facet branch is invalid; skipped"),
            }
        }

        Ok(FacetStage { facets })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>, ctx: ExecContext<'_>) -> Result<Vec<Document>> {
        let results = if ctx.options.parallel_facets && self.facets.len() > 1 {
            self.run_parallel(&docs, ctx)?
        } else {
            self.facets
                .iter()
                .map(|(_, pipeline)| pipeline.execute(docs.clone(), ctx))
                .collect::<Result<Vec<_>>>()?
        };

        let mut out = Document::new();
        for ((name, _), branch) in self.facets.iter().zip(results) {
            out.set(name.clone(), Value::Array(branch.into_iter().map(Value::Document).collect()));
        }
        Ok(vec![out])
    }

    /// One scoped thread per branch, each over its own copy of the input
    fn run_parallel(&self, docs: &[Document], ctx: ExecContext<'_>) -> Result<Vec<Vec<Document>>> {
        debug!(facets = self.facets.len(), "running $facet branches in parallel");

        let joined = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = self
                .facets
                .iter()
                .map(|(_, pipeline)| {
                    let input = docs.to_vec();
                    scope.spawn(move |_| pipeline.execute(input, ctx))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(PipeliteError::stage_failed("$facet", "branch worker panicked"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        });

        joined.unwrap_or_else(|_| Err(PipeliteError::stage_failed("$facet", "branch worker panicked")))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{run, run_with};
    use super::*;
    use crate::engine::MemoryCatalog;
    use crate::options::EngineOptions;
    use serde_json::{json, Value as JsonValue};

    fn products() -> JsonValue {
        json!([
            {"name": "pen", "price": 2, "kind": "office"},
            {"name": "desk", "price": 150, "kind": "furniture"},
            {"name": "lamp", "price": 40, "kind": "furniture"}
        ])
    }

    fn facet_pipeline() -> JsonValue {
        json!([{"$facet": {
            "cheap": [{"$match": {"price": {"$lt": 50}}}, {"$project": {"name": 1, "_id": 0}}],
            "byKind": [{"$sortByCount": "$kind"}],
            "total": [{"$count": "n"}]
        }}])
    }

    #[test]
    fn test_facet_branches_see_original_input() {
        let out = run(facet_pipeline(), products()).unwrap();
        assert_eq!(out.as_array().unwrap().len(), 1);

        let result = &out[0];
        assert_eq!(result["cheap"], json!([{"name": "pen"}, {"name": "lamp"}]));
        assert_eq!(result["byKind"][0], json!({"_id": "furniture", "count": 2}));
        assert_eq!(result["total"], json!([{"n": 3}]));
    }

    #[test]
    fn test_facet_parallel_matches_sequential() {
        let sequential = run(facet_pipeline(), products()).unwrap();
        let parallel = run_with(
            facet_pipeline(),
            products(),
            &MemoryCatalog::new(),
            &EngineOptions::new().with_parallel_facets(true),
        )
        .unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_facet_skips_invalid_branches() {
        let out = run(
            json!([{"$facet": {
                "ok": [{"$limit": 1}],
                "notArray": {"$limit": 1},
                "badStage": [{"$nope": 1}]
            }}]),
            products(),
        )
        .unwrap();
        let result = out[0].as_object().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result["ok"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_facet_requires_branches() {
        assert!(Pipeline::from_json(&json!([{"$facet": {}}])).is_err());
    }

    #[test]
    fn test_facet_branch_failure_propagates() {
        let err = run(
            json!([{"$facet": {"broken": [{"$addFields": {"x": {"$nope": 1}}}]}}]),
            products(),
        )
        .unwrap_err();
        assert!(matches!(err, PipeliteError::StageFailed { .. }));
    }
}
