// pipelite-core/src/aggregation/mod.rs
// Aggregation pipeline: parsing, validation and execution

mod bucket;
mod facet;
mod group;
mod join;
mod ordering;
mod shaping;

use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::debug;

use crate::document::Document;
use crate::engine::CollectionSource;
use crate::error::{PipeliteError, Result};
use crate::options::EngineOptions;
use crate::query::Query;

pub use bucket::{BucketAutoStage, BucketStage};
pub use facet::FacetStage;
pub use group::{Accumulator, CountStage, GroupStage, PickKind, SortByCountStage};
pub use join::{LookupStage, UnwindStage};
pub use ordering::{LimitStage, SampleStage, SkipStage, SortDirection, SortStage};
pub use shaping::{AddFieldsStage, ProjectStage, UnsetStage};

/// Named stage parameters after coercion
pub(crate) type Params = serde_json::Map<String, JsonValue>;

type StageParser = fn(&Params) -> Result<Stage>;

/// Stage name -> validating parser
static STAGES: Lazy<HashMap<&'static str, StageParser>> = Lazy::new(|| {
    let mut stages: HashMap<&'static str, StageParser> = HashMap::new();
    stages.insert("$match", |p| Ok(Stage::Match(MatchStage::from_params(p)?)));
    stages.insert("$project", |p| Ok(Stage::Project(ProjectStage::from_params(p)?)));
    stages.insert("$group", |p| Ok(Stage::Group(GroupStage::from_params(p)?)));
    stages.insert("$facet", |p| Ok(Stage::Facet(FacetStage::from_params(p)?)));
    stages.insert("$sort", |p| Ok(Stage::Sort(SortStage::from_params(p)?)));
    stages.insert("$limit", |p| Ok(Stage::Limit(LimitStage::from_params(p)?)));
    stages.insert("$skip", |p| Ok(Stage::Skip(SkipStage::from_params(p)?)));
    stages.insert("$lookup", |p| Ok(Stage::Lookup(LookupStage::from_params(p)?)));
    stages.insert("$unwind", |p| Ok(Stage::Unwind(UnwindStage::from_params(p)?)));
    stages.insert("$sample", |p| Ok(Stage::Sample(SampleStage::from_params(p)?)));
    stages.insert("$sortByCount", |p| {
        Ok(Stage::SortByCount(SortByCountStage::from_params(p)?))
    });
    stages.insert("$count", |p| Ok(Stage::Count(CountStage::from_params(p)?)));
    stages.insert("$unset", |p| Ok(Stage::Unset(UnsetStage::from_params(p)?)));
    stages.insert("$addFields", |p| {
        Ok(Stage::AddFields(AddFieldsStage::from_params("$addFields", p)?))
    });
    stages.insert("$set", |p| Ok(Stage::AddFields(AddFieldsStage::from_params("$set", p)?)));
    stages.insert("$bucket", |p| Ok(Stage::Bucket(BucketStage::from_params(p)?)));
    stages.insert("$bucketAuto", |p| Ok(Stage::BucketAuto(BucketAutoStage::from_params(p)?)));
    stages
});

/// Accepted placeholders that pass documents through untouched
const RESERVED_STAGES: &[&str] = &[
    "$unionWith",
    "$redact",
    "$graphLookup",
    "$geoNear",
    "$fill",
    "$replaceRoot",
    "$replaceWith",
];

/// What a running stage may reach outside its input
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub source: &'a dyn CollectionSource,
    pub options: &'a EngineOptions,
}

/// Aggregation pipeline
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    Group(GroupStage),
    Facet(FacetStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
    Lookup(LookupStage),
    Unwind(UnwindStage),
    Sample(SampleStage),
    SortByCount(SortByCountStage),
    Count(CountStage),
    Unset(UnsetStage),
    AddFields(AddFieldsStage),
    Bucket(BucketStage),
    BucketAuto(BucketAutoStage),
    /// Reserved no-op
    Reserved(String),
}

/// $match stage - filter documents
#[derive(Debug, Clone)]
pub struct MatchStage {
    query: Query,
}

impl Pipeline {
    /// Parse pipeline text: an array of stages, a single stage object, or a
    /// comma-separated list of stages without brackets
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let json: JsonValue = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else {
            serde_json::from_str(&format!("[{}]", trimmed))?
        };
        Self::from_json(&json)
    }

    /// Build and validate a pipeline. Every stage is checked before any runs.
    pub fn from_json(pipeline_json: &JsonValue) -> Result<Self> {
        let stages = match pipeline_json {
            JsonValue::Array(stages_array) => stages_array
                .iter()
                .map(Stage::from_json)
                .collect::<Result<Vec<_>>>()?,
            JsonValue::Object(_) => vec![Stage::from_json(pipeline_json)?],
            _ => {
                return Err(PipeliteError::InvalidPipeline(
                    "pipeline must be an array of stages or a single stage object".to_string(),
                ))
            }
        };

        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order, stopping as soon as nothing is left
    pub fn execute(&self, mut docs: Vec<Document>, ctx: ExecContext<'_>) -> Result<Vec<Document>> {
        for (i, stage) in self.stages.iter().enumerate() {
            if docs.is_empty() {
                debug!(
                    remaining = self.stages.len() - i,
                    "working set empty; skipping remaining stages"
                );
                break;
            }

            let input_len = docs.len();
            docs = stage.execute(docs, ctx)?;
            debug!(
                stage = stage.name(),
                input = input_len,
                output = docs.len(),
                "stage executed"
            );
        }

        Ok(docs)
    }
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &JsonValue) -> Result<Self> {
        let JsonValue::Object(obj) = stage_json else {
            return Err(PipeliteError::InvalidPipeline(
                "Stage must be an object".to_string(),
            ));
        };

        // Each stage should have exactly one key
        let mut entries = obj.iter();
        let (stage_name, stage_spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(PipeliteError::InvalidPipeline(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
        };

        if RESERVED_STAGES.contains(&stage_name.as_str()) {
            return Ok(Stage::Reserved(stage_name.clone()));
        }

        let parser = STAGES
            .get(stage_name.as_str())
            .ok_or_else(|| PipeliteError::UnsupportedStage(stage_name.clone()))?;
        let params = coerce_params(stage_name, stage_spec)?;
        parser(&params)
    }

    pub fn name(&self) -> &str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Facet(_) => "$facet",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Sample(_) => "$sample",
            Stage::SortByCount(_) => "$sortByCount",
            Stage::Count(_) => "$count",
            Stage::Unset(_) => "$unset",
            Stage::AddFields(stage) => stage.name(),
            Stage::Bucket(_) => "$bucket",
            Stage::BucketAuto(_) => "$bucketAuto",
            Stage::Reserved(name) => name,
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Document>, ctx: ExecContext<'_>) -> Result<Vec<Document>> {
        match self {
            Stage::Match(stage) => Ok(stage.execute(docs)),
            Stage::Project(stage) => Ok(stage.execute(docs)),
            Stage::Group(stage) => Ok(stage.execute(docs)),
            Stage::Facet(stage) => stage.execute(docs, ctx),
            Stage::Sort(stage) => Ok(stage.execute(docs)),
            Stage::Limit(stage) => Ok(stage.execute(docs)),
            Stage::Skip(stage) => Ok(stage.execute(docs)),
            Stage::Lookup(stage) => Ok(stage.execute(docs, ctx)),
            Stage::Unwind(stage) => Ok(stage.execute(docs)),
            Stage::Sample(stage) => Ok(stage.execute(docs, ctx)),
            Stage::SortByCount(stage) => Ok(stage.execute(docs)),
            Stage::Count(stage) => Ok(stage.execute(docs)),
            Stage::Unset(stage) => Ok(stage.execute(docs)),
            Stage::AddFields(stage) => stage.execute(docs),
            Stage::Bucket(stage) => Ok(stage.execute(docs)),
            Stage::BucketAuto(stage) => stage.execute(docs),
            Stage::Reserved(name) => {
                debug!(stage = %name, "reserved stage; documents passed through");
                Ok(docs)
            }
        }
    }
}

/// Normalize a stage value into named parameters
fn coerce_params(stage_name: &str, spec: &JsonValue) -> Result<Params> {
    let mut params = Params::new();
    match spec {
        JsonValue::Object(obj) => return Ok(obj.clone()),
        JsonValue::String(_) | JsonValue::Array(_) => {
            params.insert("path".to_string(), spec.clone());
        }
        JsonValue::Number(_) | JsonValue::Bool(_) => {
            params.insert("value".to_string(), spec.clone());
        }
        JsonValue::Null => {
            return Err(PipeliteError::InvalidPipeline(format!(
                "{} stage parameters must not be null",
                stage_name
            )));
        }
    }
    Ok(params)
}

/// Number, or a string holding one
pub(crate) fn numeric_param(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Field path parameter with the `$` sigil removed
pub(crate) fn path_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .map(|s| s.trim().trim_start_matches('$'))
        .filter(|s| !s.is_empty())
}

impl MatchStage {
    fn from_params(params: &Params) -> Result<Self> {
        if params.is_empty() {
            return Err(PipeliteError::invalid_stage("$match", "must not be empty"));
        }
        let query = Query::from_json(&JsonValue::Object(params.clone())).map_err(|e| match e {
            PipeliteError::InvalidQuery(message) => PipeliteError::invalid_stage("$match", message),
            other => other,
        })?;
        Ok(MatchStage { query })
    }

    fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter().filter(|doc| self.query.matches(doc)).collect()
    }
}
