// pipelite-core/src/aggregation/shaping.rs
// $project, $addFields / $set and $unset

use serde_json::Value as JsonValue;
use tracing::warn;

use super::Params;
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::expression::Expr;
use crate::value::Value;

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, Projection)>,
    mode: ProjectionMode,
}

#[derive(Debug, Clone, PartialEq)]
enum Projection {
    Include,
    Exclude,
    Computed(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectionMode {
    /// Start empty, copy what is listed
    Inclusion,
    /// Start from the whole document, drop what is listed
    Exclusion,
}

/// $addFields / $set stage - add or overwrite computed fields
#[derive(Debug, Clone)]
pub struct AddFieldsStage {
    name: &'static str,
    fields: Vec<(String, Expr)>,
}

/// $unset stage - remove fields
#[derive(Debug, Clone)]
pub struct UnsetStage {
    fields: Vec<String>,
}

impl ProjectStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        if params.is_empty() {
            return Err(PipeliteError::invalid_stage(
                "$project",
                "specification must not be empty",
            ));
        }

        let mut fields = Vec::with_capacity(params.len());
        let mut has_inclusion = false;
        let mut has_exclusion = false;

        for (field, spec) in params {
            if field.trim().is_empty() {
                return Err(PipeliteError::invalid_stage("$project", "field names must not be blank"));
            }

            let projection = match spec {
                JsonValue::Number(n) if n.as_f64() == Some(0.0) => Projection::Exclude,
                JsonValue::Number(_) => Projection::Include,
                JsonValue::Bool(true) => Projection::Include,
                JsonValue::Bool(false) => Projection::Exclude,
                // Field paths, operator objects and plain literals
                _ => Projection::Computed(Expr::parse(spec)),
            };

            // _id may be toggled in either mode
            if field != "_id" {
                match projection {
                    Projection::Include => has_inclusion = true,
                    Projection::Exclude => has_exclusion = true,
                    Projection::Computed(_) => {}
                }
            }
            if has_inclusion && has_exclusion {
                return Err(PipeliteError::invalid_stage(
                    "$project",
                    "cannot mix inclusion and exclusion except for _id",
                ));
            }

            fields.push((field.clone(), projection));
        }

        let mode = if has_inclusion {
            ProjectionMode::Inclusion
        } else {
            ProjectionMode::Exclusion
        };

        Ok(ProjectStage { fields, mode })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter().map(|doc| self.project(doc)).collect()
    }

    fn project(&self, source: Document) -> Document {
        let mut projected = match self.mode {
            ProjectionMode::Inclusion => Document::new(),
            ProjectionMode::Exclusion => source.clone(),
        };

        for (field, projection) in &self.fields {
            match (projection, self.mode) {
                (Projection::Include, ProjectionMode::Inclusion) => {
                    if let Some(value) = source.get_path(field) {
                        projected.set_path(field, value.into_owned());
                    }
                }
                (Projection::Exclude, ProjectionMode::Exclusion)
                | (Projection::Exclude, ProjectionMode::Inclusion) => {
                    projected.remove_path(field);
                }
                (Projection::Computed(expr), _) => {
                    let value = expr.evaluate(&source).unwrap_or_else(|e| {
                        warn!(field = %field, error = %e, "$project expression failed; field set to null");
                        Value::Null
                    });
                    projected.set_path(field, value);
                }
                // `_id: 1` in exclusion mode keeps what is already there
                (Projection::Include, ProjectionMode::Exclusion) => {}
            }
        }

        if self.mode == ProjectionMode::Inclusion && !self.fields.iter().any(|(f, _)| f == "_id") {
            if let Some(id) = source.get("_id") {
                projected.set("_id", id.clone());
            }
        }

        projected
    }
}

impl AddFieldsStage {
    pub(crate) fn from_params(name: &'static str, params: &Params) -> Result<Self> {
        if params.is_empty() {
            return Err(PipeliteError::invalid_stage(name, "must declare at least one field"));
        }

        let fields = params
            .iter()
            .map(|(field, spec)| {
                let field = field.trim();
                if field.is_empty() || field.starts_with('$') {
                    return Err(PipeliteError::invalid_stage(
                        name,
                        format!("invalid field name {:?}", field),
                    ));
                }
                Ok((field.to_string(), Expr::parse(spec)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AddFieldsStage { name, fields })
    }

    /// `$addFields` or its alias `$set`, as written in the pipeline
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        docs.into_iter().map(|doc| self.add_fields(doc)).collect()
    }

    /// Expressions read the incoming document, never this stage's own writes
    fn add_fields(&self, source: Document) -> Result<Document> {
        let mut out = source.clone();
        for (field, expr) in &self.fields {
            let value = expr.evaluate(&source).map_err(|e| {
                PipeliteError::stage_failed(self.name, format!("field {:?}: {}", field, e))
            })?;
            out.set_path(field, value);
        }
        Ok(out)
    }
}

impl UnsetStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let names: Vec<&JsonValue> = match params.get("path") {
            Some(JsonValue::Array(items)) if params.len() == 1 => items.iter().collect(),
            Some(single @ JsonValue::String(_)) if params.len() == 1 => vec![single],
            _ => {
                return Self::from_names(params.keys().map(String::as_str));
            }
        };

        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            match name {
                JsonValue::String(s) => fields.push(s.as_str()),
                other => {
                    return Err(PipeliteError::invalid_stage(
                        "$unset",
                        format!("field names must be strings, got {}", other),
                    ))
                }
            }
        }
        Self::from_names(fields.into_iter())
    }

    fn from_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<Self> {
        let fields = names
            .map(|name| {
                let name = name.trim().trim_start_matches('$');
                if name.is_empty() {
                    Err(PipeliteError::invalid_stage("$unset", "field names must not be empty"))
                } else {
                    Ok(name.to_string())
                }
            })
            .collect::<Result<Vec<_>>>()?;

        if fields.is_empty() {
            return Err(PipeliteError::invalid_stage("$unset", "requires at least one field"));
        }
        Ok(UnsetStage { fields })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter()
            .map(|mut doc| {
                for field in &self.fields {
                    doc.remove_path(field);
                }
                doc
            })
            .collect()
    }
}
