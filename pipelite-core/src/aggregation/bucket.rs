// pipelite-core/src/aggregation/bucket.rs
// $bucket and $bucketAuto

use serde_json::Value as JsonValue;
use tracing::debug;

use super::{numeric_param, path_param, Params};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::{format_number, Value};

/// $bucket stage - explicit half-open intervals over a numeric field
#[derive(Debug, Clone)]
pub struct BucketStage {
    group_by: String,
    boundaries: Vec<f64>,
    default: Option<Value>,
    /// Output fields; each counts its bucket's documents
    counts: Vec<String>,
}

/// $bucketAuto stage - evenly populated intervals computed from the data
#[derive(Debug, Clone)]
pub struct BucketAutoStage {
    group_by: String,
    buckets: usize,
    output: Vec<(String, BucketOutput)>,
}

#[derive(Debug, Clone, PartialEq)]
enum BucketOutput {
    Count,
    Sum(String),
    Avg(String),
    Max(String),
    Min(String),
}

fn group_by_param(stage: &str, params: &Params) -> Result<String> {
    path_param(params, "groupBy")
        .map(str::to_string)
        .ok_or_else(|| PipeliteError::invalid_stage(stage, "'groupBy' must be a non-empty string"))
}

/// Output specs: name -> single-operator object
fn output_entries<'a>(
    stage: &str,
    params: &'a Params,
) -> Result<Option<Vec<(&'a String, &'a String, &'a JsonValue)>>> {
    let Some(output) = params.get("output") else {
        return Ok(None);
    };
    let JsonValue::Object(output) = output else {
        return Err(PipeliteError::invalid_stage(stage, "'output' must be an object"));
    };

    let mut entries = Vec::with_capacity(output.len());
    for (name, spec) in output {
        let op = match spec {
            JsonValue::Object(obj) if obj.len() == 1 => obj.iter().next(),
            _ => None,
        };
        let Some((op, arg)) = op else {
            return Err(PipeliteError::invalid_stage(
                stage,
                format!("output field {:?} must be an object with one operator", name),
            ));
        };
        entries.push((name, op, arg));
    }
    Ok(Some(entries))
}

fn group_value(doc: &Document, path: &str) -> Option<f64> {
    doc.get_path(path).and_then(|v| v.to_number())
}

fn interval_label(lower: f64, upper: f64) -> String {
    format!("[{}, {})", format_number(lower), format_number(upper))
}

impl BucketStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let group_by = group_by_param("$bucket", params)?;

        let mut boundaries = match params.get("boundaries") {
            Some(JsonValue::Array(items)) if items.len() >= 2 => items
                .iter()
                .map(JsonValue::as_f64)
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| {
                    PipeliteError::invalid_stage("$bucket", "'boundaries' must contain only numbers")
                })?,
            _ => {
                return Err(PipeliteError::invalid_stage(
                    "$bucket",
                    "'boundaries' must be an array with at least two elements",
                ))
            }
        };
        boundaries.sort_by(|a, b| a.total_cmp(b));

        let default = match params.get("default") {
            None => None,
            Some(JsonValue::Null) => {
                return Err(PipeliteError::invalid_stage("$bucket", "'default' must not be null"))
            }
            Some(label) => Some(Value::from(label)),
        };

        let counts = match output_entries("$bucket", params)? {
            None => vec!["count".to_string()],
            Some(entries) => entries
                .into_iter()
                .map(|(name, op, arg)| {
                    let is_count = op == "$sum" && numeric_param(arg) == Some(1.0);
                    if is_count {
                        Ok(name.clone())
                    } else {
                        Err(PipeliteError::invalid_stage(
                            "$bucket",
                            format!(
                                "output field {:?}: only {{\"$sum\": 1}} is supported",
                                name
                            ),
                        ))
                    }
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(BucketStage {
            group_by,
            boundaries,
            default,
            counts,
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        let intervals = self.boundaries.len() - 1;
        let mut tallies = vec![0usize; intervals];
        let mut default_tally = 0usize;

        for doc in &docs {
            let slot = group_value(doc, &self.group_by).and_then(|v| {
                self.boundaries
                    .windows(2)
                    .position(|w| v >= w[0] && v < w[1])
            });
            match slot {
                Some(i) => tallies[i] += 1,
                None if self.default.is_some() => default_tally += 1,
                None => {}
            }
        }

        let mut results = Vec::new();
        for (i, tally) in tallies.into_iter().enumerate() {
            if tally > 0 {
                let label = interval_label(self.boundaries[i], self.boundaries[i + 1]);
                results.push(self.bucket_document(Value::String(label), tally));
            }
        }
        if let Some(label) = &self.default {
            if default_tally > 0 {
                results.push(self.bucket_document(label.clone(), default_tally));
            }
        }
        results
    }

    fn bucket_document(&self, id: Value, count: usize) -> Document {
        let mut result = Document::new();
        result.set("_id", id);
        for field in &self.counts {
            result.set(field.clone(), count);
        }
        result
    }
}

impl BucketAutoStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let group_by = group_by_param("$bucketAuto", params)?;

        let buckets = params
            .get("buckets")
            .and_then(numeric_param)
            .map(f64::floor)
            .filter(|n| *n >= 1.0)
            .ok_or_else(|| {
                PipeliteError::invalid_stage("$bucketAuto", "'buckets' must be a number greater than 0")
            })? as usize;

        let output = match output_entries("$bucketAuto", params)? {
            None => vec![("count".to_string(), BucketOutput::Count)],
            Some(entries) => entries
                .into_iter()
                .map(|(name, op, arg)| Ok((name.clone(), BucketOutput::from_json(name, op, arg)?)))
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(BucketAutoStage {
            group_by,
            buckets,
            output,
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let mut values: Vec<f64> = docs
            .iter()
            .filter_map(|doc| group_value(doc, &self.group_by))
            .collect();
        if values.is_empty() {
            return Err(PipeliteError::stage_failed(
                "$bucketAuto",
                "no valid 'groupBy' values",
            ));
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let boundaries = auto_boundaries(&values, self.buckets);
        debug!(?boundaries, "computed $bucketAuto boundaries");

        let intervals = boundaries.len() - 1;
        let mut members: Vec<Vec<&Document>> = vec![Vec::new(); intervals];
        for doc in &docs {
            let Some(v) = group_value(doc, &self.group_by) else {
                continue;
            };
            let slot = (0..intervals).find(|&i| {
                let (lower, upper) = (boundaries[i], boundaries[i + 1]);
                // Last interval is closed on the right
                v >= lower && (v < upper || (i == intervals - 1 && v <= upper))
            });
            if let Some(i) = slot {
                members[i].push(doc);
            }
        }

        let results = members
            .iter()
            .enumerate()
            .map(|(i, bucket)| {
                let mut result = Document::new();
                result.set(
                    "_id",
                    interval_label(boundaries[i], boundaries[i + 1]),
                );
                for (name, output) in &self.output {
                    result.set(name.clone(), output.compute(bucket));
                }
                result
            })
            .collect();
        Ok(results)
    }
}

/// Boundaries at evenly spaced rank positions of the sorted values, repeated
/// boundaries collapsed; the last one sits just above the maximum
fn auto_boundaries(sorted: &[f64], buckets: usize) -> Vec<f64> {
    let last = sorted.len() - 1;
    // Beyond 2 * last + 1 every rank position is already a boundary
    let buckets = buckets.min(2 * last + 1);
    let mut boundaries = Vec::with_capacity(buckets + 1);
    boundaries.push(sorted[0]);
    for i in 1..buckets {
        let pos = (i as f64 * last as f64 / buckets as f64).round() as usize;
        boundaries.push(sorted[pos.min(last)]);
    }
    boundaries.push(sorted[last] + 1.0);
    boundaries.dedup();
    boundaries
}

impl BucketOutput {
    fn from_json(name: &str, op: &str, arg: &JsonValue) -> Result<Self> {
        if op == "$sum" && numeric_param(arg) == Some(1.0) {
            return Ok(BucketOutput::Count);
        }

        let field = arg
            .as_str()
            .map(|s| s.trim_start_matches('$'))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PipeliteError::invalid_stage(
                    "$bucketAuto",
                    format!("output field {:?}: {} requires a field name", name, op),
                )
            })?
            .to_string();

        match op {
            "$sum" => Ok(BucketOutput::Sum(field)),
            "$avg" => Ok(BucketOutput::Avg(field)),
            "$max" => Ok(BucketOutput::Max(field)),
            "$min" => Ok(BucketOutput::Min(field)),
            other => Err(PipeliteError::invalid_stage(
                "$bucketAuto",
                format!("unsupported output operator {}", other),
            )),
        }
    }

    fn compute(&self, docs: &[&Document]) -> Value {
        let numbers = |field: &str| -> Vec<f64> {
            docs.iter().filter_map(|doc| group_value(doc, field)).collect()
        };

        match self {
            BucketOutput::Count => Value::from(docs.len()),
            BucketOutput::Sum(field) => Value::Number(numbers(field).iter().sum()),
            BucketOutput::Avg(field) => {
                let values = numbers(field);
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::Number(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            BucketOutput::Max(field) => numbers(field)
                .into_iter()
                .reduce(f64::max)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            BucketOutput::Min(field) => numbers(field)
                .into_iter()
                .reduce(f64::min)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use super::*;
    use crate::aggregation::Pipeline;
    use serde_json::json;

    #[test]
    fn test_bucket_drops_out_of_range() {
        let out = run(
            json!([{"$bucket": {"groupBy": "$x", "boundaries": [0, 10, 20]}}]),
            json!([{"x": 5}, {"x": 15}, {"x": 25}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": "[0, 10)", "count": 1},
                {"_id": "[10, 20)", "count": 1}
            ])
        );
    }

    #[test]
    fn test_bucket_default_collects_misfits() {
        let out = run(
            json!([{"$bucket": {
                "groupBy": "price",
                "boundaries": [100, 0, 50],
                "default": "Other",
                "output": {"n": {"$sum": 1}}
            }}]),
            json!([{"price": 10}, {"price": 49.5}, {"price": 50}, {"price": 500}, {"price": "cheap"}, {}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": "[0, 50)", "n": 2},
                {"_id": "[50, 100)", "n": 1},
                {"_id": "Other", "n": 3}
            ])
        );
    }

    #[test]
    fn test_bucket_half_open_upper_bound() {
        let out = run(
            json!([{"$bucket": {"groupBy": "$x", "boundaries": [0, 10]}}]),
            json!([{"x": 10}, {"x": 0}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": "[0, 10)", "count": 1}]));
    }

    #[test]
    fn test_bucket_validation() {
        for bad in [
            json!({"$bucket": {"boundaries": [0, 1]}}),
            json!({"$bucket": {"groupBy": "$x", "boundaries": [0]}}),
            json!({"$bucket": {"groupBy": "$x", "boundaries": [0, "a"]}}),
            json!({"$bucket": {"groupBy": "$x", "boundaries": [0, 1], "output": {"s": {"$sum": "$x"}}}}),
            json!({"$bucket": {"groupBy": "$x", "boundaries": [0, 1], "output": {"s": {"$avg": "$x"}}}}),
            json!({"$bucket": {"groupBy": "$x", "boundaries": [0, 1], "default": null}}),
        ] {
            let err = Pipeline::from_json(&json!([bad])).unwrap_err();
            assert!(matches!(err, PipeliteError::InvalidStage { ref stage, .. } if stage == "$bucket"));
        }
    }

    #[test]
    fn test_auto_boundaries() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(auto_boundaries(&values, 2), vec![1.0, 6.0, 11.0]);
        assert_eq!(auto_boundaries(&[5.0, 5.0, 5.0], 3), vec![5.0, 6.0]);
        assert_eq!(auto_boundaries(&[1.0, 2.0], 1), vec![1.0, 3.0]);
    }

    #[test]
    fn test_bucket_auto_even_split() {
        let input: Vec<_> = (1..=10).map(|i| json!({"v": i})).collect();
        let out = run(
            json!([{"$bucketAuto": {
                "groupBy": "$v",
                "buckets": 2,
                "output": {"n": {"$sum": 1}, "total": {"$sum": "v"}, "avg": {"$avg": "$v"}, "hi": {"$max": "v"}, "lo": {"$min": "v"}}
            }}]),
            JsonValue::Array(input),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": "[1, 6)", "n": 5, "total": 15, "avg": 3, "hi": 5, "lo": 1},
                {"_id": "[6, 11)", "n": 5, "total": 40, "avg": 8, "hi": 10, "lo": 6}
            ])
        );
    }

    #[test]
    fn test_bucket_auto_default_output_and_string_count() {
        let out = run(
            json!([{"$bucketAuto": {"groupBy": "score", "buckets": 1}}]),
            json!([{"score": 3}, {"score": "7"}, {"name": "none"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": "[3, 8)", "count": 2}]));

        let out = run(
            json!([{"$bucketAuto": {"groupBy": "score", "buckets": 1, "output": {"c": {"$sum": "1"}}}}]),
            json!([{"score": 3}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": "[3, 4)", "c": 1}]));
    }

    #[test]
    fn test_bucket_auto_huge_bucket_count() {
        let input = json!([{"v": 1}, {"v": 2}, {"v": 3}]);
        let huge = run(
            json!([{"$bucketAuto": {"groupBy": "$v", "buckets": 1e20}}]),
            input.clone(),
        )
        .unwrap();
        assert_eq!(
            huge,
            json!([
                {"_id": "[1, 2)", "count": 1},
                {"_id": "[2, 3)", "count": 1},
                {"_id": "[3, 4)", "count": 1}
            ])
        );

        let many = run(json!([{"$bucketAuto": {"groupBy": "$v", "buckets": 50}}]), input).unwrap();
        assert_eq!(huge, many);
    }

    #[test]
    fn test_bucket_auto_without_numbers_fails() {
        let err = run(
            json!([{"$bucketAuto": {"groupBy": "$v", "buckets": 2}}]),
            json!([{"v": "x"}, {"w": 1}]),
        )
        .unwrap_err();
        assert!(matches!(err, PipeliteError::StageFailed { .. }));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_bucket_auto_validation() {
        for bad in [
            json!({"$bucketAuto": {"groupBy": "$v"}}),
            json!({"$bucketAuto": {"groupBy": "$v", "buckets": 0}}),
            json!({"$bucketAuto": {"groupBy": "", "buckets": 2}}),
            json!({"$bucketAuto": {"groupBy": "$v", "buckets": 2, "output": {"x": {"$push": "v"}}}}),
            json!({"$bucketAuto": {"groupBy": "$v", "buckets": 2, "output": {"x": {"$avg": 3}}}}),
        ] {
            assert!(Pipeline::from_json(&json!([bad])).is_err());
        }
    }
}
