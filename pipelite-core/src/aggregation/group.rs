// pipelite-core/src/aggregation/group.rs
// $group, $sortByCount and $count

use ahash::{AHashMap, AHashSet};
use serde_json::Value as JsonValue;
use tracing::warn;

use super::{path_param, Params};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::expression::Expr;
use crate::value::Value;

/// Accumulator names a $group field may use
const ACCUMULATORS: &[&str] = &[
    "$sum",
    "$avg",
    "$min",
    "$max",
    "$push",
    "$addToSet",
    "$first",
    "$last",
    "$stdDevPop",
    "$stdDevSamp",
    "$variancePop",
    "$varianceSamp",
    "$count",
    "$mergeObjects",
    "$maxN",
    "$minN",
    "$firstN",
    "$lastN",
    "$percentile",
    "$median",
];

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expr,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Push(Expr),
    AddToSet(Expr),
    StdDev { input: Expr, sample: bool },
    Variance { input: Expr, sample: bool },
    MergeObjects(Expr),
    Count,
    /// `$maxN` / `$minN` / `$firstN` / `$lastN`; None when `{n, input}` is malformed
    PickN { kind: PickKind, spec: Option<(usize, Expr)> },
    /// Accepted name with no implementation; the field is left out
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickKind {
    Max,
    Min,
    First,
    Last,
}

/// A group's key and its members, in input order
struct Group {
    key: Value,
    members: Vec<Document>,
}

impl GroupStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let id = params
            .get("_id")
            .map(Expr::parse)
            .ok_or_else(|| PipeliteError::invalid_stage("$group", "must have an _id field"))?;

        let mut accumulators = Vec::new();
        for (field, spec) in params {
            if field == "_id" {
                continue;
            }
            let accumulator = Accumulator::from_json(field, spec)?;
            accumulators.push((field.clone(), accumulator));
        }

        Ok(GroupStage { id, accumulators })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        partition(docs, |doc| evaluate_or_null(&self.id, doc, "$group _id"))
            .into_iter()
            .map(|group| {
                let mut result = Document::new();
                result.set("_id", group.key);
                for (field, accumulator) in &self.accumulators {
                    if let Some(value) = accumulator.compute(&group.members) {
                        result.set(field.clone(), value);
                    }
                }
                result
            })
            .collect()
    }
}

/// Split documents into groups keyed by structural equality, first-seen order
fn partition<F>(docs: Vec<Document>, key_of: F) -> Vec<Group>
where
    F: Fn(&Document) -> Value,
{
    let mut index: AHashMap<String, usize> = AHashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for doc in docs {
        let key = key_of(&doc);
        let canonical = key.canonical_key();
        match index.get(&canonical) {
            Some(&slot) => groups[slot].members.push(doc),
            None => {
                index.insert(canonical, groups.len());
                groups.push(Group {
                    key,
                    members: vec![doc],
                });
            }
        }
    }

    groups
}

fn evaluate_or_null(expr: &Expr, doc: &Document, context: &str) -> Value {
    expr.evaluate(doc).unwrap_or_else(|e| {
        warn!(context, error = %e, "expression failed; using null");
        Value::Null
    })
}

impl Accumulator {
    fn from_json(field: &str, spec: &JsonValue) -> Result<Self> {
        let op = match spec {
            JsonValue::Object(obj) if obj.len() == 1 => obj.iter().next(),
            _ => None,
        };
        let Some((op, arg)) = op else {
            return Err(PipeliteError::invalid_stage(
                "$group",
                format!("field {:?} must be an object with exactly one accumulator", field),
            ));
        };
        if !ACCUMULATORS.contains(&op.as_str()) {
            return Err(PipeliteError::invalid_stage(
                "$group",
                format!("unknown accumulator {} for field {:?}", op, field),
            ));
        }

        let input = Expr::parse(arg);
        let accumulator = match op.as_str() {
            "$sum" => Accumulator::Sum(input),
            "$avg" => Accumulator::Avg(input),
            "$min" => Accumulator::Min(input),
            "$max" => Accumulator::Max(input),
            "$first" => Accumulator::First(input),
            "$last" => Accumulator::Last(input),
            "$push" => Accumulator::Push(input),
            "$addToSet" => Accumulator::AddToSet(input),
            "$stdDevPop" => Accumulator::StdDev { input, sample: false },
            "$stdDevSamp" => Accumulator::StdDev { input, sample: true },
            "$variancePop" => Accumulator::Variance { input, sample: false },
            "$varianceSamp" => Accumulator::Variance { input, sample: true },
            "$mergeObjects" => Accumulator::MergeObjects(input),
            "$count" => Accumulator::Count,
            "$maxN" => Accumulator::PickN { kind: PickKind::Max, spec: pick_spec(arg) },
            "$minN" => Accumulator::PickN { kind: PickKind::Min, spec: pick_spec(arg) },
            "$firstN" => Accumulator::PickN { kind: PickKind::First, spec: pick_spec(arg) },
            "$lastN" => Accumulator::PickN { kind: PickKind::Last, spec: pick_spec(arg) },
            other => Accumulator::Unsupported(other.to_string()),
        };
        Ok(accumulator)
    }

    /// Accumulated value for one group; None leaves the field out
    fn compute(&self, docs: &[Document]) -> Option<Value> {
        let value = match self {
            Accumulator::Count => Value::from(docs.len()),

            Accumulator::Sum(input) => {
                // {"$sum": 1} counts, {"$sum": 2} doubles the count
                if let Some(constant) = input.as_literal() {
                    Value::Number(constant.to_number().unwrap_or(0.0) * docs.len() as f64)
                } else {
                    Value::Number(numbers(input, docs).iter().sum())
                }
            }

            Accumulator::Avg(input) => {
                let values = numbers(input, docs);
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::Number(values.iter().sum::<f64>() / values.len() as f64)
                }
            }

            Accumulator::Min(input) => numbers(input, docs)
                .into_iter()
                .reduce(f64::min)
                .map(Value::Number)
                .unwrap_or(Value::Null),

            Accumulator::Max(input) => numbers(input, docs)
                .into_iter()
                .reduce(f64::max)
                .map(Value::Number)
                .unwrap_or(Value::Null),

            Accumulator::First(input) => docs
                .first()
                .map(|doc| evaluate_or_null(input, doc, "$first"))
                .unwrap_or(Value::Null),

            Accumulator::Last(input) => docs
                .last()
                .map(|doc| evaluate_or_null(input, doc, "$last"))
                .unwrap_or(Value::Null),

            Accumulator::Push(input) => Value::Array(present(input, docs)),

            Accumulator::AddToSet(input) => {
                let mut seen = AHashSet::new();
                let unique = present(input, docs)
                    .into_iter()
                    .filter(|value| seen.insert(value.canonical_key()))
                    .collect();
                Value::Array(unique)
            }

            Accumulator::StdDev { input, sample } => {
                Value::Number(variance(&numbers(input, docs), *sample).sqrt())
            }

            Accumulator::Variance { input, sample } => {
                Value::Number(variance(&numbers(input, docs), *sample))
            }

            Accumulator::MergeObjects(input) => {
                let mut merged = Document::new();
                for doc in docs {
                    if let Value::Document(obj) = evaluate_or_null(input, doc, "$mergeObjects") {
                        merged.fields.extend(obj.fields);
                    }
                }
                Value::Document(merged)
            }

            Accumulator::PickN { kind, spec } => match spec {
                Some((n, input)) => Value::Array(pick_n(*kind, *n, input, docs)),
                None => Value::Null,
            },

            Accumulator::Unsupported(op) => {
                warn!(accumulator = %op, "accumulator not implemented; field omitted");
                return None;
            }
        };
        Some(value)
    }
}

/// `{n, input}` with n a positive integer
fn pick_spec(arg: &JsonValue) -> Option<(usize, Expr)> {
    let obj = arg.as_object()?;
    let n = obj.get("n")?.as_f64()?.floor();
    if n < 1.0 {
        return None;
    }
    let input = Expr::parse(obj.get("input")?);
    Some((n as usize, input))
}

/// Numeric values of `input` across the group, non-numeric skipped
fn numbers(input: &Expr, docs: &[Document]) -> Vec<f64> {
    docs.iter()
        .filter_map(|doc| evaluate_or_null(input, doc, "accumulator").to_number())
        .collect()
}

/// Non-null values of `input` across the group, in order
fn present(input: &Expr, docs: &[Document]) -> Vec<Value> {
    docs.iter()
        .map(|doc| evaluate_or_null(input, doc, "accumulator"))
        .filter(|value| !value.is_null())
        .collect()
}

fn variance(values: &[f64], sample: bool) -> f64 {
    let n = values.len();
    if n == 0 || (sample && n == 1) {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    let divisor = if sample { n - 1 } else { n };
    squares / divisor as f64
}

fn pick_n(kind: PickKind, n: usize, input: &Expr, docs: &[Document]) -> Vec<Value> {
    match kind {
        PickKind::Max | PickKind::Min => {
            let mut values = numbers(input, docs);
            values.sort_by(|a, b| a.total_cmp(b));
            if kind == PickKind::Max {
                values.reverse();
            }
            values.into_iter().take(n).map(Value::Number).collect()
        }
        PickKind::First => present(input, docs).into_iter().take(n).collect(),
        PickKind::Last => {
            let values = present(input, docs);
            let skip = values.len().saturating_sub(n);
            values.into_iter().skip(skip).collect()
        }
    }
}

/// $sortByCount stage - group by an expression and count, largest first
#[derive(Debug, Clone)]
pub struct SortByCountStage {
    key: Expr,
}

impl SortByCountStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let path = path_param(params, "path").ok_or_else(|| {
            PipeliteError::invalid_stage("$sortByCount", "'path' must be a non-empty string")
        })?;
        Ok(SortByCountStage {
            key: Expr::FieldRef(path.to_string()),
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut counted: Vec<(Value, usize)> =
            partition(docs, |doc| evaluate_or_null(&self.key, doc, "$sortByCount"))
                .into_iter()
                .map(|group| (group.key, group.members.len()))
                .collect();

        // Stable: equal counts keep first-seen order
        counted.sort_by(|a, b| b.1.cmp(&a.1));

        counted
            .into_iter()
            .map(|(key, count)| {
                let mut result = Document::new();
                result.set("_id", key);
                result.set("count", count);
                result
            })
            .collect()
    }
}

/// $count stage - collapse the input into `{field: n}`
#[derive(Debug, Clone)]
pub struct CountStage {
    field: String,
}

impl CountStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let raw = ["field", "$count", "path"]
            .iter()
            .find_map(|key| params.get(*key))
            .ok_or_else(|| {
                PipeliteError::invalid_stage("$count", "requires a field name")
            })?;

        let field = raw
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                PipeliteError::invalid_stage("$count", "field name must be a non-empty string")
            })?;
        if field.starts_with('$') {
            return Err(PipeliteError::invalid_stage(
                "$count",
                "field name must not start with '$'",
            ));
        }
        if field.chars().any(char::is_whitespace) {
            return Err(PipeliteError::invalid_stage(
                "$count",
                "field name must not contain whitespace",
            ));
        }

        Ok(CountStage {
            field: field.to_string(),
        })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut result = Document::new();
        result.set(self.field.clone(), docs.len());
        vec![result]
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run;
    use crate::error::PipeliteError;
    use crate::aggregation::Pipeline;
    use serde_json::{json, Value as JsonValue};

    fn by_id(out: &JsonValue, id: JsonValue) -> JsonValue {
        out.as_array()
            .unwrap()
            .iter()
            .find(|d| d["_id"] == id)
            .cloned()
            .unwrap_or_else(|| panic!("no group {}", id))
    }

    fn people() -> JsonValue {
        json!([
            {"city": "A", "age": 10, "name": "x"},
            {"city": "A", "age": 20, "name": "y"},
            {"city": "B", "age": 5, "name": "z"}
        ])
    }

    #[test]
    fn test_group_avg_by_city() {
        let out = run(
            json!([{"$group": {"_id": "$city", "avgAge": {"$avg": "$age"}}}]),
            people(),
        )
        .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
        assert_eq!(by_id(&out, json!("A"))["avgAge"], 15);
        assert_eq!(by_id(&out, json!("B"))["avgAge"], 5);
    }

    #[test]
    fn test_group_null_id_single_group() {
        let out = run(
            json!([{"$group": {"_id": null, "total": {"$sum": "$age"}, "n": {"$sum": 1}, "c": {"$count": {}}}}]),
            people(),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": null, "total": 35, "n": 3, "c": 3}]));
    }

    #[test]
    fn test_group_missing_key_is_null_group() {
        let out = run(
            json!([{"$group": {"_id": "$team", "n": {"$sum": 1}}}]),
            json!([{"team": "red"}, {"other": 1}, {"team": null}]),
        )
        .unwrap();
        assert_eq!(by_id(&out, json!(null))["n"], 2);
        assert_eq!(by_id(&out, json!("red"))["n"], 1);
    }

    #[test]
    fn test_group_keys_by_structural_equality() {
        let out = run(
            json!([{"$group": {"_id": {"c": "$city"}, "n": {"$sum": 1}}}]),
            people(),
        )
        .unwrap();
        assert_eq!(by_id(&out, json!({"c": "A"}))["n"], 2);
        // 1 and "1" are different keys
        let out = run(
            json!([{"$group": {"_id": "$k", "n": {"$sum": 1}}}]),
            json!([{"k": 1}, {"k": "1"}, {"k": 1.0}]),
        )
        .unwrap();
        assert_eq!(by_id(&out, json!(1))["n"], 2);
        assert_eq!(by_id(&out, json!("1"))["n"], 1);
    }

    #[test]
    fn test_min_max_first_last() {
        let out = run(
            json!([{"$group": {
                "_id": "$city",
                "lo": {"$min": "$age"},
                "hi": {"$max": "$age"},
                "first": {"$first": "$name"},
                "last": {"$last": "$name"},
                "none": {"$max": "$name"}
            }}]),
            people(),
        )
        .unwrap();
        let a = by_id(&out, json!("A"));
        assert_eq!(a["lo"], 10);
        assert_eq!(a["hi"], 20);
        assert_eq!(a["first"], "x");
        assert_eq!(a["last"], "y");
        assert_eq!(a["none"], JsonValue::Null);
    }

    #[test]
    fn test_push_and_add_to_set() {
        let out = run(
            json!([{"$group": {"_id": null, "all": {"$push": "$t"}, "set": {"$addToSet": "$t"}}}]),
            json!([{"t": "b"}, {"t": "a"}, {"t": null}, {}, {"t": "b"}, {"t": {"x": 1}}, {"t": {"x": 1}}]),
        )
        .unwrap();
        assert_eq!(out[0]["all"], json!(["b", "a", "b", {"x": 1}, {"x": 1}]));
        assert_eq!(out[0]["set"], json!(["b", "a", {"x": 1}]));
    }

    #[test]
    fn test_std_dev_and_variance() {
        let data = json!([{"v": 2}, {"v": 4}, {"v": 4}, {"v": 4}, {"v": 5}, {"v": 5}, {"v": 7}, {"v": 9}]);
        let out = run(
            json!([{"$group": {
                "_id": null,
                "pop": {"$stdDevPop": "$v"},
                "samp": {"$stdDevSamp": "$v"},
                "var": {"$variancePop": "$v"}
            }}]),
            data,
        )
        .unwrap();
        assert_eq!(out[0]["pop"], 2);
        assert_eq!(out[0]["var"], 4);
        let samp = out[0]["samp"].as_f64().unwrap();
        assert!((samp - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn test_std_dev_sample_of_one_is_zero() {
        let out = run(
            json!([{"$group": {"_id": null, "s": {"$stdDevSamp": "$v"}, "p": {"$stdDevPop": "$missing"}}}]),
            json!([{"v": 3}]),
        )
        .unwrap();
        assert_eq!(out[0]["s"], 0);
        assert_eq!(out[0]["p"], 0);
    }

    #[test]
    fn test_merge_objects() {
        let out = run(
            json!([{"$group": {"_id": null, "m": {"$mergeObjects": "$o"}}}]),
            json!([{"o": {"a": 1, "b": 1}}, {"o": 5}, {"o": {"b": 2, "c": 3}}]),
        )
        .unwrap();
        assert_eq!(out[0]["m"], json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_pick_n() {
        let out = run(
            json!([{"$group": {
                "_id": null,
                "top": {"$maxN": {"n": 2, "input": "$s"}},
                "bottom": {"$minN": {"n": 2, "input": "$s"}},
                "first": {"$firstN": {"n": 2, "input": "$s"}},
                "last": {"$lastN": {"n": 2, "input": "$s"}},
                "bad": {"$maxN": {"input": "$s"}}
            }}]),
            json!([{"s": 3}, {"s": 9}, {"s": "n/a"}, {"s": 1}, {"s": 7}]),
        )
        .unwrap();
        assert_eq!(out[0]["top"], json!([9, 7]));
        assert_eq!(out[0]["bottom"], json!([1, 3]));
        assert_eq!(out[0]["first"], json!([3, 9]));
        assert_eq!(out[0]["last"], json!([1, 7]));
        assert_eq!(out[0]["bad"], JsonValue::Null);
    }

    #[test]
    fn test_unimplemented_accumulator_field_omitted() {
        let out = run(
            json!([{"$group": {"_id": null, "med": {"$median": {"input": "$v"}}, "n": {"$sum": 1}}}]),
            json!([{"v": 1}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"_id": null, "n": 1}]));
    }

    #[test]
    fn test_group_validation() {
        let err = Pipeline::from_json(&json!([{"$group": {"total": {"$sum": 1}}}])).unwrap_err();
        assert!(matches!(err, PipeliteError::InvalidStage { .. }));

        let err = Pipeline::from_json(&json!([{"$group": {"_id": null, "x": {"$bogus": 1}}}])).unwrap_err();
        assert!(err.to_string().contains("$bogus"));

        let err = Pipeline::from_json(&json!([{"$group": {"_id": null, "x": {"$sum": 1, "$avg": "$a"}}}]))
            .unwrap_err();
        assert!(matches!(err, PipeliteError::InvalidStage { .. }));

        assert!(Pipeline::from_json(&json!([{"$group": {"_id": null, "x": 1}}])).is_err());
    }

    #[test]
    fn test_sort_by_count() {
        let out = run(
            json!([{"$sortByCount": "$tag"}]),
            json!([{"tag": "a"}, {"tag": "b"}, {"tag": "b"}, {"tag": "c"}, {"tag": "b"}, {"tag": "c"}]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([
                {"_id": "b", "count": 3},
                {"_id": "c", "count": 2},
                {"_id": "a", "count": 1}
            ])
        );
    }

    #[test]
    fn test_sort_by_count_validation() {
        assert!(Pipeline::from_json(&json!([{"$sortByCount": ""}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$sortByCount": 3}])).is_err());
        assert!(Pipeline::from_json(&json!([{"$sortByCount": {"path": "tag"}}])).is_ok());
    }

    #[test]
    fn test_count_forms() {
        let input = json!([{"a": 1}, {"a": 2}, {"a": 3}]);
        for stage in [
            json!({"$count": "total"}),
            json!({"$count": {"field": "total"}}),
            json!({"$count": {"$count": "total"}}),
            json!({"$count": {"path": "total"}}),
        ] {
            let out = run(json!([stage]), input.clone()).unwrap();
            assert_eq!(out, json!([{"total": 3}]));
        }
    }

    #[test]
    fn test_count_validation() {
        for bad in [
            json!({"$count": ""}),
            json!({"$count": "$total"}),
            json!({"$count": "two words"}),
            json!({"$count": {"name": "x"}}),
            json!({"$count": 5}),
        ] {
            let err = Pipeline::from_json(&json!([bad])).unwrap_err();
            assert!(err.is_validation());
        }
    }
}
