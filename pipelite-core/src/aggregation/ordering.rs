// pipelite-core/src/aggregation/ordering.rs
// $sort, $limit, $skip and $sample

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use tracing::warn;

use super::{numeric_param, ExecContext, Params};
use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::Value;

/// $sort stage - stable multi-key sort
#[derive(Debug, Clone)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// $limit stage - keep the first N documents
#[derive(Debug, Clone)]
pub struct LimitStage {
    limit: i64,
}

/// $skip stage - drop the first N documents
#[derive(Debug, Clone)]
pub struct SkipStage {
    skip: usize,
}

/// $sample stage - random selection without replacement
#[derive(Debug, Clone)]
pub struct SampleStage {
    size: f64,
}

impl SortStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        if params.is_empty() {
            return Err(PipeliteError::invalid_stage("$sort", "must not be empty"));
        }

        // Key order is the order written in the stage
        let mut fields = Vec::with_capacity(params.len());
        for (field, value) in params {
            let direction = match value.as_f64() {
                Some(n) if n == 1.0 => SortDirection::Ascending,
                Some(n) if n == -1.0 => SortDirection::Descending,
                _ => {
                    return Err(PipeliteError::invalid_stage(
                        "$sort",
                        format!("field {:?} must be either 1 or -1", field),
                    ))
                }
            };
            fields.push((field.clone(), direction));
        }

        Ok(SortStage { fields })
    }

    pub(crate) fn execute(&self, docs: Vec<Document>) -> Vec<Document> {
        stable_sort(docs, &|a: &Document, b: &Document| self.compare(a, b))
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, direction) in &self.fields {
            let val_a = a.get_path(field);
            let val_b = b.get_path(field);

            let cmp = compare_values(
                val_a.as_deref().unwrap_or(&Value::Null),
                val_b.as_deref().unwrap_or(&Value::Null),
            );
            let cmp = match direction {
                SortDirection::Ascending => cmp,
                SortDirection::Descending => cmp.reverse(),
            };

            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }
}

/// Numeric when both sides are numeric, otherwise by display text
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.to_number(), b.to_number()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_display_string().cmp(&b.to_display_string()),
    }
}

/// Merge sort; tolerates comparators that are not a total order (mixed
/// numeric/text keys), which `slice::sort_by` may reject
fn stable_sort<T, F>(mut items: Vec<T>, cmp: &F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    if items.len() <= 1 {
        return items;
    }

    let right = items.split_off(items.len() / 2);
    let left = stable_sort(items, cmp);
    let right = stable_sort(right, cmp);

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        // Ties go left so equal keys keep input order
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => cmp(r, l) == Ordering::Less,
            _ => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        if let Some(item) = next {
            merged.push(item);
        }
    }
    merged.extend(left);
    merged.extend(right);
    merged
}

/// Count under the stage's own key or `value`; a bare string arrives as `path`
fn count_param(params: &Params, stage_key: &str) -> Option<f64> {
    params
        .get(stage_key)
        .or_else(|| params.get("value"))
        .or_else(|| params.get("path"))
        .and_then(numeric_param)
}

impl LimitStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let limit = count_param(params, "$limit").ok_or_else(|| {
            PipeliteError::invalid_stage("$limit", "must have a numeric value")
        })?;
        Ok(LimitStage {
            limit: limit.floor() as i64,
        })
    }

    pub(crate) fn execute(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if self.limit <= 0 {
            return Vec::new();
        }
        docs.truncate(self.limit as usize);
        docs
    }
}

impl SkipStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let skip = count_param(params, "$skip").ok_or_else(|| {
            PipeliteError::invalid_stage("$skip", "must have a numeric value")
        })?;
        Ok(SkipStage {
            skip: skip.floor().max(0.0) as usize,
        })
    }

    pub(crate) fn execute(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if self.skip >= docs.len() {
            return Vec::new();
        }
        docs.drain(..self.skip);
        docs
    }
}

impl SampleStage {
    pub(crate) fn from_params(params: &Params) -> Result<Self> {
        let size = params
            .get("size")
            .ok_or_else(|| PipeliteError::invalid_stage("$sample", "requires a 'size' parameter"))?;
        let size = numeric_param(size)
            .ok_or_else(|| PipeliteError::invalid_stage("$sample", "'size' must be a number"))?;
        if size <= 0.0 {
            return Err(PipeliteError::invalid_stage(
                "$sample",
                "'size' must be a positive number",
            ));
        }
        Ok(SampleStage { size })
    }

    pub(crate) fn execute(&self, mut docs: Vec<Document>, ctx: ExecContext<'_>) -> Vec<Document> {
        let n = self.size.floor() as usize;
        if n == 0 {
            warn!(size = self.size, "$sample size rounds down to 0; returning no documents");
            return Vec::new();
        }

        let mut rng = match ctx.options.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        if n >= docs.len() {
            docs.shuffle(&mut rng);
            return docs;
        }

        // Partial Fisher-Yates: the first n slots end up a uniform sample
        for i in 0..n {
            let j = rng.random_range(i..docs.len());
            docs.swap(i, j);
        }
        docs.truncate(n);
        docs
    }
}
