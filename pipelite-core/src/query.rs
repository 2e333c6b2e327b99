// pipelite-core/src/query.rs
// $match predicate language

use ahash::AHashSet;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::Value;

/// Every operator name a $match condition may mention. Names without an
/// implementation below are accepted and fail the clause when evaluated.
static MATCH_OPERATORS: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        // comparison
        "$eq", "$gt", "$gte", "$in", "$lt", "$lte", "$ne", "$nin",
        // logical
        "$and", "$or", "$not", "$nor",
        // element
        "$exists", "$type",
        // evaluation
        "$expr", "$jsonSchema", "$mod", "$regex", "$options", "$text", "$where",
        // array
        "$all", "$elemMatch", "$size",
        // geospatial
        "$geoWithin", "$geoIntersects", "$near", "$nearSphere",
        // bitwise
        "$bitsAllClear", "$bitsAllSet", "$bitsAnyClear", "$bitsAnySet",
        // misc and expression operators
        "$comment", "$sampleRate", "$rand", "$meta", "$literal", "$var",
        "$concat", "$substr", "$toLower", "$toUpper", "$trim", "$ltrim", "$rtrim",
        "$split", "$strLenBytes", "$strLenCP", "$strcasecmp", "$substrBytes",
        "$substrCP", "$indexOfBytes", "$indexOfCP", "$toString", "$dateToString",
        "$dateFromString", "$add", "$subtract", "$multiply", "$divide", "$pow",
        "$sqrt", "$abs", "$ceil", "$floor", "$trunc", "$round", "$sin", "$cos",
        "$tan", "$asin", "$acos", "$atan", "$atan2", "$ln", "$log", "$log10",
        "$exp", "$min", "$max", "$avg", "$sum", "$stdDevPop", "$stdDevSamp",
        "$first", "$last", "$push", "$addToSet", "$mergeObjects", "$arrayElemAt",
        "$filter", "$map", "$reduce", "$zip", "$range", "$concatArrays",
        "$arrayToObject", "$objectToArray", "$setUnion", "$setIntersection",
        "$setDifference", "$setEquals", "$setIsSubset", "$anyElementTrue",
        "$allElementsTrue", "$document", "$function", "$let", "$switch", "$cond",
        "$ifNull", "$isNumber", "$isString", "$isDate", "$isArray", "$isObject",
        "$isBool",
    ]
    .into_iter()
    .collect()
});

/// Field-level operators
#[derive(Debug, Clone)]
pub enum QueryOperator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Value),
    Nin(Value),
    Exists(Value),
    Type(Value),
    All(Value),
    ElemMatch(ElemMatch),
    Size(Value),
    Mod(Value),
    /// None when the pattern was not a string or did not compile
    Regex(Option<Regex>),
    Not(Negated),
    /// Recognized name without an implementation
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// Sub-condition applied to document elements
    Query(Query),
    /// Operator set applied to each element directly
    Operators(Vec<QueryOperator>),
}

#[derive(Debug, Clone)]
pub enum Negated {
    Operators(Vec<QueryOperator>),
    Regex(Option<Regex>),
}

#[derive(Debug, Clone)]
pub enum Criterion {
    /// Structural equality; a missing field equals Null
    Equals(Value),
    /// Conjunction of operators
    Operators(Vec<QueryOperator>),
}

#[derive(Debug, Clone)]
pub enum Condition {
    Field { path: String, criterion: Criterion },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    /// `$expr` is not evaluated; always false
    Expr,
    /// Top-level operator that is recognized but not implemented
    Unsupported(String),
}

/// Parsed $match condition; all conditions must hold
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub conditions: Vec<Condition>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    /// Parse and validate a condition object
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = json else {
            return Err(PipeliteError::InvalidQuery(
                "condition must be an object".into(),
            ));
        };

        let mut query = Query::new();
        for (key, value) in map {
            match key.as_str() {
                "$and" => query.conditions.push(Condition::And(Self::parse_clauses(key, value)?)),
                "$or" => query.conditions.push(Condition::Or(Self::parse_clauses(key, value)?)),
                "$nor" => query.conditions.push(Condition::Nor(Self::parse_clauses(key, value)?)),
                "$expr" => query.conditions.push(Condition::Expr),
                "$comment" => {}
                op if op.starts_with('$') => {
                    if !MATCH_OPERATORS.contains(op) {
                        return Err(PipeliteError::InvalidQuery(format!(
                            "unknown top-level operator {}",
                            op
                        )));
                    }
                    query.conditions.push(Condition::Unsupported(op.to_string()));
                }
                field => {
                    let criterion = Self::parse_criterion(field, value)?;
                    query.conditions.push(Condition::Field {
                        path: field.to_string(),
                        criterion,
                    });
                }
            }
        }

        Ok(query)
    }

    fn parse_clauses(op: &str, value: &JsonValue) -> Result<Vec<Query>> {
        let JsonValue::Array(items) = value else {
            return Err(PipeliteError::InvalidQuery(format!("{} requires an array", op)));
        };
        if items.is_empty() {
            return Err(PipeliteError::InvalidQuery(format!("{} array must not be empty", op)));
        }

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                if !item.is_object() {
                    return Err(PipeliteError::InvalidQuery(format!(
                        "{} element #{} is not an object",
                        op, i
                    )));
                }
                Self::from_json(item)
            })
            .collect()
    }

    fn parse_criterion(field: &str, value: &JsonValue) -> Result<Criterion> {
        let JsonValue::Object(map) = value else {
            return Ok(Criterion::Equals(Value::from(value)));
        };

        let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if operator_keys == 0 {
            // Embedded document literal
            return Ok(Criterion::Equals(Value::from(value)));
        }
        if operator_keys != map.len() {
            return Err(PipeliteError::InvalidQuery(format!(
                "field {:?} mixes operators and plain keys",
                field
            )));
        }

        Ok(Criterion::Operators(Self::parse_operators(field, map)?))
    }

    fn parse_operators(
        field: &str,
        map: &serde_json::Map<String, JsonValue>,
    ) -> Result<Vec<QueryOperator>> {
        let options = map.get("$options").and_then(JsonValue::as_str).unwrap_or("");
        let mut operators = Vec::with_capacity(map.len());

        for (op, arg) in map {
            if !MATCH_OPERATORS.contains(op.as_str()) {
                return Err(PipeliteError::InvalidQuery(format!(
                    "invalid operator {} for field {:?}",
                    op, field
                )));
            }

            let operator = match op.as_str() {
                "$eq" => QueryOperator::Eq(Value::from(arg)),
                "$ne" => QueryOperator::Ne(Value::from(arg)),
                "$gt" => QueryOperator::Gt(Value::from(arg)),
                "$gte" => QueryOperator::Gte(Value::from(arg)),
                "$lt" => QueryOperator::Lt(Value::from(arg)),
                "$lte" => QueryOperator::Lte(Value::from(arg)),
                "$in" => QueryOperator::In(Value::from(arg)),
                "$nin" => QueryOperator::Nin(Value::from(arg)),
                "$exists" => QueryOperator::Exists(Value::from(arg)),
                "$type" => QueryOperator::Type(Value::from(arg)),
                "$all" => QueryOperator::All(Value::from(arg)),
                "$size" => QueryOperator::Size(Value::from(arg)),
                "$mod" => QueryOperator::Mod(Value::from(arg)),
                "$regex" => QueryOperator::Regex(compile_regex(arg, options)),
                "$options" => continue,
                "$elemMatch" => QueryOperator::ElemMatch(Self::parse_elem_match(field, arg)?),
                "$not" => QueryOperator::Not(Self::parse_not(field, arg)?),
                other => QueryOperator::Unsupported(other.to_string()),
            };
            operators.push(operator);
        }

        Ok(operators)
    }

    fn parse_elem_match(field: &str, arg: &JsonValue) -> Result<ElemMatch> {
        let JsonValue::Object(map) = arg else {
            return Err(PipeliteError::InvalidQuery(format!(
                "$elemMatch on {:?} requires an object",
                field
            )));
        };

        let all_operators = !map.is_empty() && map.keys().all(|k| k.starts_with('$'));
        let is_combinator = map.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor"));
        if all_operators && !is_combinator {
            Ok(ElemMatch::Operators(Self::parse_operators(field, map)?))
        } else {
            Ok(ElemMatch::Query(Self::from_json(arg)?))
        }
    }

    fn parse_not(field: &str, arg: &JsonValue) -> Result<Negated> {
        match arg {
            JsonValue::Object(map) => {
                if map.keys().any(|k| !k.starts_with('$')) {
                    return Err(PipeliteError::InvalidQuery(format!(
                        "$not on {:?} requires an operator object",
                        field
                    )));
                }
                Ok(Negated::Operators(Self::parse_operators(field, map)?))
            }
            JsonValue::String(_) => Ok(Negated::Regex(compile_regex(arg, ""))),
            _ => Err(PipeliteError::InvalidQuery(format!(
                "$not on {:?} requires an operator object or a regex",
                field
            ))),
        }
    }

    /// Check whether a document satisfies every condition
    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|condition| condition.matches(document))
    }
}

impl Condition {
    fn matches(&self, document: &Document) -> bool {
        match self {
            Condition::And(queries) => queries.iter().all(|q| q.matches(document)),
            Condition::Or(queries) => queries.iter().any(|q| q.matches(document)),
            Condition::Nor(queries) => !queries.iter().any(|q| q.matches(document)),
            Condition::Expr => {
                warn!("$expr is not implemented in $match; condition evaluates to false");
                false
            }
            Condition::Unsupported(op) => {
                warn!(operator = %op, "unsupported $match operator; document excluded");
                false
            }
            Condition::Field { path, criterion } => {
                let value = document.get_path(path);
                match criterion {
                    Criterion::Equals(expected) => {
                        value.as_deref().unwrap_or(&Value::Null) == expected
                    }
                    Criterion::Operators(operators) => {
                        operators.iter().all(|op| op.matches(value.as_deref(), document))
                    }
                }
            }
        }
    }
}

impl QueryOperator {
    /// `value` is None when the field is missing
    fn matches(&self, value: Option<&Value>, document: &Document) -> bool {
        let resolved = value.unwrap_or(&Value::Null);

        match self {
            QueryOperator::Eq(target) => resolved == target,
            QueryOperator::Ne(target) => resolved != target,
            QueryOperator::Gt(target) => compare_numbers(value, target, |a, b| a > b),
            QueryOperator::Gte(target) => compare_numbers(value, target, |a, b| a >= b),
            QueryOperator::Lt(target) => compare_numbers(value, target, |a, b| a < b),
            QueryOperator::Lte(target) => compare_numbers(value, target, |a, b| a <= b),

            QueryOperator::In(targets) => match targets {
                Value::Array(items) => items.contains(resolved),
                _ => false,
            },
            QueryOperator::Nin(targets) => match targets {
                Value::Array(items) => !items.contains(resolved),
                _ => false,
            },

            QueryOperator::Exists(expected) => match expected {
                Value::Bool(should_exist) => value.is_some() == *should_exist,
                _ => false,
            },
            QueryOperator::Type(type_name) => match type_name {
                Value::String(name) => resolved.type_name() == name,
                _ => false,
            },

            QueryOperator::All(required) => match (resolved, required) {
                (Value::Array(items), Value::Array(required)) => {
                    required.iter().all(|r| items.contains(r))
                }
                _ => false,
            },
            QueryOperator::Size(size) => match (resolved, size) {
                (Value::Array(items), Value::Number(n)) => items.len() as f64 == *n,
                _ => false,
            },
            QueryOperator::ElemMatch(criteria) => match resolved {
                Value::Array(items) => items.iter().any(|item| criteria.matches(item, document)),
                _ => false,
            },

            QueryOperator::Mod(spec) => {
                let Some([divisor, remainder]) = spec.as_array() else {
                    return false;
                };
                match (divisor.to_number(), remainder.to_number(), resolved.to_number()) {
                    (Some(d), Some(r), Some(v)) => v % d == r,
                    _ => false,
                }
            }

            QueryOperator::Regex(regex) => regex_matches(regex.as_ref(), resolved),

            QueryOperator::Not(Negated::Operators(operators)) => {
                !operators.iter().all(|op| op.matches(value, document))
            }
            QueryOperator::Not(Negated::Regex(regex)) => !regex_matches(regex.as_ref(), resolved),

            QueryOperator::Unsupported(op) => {
                warn!(operator = %op, "unsupported $match operator; document excluded");
                false
            }
        }
    }
}

impl ElemMatch {
    fn matches(&self, element: &Value, document: &Document) -> bool {
        match self {
            ElemMatch::Query(query) => match element {
                Value::Document(inner) => query.matches(inner),
                _ => false,
            },
            ElemMatch::Operators(operators) => {
                operators.iter().all(|op| op.matches(Some(element), document))
            }
        }
    }
}

/// Both sides must convert to numbers; a missing field never compares
fn compare_numbers(value: Option<&Value>, target: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (value.and_then(Value::to_number), target.to_number()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn regex_matches(regex: Option<&Regex>, value: &Value) -> bool {
    match (regex, value) {
        (Some(regex), Value::String(s)) => regex.is_match(s),
        _ => false,
    }
}

fn compile_regex(pattern: &JsonValue, options: &str) -> Option<Regex> {
    let pattern = pattern.as_str()?;
    let built = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build();

    match built {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern, error = %e, "invalid $regex pattern; clause never matches");
            None
        }
    }
}
