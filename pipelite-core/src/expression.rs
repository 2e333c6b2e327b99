// pipelite-core/src/expression.rs
// Aggregation expression language shared by $project, $addFields, $group and friends

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::document::Document;
use crate::error::{PipeliteError, Result};
use crate::value::Value;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value
    Literal(Value),
    /// `"$a.b"` - dotted path into the current document
    FieldRef(String),
    /// `{"$op": <args>}`
    Operator { name: String, args: Box<Expr> },
    /// Arrays evaluate element-wise
    Array(Vec<Expr>),
    /// Object literal evaluated field-by-field
    Object(Vec<(String, Expr)>),
}

type OperatorFn = fn(&Document, &Expr) -> Result<Value>;

static OPERATORS: Lazy<HashMap<&'static str, OperatorFn>> = Lazy::new(|| {
    let mut ops: HashMap<&'static str, OperatorFn> = HashMap::new();
    // String
    ops.insert("$concat", op_concat);
    ops.insert("$substr", op_substr);
    ops.insert("$dateToString", op_date_to_string);
    ops.insert("$toString", op_to_string);
    ops.insert("$toLower", op_to_lower);
    ops.insert("$toUpper", op_to_upper);
    // Arithmetic
    ops.insert("$add", op_add);
    ops.insert("$subtract", op_subtract);
    ops.insert("$multiply", op_multiply);
    ops.insert("$divide", op_divide);
    ops.insert("$mod", op_mod);
    // Logical
    ops.insert("$and", op_and);
    ops.insert("$or", op_or);
    ops.insert("$not", op_not);
    // Conditional
    ops.insert("$cond", op_cond);
    ops.insert("$ifNull", op_if_null);
    ops
});

impl Expr {
    /// Parse an expression from its JSON form. Never fails: unknown operators
    /// are reported when the expression is evaluated.
    pub fn parse(json: &JsonValue) -> Self {
        match json {
            JsonValue::String(s) if s.len() > 1 && s.starts_with('$') => {
                Expr::FieldRef(s[1..].to_string())
            }
            JsonValue::Array(items) => Expr::Array(items.iter().map(Expr::parse).collect()),
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some((name, args)) = map.iter().next() {
                        if name == "$literal" {
                            return Expr::Literal(Value::from(args));
                        }
                        if name.starts_with('$') {
                            return Expr::Operator {
                                name: name.clone(),
                                args: Box::new(Expr::parse(args)),
                            };
                        }
                    }
                }
                Expr::Object(
                    map.iter()
                        .map(|(key, value)| (key.clone(), Expr::parse(value)))
                        .collect(),
                )
            }
            other => Expr::Literal(Value::from(other)),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Evaluate against one document. Unresolved field paths give Null;
    /// unknown operators are an error.
    pub fn evaluate(&self, doc: &Document) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::FieldRef(path) => Ok(doc
                .get_path(path)
                .map(|v| v.into_owned())
                .unwrap_or(Value::Null)),
            Expr::Array(items) => items
                .iter()
                .map(|item| item.evaluate(doc))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Object(fields) => {
                let mut out = Document::new();
                for (key, expr) in fields {
                    out.set(key.clone(), expr.evaluate(doc)?);
                }
                Ok(Value::Document(out))
            }
            Expr::Operator { name, args } => match OPERATORS.get(name.as_str()) {
                Some(op) => op(doc, args),
                None => Err(PipeliteError::UnsupportedOperator(name.clone())),
            },
        }
    }
}

fn operands(args: &Expr) -> Option<&[Expr]> {
    match args {
        Expr::Array(items) => Some(items),
        _ => None,
    }
}

fn named_operand<'a>(args: &'a Expr, name: &str) -> Option<&'a Expr> {
    match args {
        Expr::Object(fields) => fields.iter().find(|(key, _)| key == name).map(|(_, e)| e),
        _ => None,
    }
}

/// Operand of a unary operator, accepting `x` and `[x]`
fn unary_operand(doc: &Document, args: &Expr) -> Result<Value> {
    match operands(args) {
        Some([single]) => single.evaluate(doc),
        _ => args.evaluate(doc),
    }
}

fn number_of(doc: &Document, expr: &Expr) -> Result<f64> {
    Ok(expr.evaluate(doc)?.to_number().unwrap_or(0.0))
}

fn op_concat(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(items) = operands(args) else {
        return Ok(Value::from(""));
    };

    let mut out = String::new();
    for item in items {
        match item.evaluate(doc)? {
            Value::Null => {}
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_display_string()),
        }
    }
    Ok(Value::String(out))
}

fn op_substr(doc: &Document, args: &Expr) -> Result<Value> {
    let Some([text, start, length]) = operands(args) else {
        return Ok(Value::from(""));
    };

    let text = match text.evaluate(doc)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_display_string(),
    };
    let start = number_of(doc, start)?.floor();
    let length = number_of(doc, length)?.floor();

    let char_count = text.chars().count();
    if start < 0.0 || start as usize >= char_count {
        return Ok(Value::from(""));
    }

    let chars = text.chars().skip(start as usize);
    let substring: String = if length < 0.0 {
        chars.collect()
    } else {
        chars.take(length as usize).collect()
    };
    Ok(Value::String(substring))
}

fn op_date_to_string(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(date_expr) = named_operand(args, "date") else {
        return Ok(Value::Null);
    };
    let format = match named_operand(args, "format") {
        Some(expr) => expr.evaluate(doc)?.as_str().map(str::to_owned),
        None => None,
    };
    let format = format
        .filter(|f| is_valid_strftime(f))
        .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());

    match date_expr.evaluate(doc)? {
        Value::String(raw) => match parse_date(&raw) {
            Some(date) => {
                let mut out = String::new();
                if write!(out, "{}", date.format(&format)).is_err() {
                    // Specifier not applicable to this date value
                    return Ok(Value::String(raw));
                }
                Ok(Value::String(out))
            }
            None => Ok(Value::String(raw)),
        },
        Value::Null => Ok(Value::Null),
        other => Ok(Value::String(other.to_display_string())),
    }
}

fn is_valid_strftime(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

fn parse_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc().fixed_offset());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

fn op_to_string(doc: &Document, args: &Expr) -> Result<Value> {
    Ok(Value::String(unary_operand(doc, args)?.to_display_string()))
}

fn op_to_lower(doc: &Document, args: &Expr) -> Result<Value> {
    Ok(Value::String(
        unary_operand(doc, args)?.to_display_string().to_lowercase(),
    ))
}

fn op_to_upper(doc: &Document, args: &Expr) -> Result<Value> {
    Ok(Value::String(
        unary_operand(doc, args)?.to_display_string().to_uppercase(),
    ))
}

fn op_add(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(items) = operands(args) else {
        return Ok(Value::Null);
    };
    let mut sum = 0.0;
    for item in items {
        sum += number_of(doc, item)?;
    }
    Ok(Value::Number(sum))
}

fn op_subtract(doc: &Document, args: &Expr) -> Result<Value> {
    let Some([first, rest @ ..]) = operands(args) else {
        return Ok(Value::Null);
    };
    if rest.is_empty() {
        return Ok(Value::Null);
    }
    let mut result = number_of(doc, first)?;
    for item in rest {
        result -= number_of(doc, item)?;
    }
    Ok(Value::Number(result))
}

fn op_multiply(doc: &Document, args: &Expr) -> Result<Value> {
    let items = match operands(args) {
        Some(items) if !items.is_empty() => items,
        _ => return Ok(Value::Null),
    };
    let mut product = 1.0;
    for item in items {
        product *= number_of(doc, item)?;
    }
    Ok(Value::Number(product))
}

fn op_divide(doc: &Document, args: &Expr) -> Result<Value> {
    let Some([first, rest @ ..]) = operands(args) else {
        return Ok(Value::Null);
    };
    if rest.is_empty() {
        return Ok(Value::Null);
    }
    let mut result = number_of(doc, first)?;
    for item in rest {
        let divisor = number_of(doc, item)?;
        if divisor == 0.0 {
            return Ok(Value::Null);
        }
        result /= divisor;
    }
    Ok(Value::Number(result))
}

fn op_mod(doc: &Document, args: &Expr) -> Result<Value> {
    let Some([left, right]) = operands(args) else {
        return Ok(Value::Null);
    };
    let dividend = number_of(doc, left)?;
    let divisor = number_of(doc, right)?;
    if divisor == 0.0 {
        return Ok(Value::Null);
    }
    Ok(Value::Number(dividend % divisor))
}

fn op_and(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(items) = operands(args) else {
        return Ok(Value::Bool(false));
    };
    for item in items {
        if !item.evaluate(doc)?.is_truthy() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn op_or(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(items) = operands(args) else {
        return Ok(Value::Bool(false));
    };
    for item in items {
        if item.evaluate(doc)?.is_truthy() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn op_not(doc: &Document, args: &Expr) -> Result<Value> {
    Ok(Value::Bool(!unary_operand(doc, args)?.is_truthy()))
}

fn op_cond(doc: &Document, args: &Expr) -> Result<Value> {
    let branches = match args {
        Expr::Array(items) => match items.as_slice() {
            [cond, then, otherwise] => Some((Some(cond), Some(then), Some(otherwise))),
            _ => None,
        },
        Expr::Object(_) => Some((
            named_operand(args, "if"),
            named_operand(args, "then"),
            named_operand(args, "else"),
        )),
        _ => None,
    };
    let Some((cond, then, otherwise)) = branches else {
        return Ok(Value::Null);
    };

    let take_then = match cond {
        Some(cond) => cond.evaluate(doc)?.is_truthy(),
        None => false,
    };
    let branch = if take_then { then } else { otherwise };
    match branch {
        Some(expr) => expr.evaluate(doc),
        None => Ok(Value::Null),
    }
}

fn op_if_null(doc: &Document, args: &Expr) -> Result<Value> {
    let Some(items) = operands(args) else {
        return args.evaluate(doc);
    };
    for item in items {
        let value = item.evaluate(doc)?;
        if !value.is_null() {
            return Ok(value);
        }
    }
    Ok(Value::Null)
}
