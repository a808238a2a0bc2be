//! Ordered per-field transforms applied after extraction.
//!
//! Cleaning never fails a Task: an operation that cannot apply leaves the
//! value as it was and records a warning, and validation decides what that
//! means. Table columns are addressed as `<table>.<column>`.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Number, Value};

use crate::models::{value_to_text, CleaningOp, CleaningRule, FieldResult, FieldType};

/// Formats tried when coercing text to a date.
pub const DEFAULT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

pub const ISO_DATE: &str = "%Y-%m-%d";

/// Apply every cleaning rule in order. Returns warnings.
pub fn apply(fields: &mut BTreeMap<String, FieldResult>, rules: &[CleaningRule]) -> Vec<String> {
    let mut warnings = Vec::new();
    for rule in rules {
        if let Some(field) = fields.get_mut(&rule.field) {
            let original = field.value.clone();
            field.value = clean_value(original.clone(), &rule.ops, &rule.field, &mut warnings);
            remember_raw(field, original);
            continue;
        }

        let Some((table, column)) = split_table_path(fields, &rule.field) else {
            warnings.push(format!("Cleaning rule targets unknown field '{}'", rule.field));
            continue;
        };
        let Some(field) = fields.get_mut(&table) else {
            continue;
        };
        let original = field.value.clone();
        if let Value::Array(rows) = &mut field.value {
            for row in rows.iter_mut() {
                if let Some(cell) = row.as_object_mut().and_then(|o| o.get_mut(&column)) {
                    *cell = clean_value(cell.take(), &rule.ops, &rule.field, &mut warnings);
                }
            }
        }
        remember_raw(field, original);
    }
    warnings
}

fn remember_raw(field: &mut FieldResult, original: Value) {
    if field.raw_value.is_none() && field.value != original {
        field.raw_value = Some(original);
    }
}

/// `lines.amount` -> (`lines`, `amount`) when `lines` is an extracted field.
fn split_table_path(fields: &BTreeMap<String, FieldResult>, path: &str) -> Option<(String, String)> {
    let (table, column) = path.rsplit_once('.')?;
    fields
        .contains_key(table)
        .then(|| (table.to_string(), column.to_string()))
}

/// Run the op chain on one value. Scalar arrays are cleaned element-wise.
pub fn clean_value(value: Value, ops: &[CleaningOp], path: &str, warnings: &mut Vec<String>) -> Value {
    if let Value::Array(items) = value {
        return Value::Array(
            items
                .into_iter()
                .map(|item| clean_value(item, ops, path, warnings))
                .collect(),
        );
    }
    let mut current = value;
    for op in ops {
        if current.is_null() {
            break;
        }
        match apply_op(&current, op) {
            Ok(next) => current = next,
            Err(message) => {
                tracing::debug!(field = path, error = %message, "Cleaning op skipped");
                warnings.push(format!("Field '{path}': {message}"));
            }
        }
    }
    current
}

/// Render `date` with a strftime `output`. Time specifiers and malformed
/// specifiers cannot be rendered for a bare date and are an error.
pub fn format_date(date: NaiveDate, output: &str) -> Result<String, String> {
    let mut rendered = String::new();
    write!(rendered, "{}", date.format(output))
        .map_err(|_| format!("'{output}' is not a valid date output format"))?;
    Ok(rendered)
}

fn apply_op(value: &Value, op: &CleaningOp) -> Result<Value, String> {
    match op {
        CleaningOp::RegexReplace { pattern, replacement } => {
            let re = Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
            map_text(value, |s| re.replace_all(s, replacement.as_str()).into_owned())
        }
        CleaningOp::Trim => map_text(value, |s| s.trim().to_string()),
        CleaningOp::CollapseWhitespace => {
            map_text(value, |s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        CleaningOp::Uppercase => map_text(value, str::to_uppercase),
        CleaningOp::Lowercase => map_text(value, str::to_lowercase),
        CleaningOp::DateNormalize { formats, output } => {
            let text = value_to_text(value);
            let formats: Vec<&str> = formats.iter().map(String::as_str).collect();
            let date = parse_date(&text, &formats)
                .ok_or_else(|| format!("'{text}' matches none of the date formats"))?;
            format_date(date, output).map(Value::String)
        }
        CleaningOp::NumberFormat {
            decimals,
            decimal_separator,
        } => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                other => parse_number(&value_to_text(other), Some(*decimal_separator)),
            }
            .ok_or_else(|| format!("'{}' is not a number", value_to_text(value)))?;
            let factor = 10f64.powi(*decimals as i32);
            float_value((number * factor).round() / factor)
                .ok_or_else(|| format!("{number} is not representable"))
        }
        CleaningOp::Coerce { to } => coerce(value, *to)
            .ok_or_else(|| format!("cannot coerce '{}' to {}", value_to_text(value), to.as_str())),
    }
}

/// String ops leave non-string values untouched.
fn map_text(value: &Value, f: impl Fn(&str) -> String) -> Result<Value, String> {
    Ok(match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    })
}

fn float_value(number: f64) -> Option<Value> {
    Number::from_f64(number).map(Value::Number)
}

/// Convert a value to the declared type; `None` when it does not parse.
/// Null stays null.
pub fn coerce(value: &Value, to: FieldType) -> Option<Value> {
    match (to, value) {
        (_, Value::Null) => Some(Value::Null),
        (FieldType::String, v) => Some(Value::String(value_to_text(v))),
        (FieldType::Number, Value::Number(n)) => n.as_f64().and_then(float_value),
        (FieldType::Number, Value::String(s)) => parse_number(s, None).and_then(float_value),
        (FieldType::Integer, Value::Number(n)) => n
            .as_i64()
            .map(Value::from)
            .or_else(|| n.as_f64().and_then(whole).map(Value::from)),
        (FieldType::Integer, Value::String(s)) => parse_number(s, None).and_then(whole).map(Value::from),
        (FieldType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
        (FieldType::Boolean, Value::Number(n)) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "x" => Some(Value::Bool(true)),
            "false" | "no" | "n" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Date, Value::String(s)) => {
            parse_date(s, DEFAULT_DATE_FORMATS).map(|d| Value::String(d.format(ISO_DATE).to_string()))
        }
        _ => None,
    }
}

fn whole(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

pub fn parse_date(text: &str, formats: &[&str]) -> Option<NaiveDate> {
    let text = text.trim();
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

/// Parse a printed amount: `"1,250.00"`, `"1.250,00 EUR"`, `"$ -3.5"`,
/// `"(12.00)"`. Words other than a currency code of up to three letters
/// make the text a non-number. `decimal` forces the decimal mark; without
/// it the mark is guessed from the separators present.
pub fn parse_number(text: &str, decimal: Option<char>) -> Option<f64> {
    let mut numeric = String::new();
    for token in text.split_whitespace() {
        let is_code = token.len() <= 3 && token.chars().all(|c| c.is_ascii_alphabetic());
        if is_code {
            continue;
        }
        if token.chars().any(char::is_alphabetic) {
            return None;
        }
        numeric.push_str(token);
    }

    let trimmed = numeric.trim_matches(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '(' | ')' | '.' | ',')));
    let negative = trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let decimal = decimal.unwrap_or_else(|| guess_decimal_mark(&kept));
    let normalized: String = kept
        .chars()
        .filter_map(|c| match c {
            d if d.is_ascii_digit() => Some(d),
            c if c == decimal => Some('.'),
            _ => None,
        })
        .collect();
    let magnitude: f64 = normalized.parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn guess_decimal_mark(digits: &str) -> char {
    let last_dot = digits.rfind('.');
    let last_comma = digits.rfind(',');
    match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            if c > d {
                ','
            } else {
                '.'
            }
        }
        (None, Some(c)) => {
            let single = digits.matches(',').count() == 1;
            let tail = digits.len() - c - 1;
            if single && tail != 3 {
                ','
            } else {
                '.'
            }
        }
        (Some(_), None) if digits.matches('.').count() > 1 => ',',
        _ => '.',
    }
}
