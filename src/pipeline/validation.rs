//! Declarative checks over cleaned values. Every failure becomes a
//! structured, field-attributed `ReviewReason`; validation never fails a
//! Task by itself.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use super::cleaning::coerce;
use super::expression;
use crate::models::{
    is_empty_value, value_to_text, Check, FieldResult, FieldType, ReasonKind, ReviewReason, RuleVersion,
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValidationReport {
    pub reasons: Vec<ReviewReason>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }

    /// Adds a reason unless one of the same kind already targets the same field.
    pub fn push(&mut self, reason: ReviewReason) {
        let duplicate = self
            .reasons
            .iter()
            .any(|r| r.kind == reason.kind && r.field == reason.field);
        if !duplicate {
            self.reasons.push(reason);
        }
    }
}

/// Nested view of the fields, as expressions see them.
pub fn fields_json(fields: &BTreeMap<String, FieldResult>) -> Value {
    let mut root = serde_json::Map::new();
    for (path, field) in fields {
        let mut current = &mut root;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                current.insert(part.to_string(), field.value.clone());
                break;
            }
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            match entry {
                Value::Object(map) => current = map,
                _ => break,
            }
        }
    }
    Value::Object(root)
}

/// Value of a field path: a leaf, or a column of a table leaf.
fn lookup(fields: &BTreeMap<String, FieldResult>, path: &str) -> Option<Value> {
    if let Some(field) = fields.get(path) {
        return Some(field.value.clone());
    }
    let (table, column) = path.rsplit_once('.')?;
    let rows = fields.get(table)?.value.as_array()?;
    Some(Value::Array(
        rows.iter()
            .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
            .collect(),
    ))
}

pub fn validate(fields: &BTreeMap<String, FieldResult>, rule: &RuleVersion) -> ValidationReport {
    let mut report = ValidationReport::default();
    let root = fields_json(fields);

    for validation in &rule.validation {
        let message = |default: String| validation.message.clone().unwrap_or(default);

        let Some(path) = validation.field.as_deref() else {
            if let Check::Expression { expr } = &validation.check {
                check_expression(&mut report, &root, fields, expr, None, validation.message.as_deref());
            }
            continue;
        };

        let value = lookup(fields, path).unwrap_or(Value::Null);
        let empty = is_empty_value(&value);

        match &validation.check {
            Check::Required => {
                if empty {
                    report.push(ReviewReason::field(
                        ReasonKind::MissingRequired,
                        path,
                        message(format!("Required field '{path}' is missing")),
                    ));
                }
            }
            _ if empty => {}
            Check::Pattern { regex } => {
                let re = match Regex::new(regex) {
                    Ok(re) => re,
                    Err(e) => {
                        report.warnings.push(format!("Pattern for '{path}' is invalid: {e}"));
                        continue;
                    }
                };
                if let Some(bad) = scalars(&value).into_iter().find(|v| !re.is_match(&value_to_text(v))) {
                    report.push(ReviewReason::field(
                        ReasonKind::PatternMismatch,
                        path,
                        message(format!("'{}' does not match {regex}", value_to_text(bad))),
                    ));
                }
            }
            Check::Range { min, max } => {
                for item in scalars(&value) {
                    let number = coerce(item, FieldType::Number).and_then(|n| n.as_f64());
                    let verdict = match number {
                        None => Some(format!("'{}' is not a number", value_to_text(item))),
                        Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => Some(
                            format!("{n} is outside [{}, {}]", bound(*min), bound(*max)),
                        ),
                        Some(_) => None,
                    };
                    if let Some(detail) = verdict {
                        report.push(ReviewReason::field(ReasonKind::OutOfRange, path, message(detail)));
                        break;
                    }
                }
            }
            Check::Length { min, max } => {
                let length = match &value {
                    Value::Array(items) => items.len(),
                    other => value_to_text(other).chars().count(),
                };
                if min.is_some_and(|m| length < m) || max.is_some_and(|m| length > m) {
                    report.push(ReviewReason::field(
                        ReasonKind::LengthViolation,
                        path,
                        message(format!(
                            "length {length} is outside [{}, {}]",
                            bound(min.map(|m| m as f64)),
                            bound(max.map(|m| m as f64))
                        )),
                    ));
                }
            }
            Check::Expression { expr } => {
                check_expression(&mut report, &root, fields, expr, Some(path), validation.message.as_deref());
            }
        }
    }

    let threshold = rule.enhancement.confidence_threshold;
    for (path, field) in fields {
        if !field.is_empty() && field.confidence < threshold {
            report.push(ReviewReason::field(
                ReasonKind::LowConfidence,
                path,
                format!("Confidence {:.1} is below {:.1}", field.confidence, threshold),
            ));
        }
    }

    report
}

/// Cross-field expressions are skipped while any field they read is empty;
/// the missing value is reported by its own required check.
fn check_expression(
    report: &mut ValidationReport,
    root: &Value,
    fields: &BTreeMap<String, FieldResult>,
    expr: &str,
    field: Option<&str>,
    message: Option<&str>,
) {
    let parsed = match expression::parse(expr) {
        Ok(parsed) => parsed,
        Err(e) => {
            report.warnings.push(format!("Expression '{expr}' is invalid: {e}"));
            return;
        }
    };
    let reads_empty = parsed
        .fields()
        .iter()
        .any(|p| lookup(fields, p).map_or(true, |v| is_empty_value(&v)));
    if reads_empty {
        tracing::debug!(expr, "Expression skipped: a referenced field is empty");
        return;
    }

    let detail = match expression::check(&parsed, root) {
        Ok(true) => return,
        Ok(false) => format!("Expression failed: {expr}"),
        Err(e) => format!("Expression '{expr}' could not be evaluated: {e}"),
    };
    let detail = message.map(str::to_string).unwrap_or(detail);
    report.push(match field {
        Some(path) => ReviewReason::field(ReasonKind::ExpressionFailed, path, detail),
        None => ReviewReason::task(ReasonKind::ExpressionFailed, detail),
    });
}

fn scalars(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
        other => vec![other],
    }
}

fn bound(limit: Option<f64>) -> String {
    limit.map_or_else(|| "-".to_string(), |l| l.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;
    use serde_json::json;

    fn field(value: Value, confidence: f32) -> FieldResult {
        FieldResult {
            value,
            confidence,
            source_page: Some(1),
            strategy: StrategyKind::Regex,
            row_pages: vec![],
            raw_value: None,
        }
    }

    fn rule(validation: Value) -> RuleVersion {
        serde_json::from_value(json!({
            "rule_id": "r", "version": 1,
            "schema": [],
            "validation": validation
        }))
        .unwrap()
    }

    fn fields(entries: &[(&str, Value, f32)]) -> BTreeMap<String, FieldResult> {
        entries
            .iter()
            .map(|(k, v, c)| (k.to_string(), field(v.clone(), *c)))
            .collect()
    }

    #[test]
    fn one_missing_required_field_is_the_only_reason() {
        let r = rule(json!([
            { "field": "number", "check": { "type": "required" } },
            { "field": "number", "check": { "type": "pattern", "regex": "^INV-" } },
            { "field": "total", "check": { "type": "required" } }
        ]));
        let report = validate(
            &fields(&[("number", Value::Null, 0.0), ("total", json!(10.0), 90.0)]),
            &r,
        );
        assert_eq!(report.reasons.len(), 1);
        assert_eq!(report.reasons[0].kind, ReasonKind::MissingRequired);
        assert_eq!(report.reasons[0].field.as_deref(), Some("number"));
        assert!(!report.passed());
    }

    #[test]
    fn pattern_range_and_length() {
        let r = rule(json!([
            { "field": "number", "check": { "type": "pattern", "regex": "^INV-\\d{4}$" } },
            { "field": "total", "check": { "type": "range", "min": 0, "max": 100 } },
            { "field": "code", "check": { "type": "length", "min": 3, "max": 3 } }
        ]));
        let report = validate(
            &fields(&[
                ("number", json!("INV-12"), 90.0),
                ("total", json!("250.00"), 90.0),
                ("code", json!("EURO"), 90.0),
            ]),
            &r,
        );
        let kinds: Vec<ReasonKind> = report.reasons.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ReasonKind::PatternMismatch, ReasonKind::OutOfRange, ReasonKind::LengthViolation]
        );
    }

    #[test]
    fn cross_field_expression_is_task_level() {
        let r = rule(json!([
            { "check": { "type": "expression", "expr": "total == subtotal + tax" } }
        ]));
        let ok = validate(
            &fields(&[("total", json!(12.0), 90.0), ("subtotal", json!(10.0), 90.0), ("tax", json!(2.0), 90.0)]),
            &r,
        );
        assert!(ok.passed());

        let bad = validate(
            &fields(&[("total", json!(13.0), 90.0), ("subtotal", json!(10.0), 90.0), ("tax", json!(2.0), 90.0)]),
            &r,
        );
        assert_eq!(bad.reasons.len(), 1);
        assert_eq!(bad.reasons[0].kind, ReasonKind::ExpressionFailed);
        assert_eq!(bad.reasons[0].field, None);
    }

    #[test]
    fn expression_over_empty_field_is_skipped() {
        let r = rule(json!([
            { "check": { "type": "expression", "expr": "total > 0" } }
        ]));
        assert!(validate(&fields(&[("total", Value::Null, 0.0)]), &r).passed());
    }

    #[test]
    fn expression_over_table_column() {
        let r = rule(json!([
            { "field": "total", "check": { "type": "expression", "expr": "sum(lines.amount) == total" },
              "message": "Line amounts do not add up" }
        ]));
        let report = validate(
            &fields(&[
                ("lines", json!([{ "amount": 4.0 }, { "amount": 5.0 }]), 90.0),
                ("total", json!(10.0), 90.0),
            ]),
            &r,
        );
        assert_eq!(report.reasons.len(), 1);
        assert_eq!(report.reasons[0].field.as_deref(), Some("total"));
        assert_eq!(report.reasons[0].message, "Line amounts do not add up");
    }

    #[test]
    fn low_confidence_only_for_non_empty_values() {
        let r = rule(json!([]));
        let report = validate(
            &fields(&[("a", json!("x"), 40.0), ("b", Value::Null, 0.0), ("c", json!("y"), 75.0)]),
            &r,
        );
        assert_eq!(report.reasons.len(), 1);
        assert_eq!(report.reasons[0].kind, ReasonKind::LowConfidence);
        assert_eq!(report.reasons[0].field.as_deref(), Some("a"));
    }

    #[test]
    fn nested_paths_become_nested_json() {
        let json = fields_json(&fields(&[("invoice.total", json!(5), 90.0), ("vendor", json!("A"), 90.0)]));
        assert_eq!(json, json!({ "invoice": { "total": 5 }, "vendor": "A" }));
    }
}
