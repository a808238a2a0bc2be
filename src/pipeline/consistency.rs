//! Cross-checks OCR-only and LLM-assisted derivations of the same field.
//!
//! LLM-primary fields are re-derived with their OCR fallback strategy;
//! OCR-primary fields are re-asked to the LLM in one batched call. When the
//! two values disagree beyond the configured similarity, the field goes to
//! review no matter how confident either path was.

use std::collections::BTreeMap;

use crate::models::{
    ConsistencyScope, FieldResult, LlmStrategy, LlmUsage, ReasonKind, ReviewReason, RuleVersion,
};
use crate::pipeline::extraction::{ExtractionEngine, ExtractionError};
use crate::pipeline::ocr::MergedDocument;

/// One field compared by both paths.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: String,
    pub ocr_value: String,
    pub llm_value: String,
    pub similarity: f32,
}

#[derive(Debug, Default)]
pub struct ConsistencyReport {
    pub comparisons: Vec<Comparison>,
    pub reasons: Vec<ReviewReason>,
    pub warnings: Vec<String>,
    pub usage: LlmUsage,
}

/// Levenshtein distance over characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// `1 - distance / longer length` on lowercased, whitespace-collapsed text.
/// Two empty values are identical.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = normalize(a);
    let b = normalize(b);
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f32 / longest as f32
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub async fn check(
    engine: &ExtractionEngine,
    doc: &MergedDocument,
    rule: &RuleVersion,
    fields: &BTreeMap<String, FieldResult>,
) -> Result<ConsistencyReport, ExtractionError> {
    let settings = &rule.enhancement.consistency;
    let mut report = ConsistencyReport::default();
    if !settings.enabled {
        return Ok(report);
    }

    let leaves: Vec<_> = rule
        .leaves()
        .into_iter()
        .filter(|l| settings.scope == ConsistencyScope::AllFields || l.node.is_key_field())
        .collect();

    let mut pairs: Vec<(String, String, String)> = Vec::new();
    let mut ask_llm = Vec::new();

    for leaf in &leaves {
        let Some(primary) = fields.get(&leaf.path) else {
            continue;
        };
        if leaf.node.effective_strategy().is_llm() {
            let Some(fallback) = leaf.node.fallback().filter(|s| !s.is_llm()) else {
                continue;
            };
            let ocr = engine.run_local(doc, leaf, fallback, rule, &mut report.warnings)?;
            pairs.push((leaf.path.clone(), ocr.value_text(), primary.value_text()));
        } else {
            ask_llm.push((leaf.clone(), LlmStrategy::default()));
        }
    }

    if !ask_llm.is_empty() {
        let batch = engine.ask_llm(doc, rule, &ask_llm).await;
        report.usage.merge(&batch.usage);
        if batch.fields.is_empty() {
            report.warnings.push(
                "Consistency check skipped for OCR-extracted fields: LLM unavailable".into(),
            );
        }
        for (leaf, _) in &ask_llm {
            if let (Some(primary), Some(llm)) = (fields.get(&leaf.path), batch.fields.get(&leaf.path)) {
                pairs.push((leaf.path.clone(), primary.value_text(), llm.value_text()));
            }
        }
    }

    for (field, ocr_value, llm_value) in pairs {
        let score = similarity(&ocr_value, &llm_value);
        tracing::debug!(field = %field, similarity = score, "Consistency comparison");
        if score < settings.threshold {
            report.reasons.push(ReviewReason::field(
                ReasonKind::ConsistencyMismatch,
                &field,
                format!(
                    "OCR and LLM disagree on '{field}': '{ocr_value}' vs '{llm_value}' (similarity {score:.2})"
                ),
            ));
        }
        report.comparisons.push(Comparison {
            field,
            ocr_value,
            llm_value,
            similarity: score,
        });
    }

    Ok(report)
}
