use std::collections::BTreeMap;

use serde_json::Value;

use super::confidence::{quality, score};
use super::llm::{self, LlmField, EXTRACTION_SYSTEM_PROMPT};
use super::{anchor, pattern, table, Candidate, ExtractionError};
use crate::models::{
    value_to_text, ContextScope, FieldResult, LeafField, LlmStrategy, LlmUsage, RuleVersion, Strategy,
    StrategyKind,
};
use crate::pipeline::llm::{GuardedLlm, LlmError};
use crate::pipeline::ocr::MergedDocument;

/// Per-field results of one extraction pass.
#[derive(Debug, Default)]
pub struct ExtractionOutput {
    pub fields: BTreeMap<String, FieldResult>,
    pub warnings: Vec<String>,
    pub usage: LlmUsage,
}

/// LLM answers for a batch of fields. Paths absent from `fields` could not
/// be asked (breaker open, call failed, unparseable answer).
#[derive(Debug, Default)]
pub struct LlmBatch {
    pub fields: BTreeMap<String, FieldResult>,
    pub usage: LlmUsage,
    pub warnings: Vec<String>,
    pub unavailable: bool,
}

pub fn strategy_kind(strategy: &Strategy) -> StrategyKind {
    match strategy {
        Strategy::Regex(_) => StrategyKind::Regex,
        Strategy::Anchor(_) => StrategyKind::Anchor,
        Strategy::Table(_) => StrategyKind::Table,
        Strategy::Llm(_) => StrategyKind::Llm,
    }
}

/// Dispatches every schema leaf to its strategy. LLM leaves are batched per
/// context scope into one call each and degrade to their OCR fallback when
/// the LLM cannot answer.
#[derive(Clone, Default)]
pub struct ExtractionEngine {
    llm: Option<GuardedLlm>,
}

impl ExtractionEngine {
    pub fn new(llm: Option<GuardedLlm>) -> Self {
        Self { llm }
    }

    pub fn ocr_only() -> Self {
        Self { llm: None }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn extract(&self, doc: &MergedDocument, rule: &RuleVersion) -> Result<ExtractionOutput, ExtractionError> {
        let mut out = ExtractionOutput::default();
        let leaves = rule.leaves();
        let mut llm_leaves = Vec::new();

        for leaf in &leaves {
            match leaf.node.effective_strategy() {
                Strategy::Llm(settings) => llm_leaves.push((leaf.clone(), settings)),
                strategy => {
                    let result = self.run_local(doc, leaf, &strategy, rule, &mut out.warnings)?;
                    out.fields.insert(leaf.path.clone(), result);
                }
            }
        }

        if !llm_leaves.is_empty() {
            let batch = self.ask_llm(doc, rule, &llm_leaves).await;
            out.usage.merge(&batch.usage);
            out.warnings.extend(batch.warnings);

            for (leaf, _) in &llm_leaves {
                if let Some(result) = batch.fields.get(&leaf.path) {
                    out.fields.insert(leaf.path.clone(), result.clone());
                    continue;
                }
                let result = match leaf.node.fallback().filter(|s| !s.is_llm()) {
                    Some(fallback) => {
                        tracing::warn!(field = %leaf.path, "LLM unavailable, using OCR fallback strategy");
                        out.warnings
                            .push(format!("Field '{}' extracted by OCR fallback", leaf.path));
                        self.run_local(doc, leaf, fallback, rule, &mut out.warnings)?
                    }
                    None => {
                        out.warnings
                            .push(format!("Field '{}' left empty: LLM unavailable", leaf.path));
                        FieldResult::empty(StrategyKind::Llm)
                    }
                };
                out.fields.insert(leaf.path.clone(), result);
            }
        }

        tracing::debug!(
            fields = out.fields.len(),
            llm_calls = out.usage.calls,
            warnings = out.warnings.len(),
            "Extraction finished"
        );
        Ok(out)
    }

    /// Run a non-LLM strategy for one leaf and score the result.
    pub fn run_local(
        &self,
        doc: &MergedDocument,
        leaf: &LeafField<'_>,
        strategy: &Strategy,
        rule: &RuleVersion,
        warnings: &mut Vec<String>,
    ) -> Result<FieldResult, ExtractionError> {
        let kind = strategy_kind(strategy);
        let candidate = match strategy {
            Strategy::Regex(s) => pattern::extract(doc, s)?,
            Strategy::Anchor(s) => {
                let found = anchor::extract(doc, s)?;
                if found.is_none() {
                    tracing::warn!(field = %leaf.path, anchor = %s.anchor, "Anchor not found");
                    warnings.push(format!("Anchor '{}' not found for field '{}'", s.anchor, leaf.path));
                }
                found
            }
            Strategy::Table(s) => table::extract(doc, s, leaf.node),
            Strategy::Llm(_) => {
                return Err(ExtractionError::Internal(format!(
                    "field '{}' routed an LLM strategy to local extraction",
                    leaf.path
                )))
            }
        };

        Ok(match candidate {
            Some(c) => scored(doc, c, kind, rule),
            None => FieldResult::empty(kind),
        })
    }

    /// One call per distinct context scope. Never fails: problems become
    /// warnings and the affected paths are left out of the batch.
    pub async fn ask_llm(
        &self,
        doc: &MergedDocument,
        rule: &RuleVersion,
        leaves: &[(LeafField<'_>, LlmStrategy)],
    ) -> LlmBatch {
        let mut batch = LlmBatch::default();
        let Some(llm) = &self.llm else {
            batch.unavailable = true;
            batch.warnings.push("LLM not configured; OCR-only extraction".into());
            return batch;
        };

        let settings = &rule.enhancement.llm;
        let mut groups: Vec<(ContextScope, Vec<LlmField<'_>>)> = Vec::new();
        for (leaf, strategy) in leaves {
            let field = LlmField {
                path: leaf.path.clone(),
                node: leaf.node,
                instruction: strategy.instruction.clone(),
            };
            match groups.iter_mut().find(|(scope, _)| *scope == strategy.scope) {
                Some((_, fields)) => fields.push(field),
                None => groups.push((strategy.scope.clone(), vec![field])),
            }
        }

        for (scope, fields) in groups {
            let context = llm::context_for(doc, &scope, settings.max_context_chars);
            let prompt = llm::build_prompt(&context, &fields);
            let response = match llm
                .generate(&rule.circuit_breaker, &settings.model, &prompt, EXTRACTION_SYSTEM_PROMPT)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, LlmError::CircuitOpen { .. }) {
                        batch.unavailable = true;
                    }
                    batch.warnings.push(format!("LLM degraded to OCR-only: {e}"));
                    continue;
                }
            };
            batch.usage.record(
                response.prompt_tokens,
                response.completion_tokens,
                settings.cost_per_1k_tokens,
            );

            let paths: Vec<&str> = fields.iter().map(|f| f.path.as_str()).collect();
            let answers = match llm::parse_response(&response.text, &paths) {
                Ok(answers) => answers,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unparseable LLM answer");
                    batch.warnings.push(format!("LLM answer discarded: {e}"));
                    continue;
                }
            };
            for (path, answer) in answers {
                let mut candidate = Candidate::new(
                    answer.value.clone(),
                    llm::source_page_for(doc, &answer.value),
                    answer.confidence.unwrap_or(quality::LLM_DEFAULT),
                );
                candidate.ocr_confidence = Some(doc.mean_confidence());
                batch
                    .fields
                    .insert(path, scored(doc, candidate, StrategyKind::Llm, rule));
            }
        }
        batch
    }
}

fn scored(doc: &MergedDocument, candidate: Candidate, kind: StrategyKind, rule: &RuleVersion) -> FieldResult {
    let is_empty = crate::models::is_empty_value(&candidate.value);
    let ocr_confidence = candidate.ocr_confidence.unwrap_or_else(|| {
        let text = match &candidate.value {
            Value::String(s) => s.clone(),
            other => value_to_text(other),
        };
        doc.confidence_for(candidate.source_page, &text)
    });
    FieldResult {
        confidence: score(
            &rule.enhancement.weights,
            ocr_confidence,
            candidate.match_quality,
            is_empty,
        ),
        value: candidate.value,
        source_page: candidate.source_page,
        strategy: kind,
        row_pages: candidate.row_pages,
        raw_value: None,
    }
}
