use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ErrorClass, ReasonKind, Stage, StrategyKind, TaskState};
use super::page::PageOcr;

/// Where the uploaded bytes live and what they hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Hex SHA-256 of the file bytes.
    pub content_hash: String,
    /// Opaque pointer returned by the blob store.
    pub storage_ref: String,
    pub file_name: String,
    pub size_bytes: u64,
}

/// One extracted value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub value: serde_json::Value,
    /// Normalised 0-100.
    pub confidence: f32,
    pub source_page: Option<usize>,
    pub strategy: StrategyKind,
    /// Per-row source pages for table values, in row order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_pages: Vec<usize>,
    /// Value before the cleaning pipeline ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<serde_json::Value>,
}

impl FieldResult {
    pub fn empty(strategy: StrategyKind) -> Self {
        Self {
            value: serde_json::Value::Null,
            confidence: 0.0,
            source_page: None,
            strategy,
            row_pages: Vec::new(),
            raw_value: None,
        }
    }

    /// Null, empty string, empty array and empty object all count as "no value".
    pub fn is_empty(&self) -> bool {
        is_empty_value(&self.value)
    }

    /// String rendering used for similarity comparison and templates.
    pub fn value_text(&self) -> String {
        value_to_text(&self.value)
    }
}

pub fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Why a Task needs a human. Field-attributed where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReason {
    pub kind: ReasonKind,
    pub field: Option<String>,
    pub message: String,
}

impl ReviewReason {
    pub fn field(kind: ReasonKind, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn task(kind: ReasonKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            message: message.into(),
        }
    }
}

/// Stage-attributed failure recorded when a Task reaches `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: Stage,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost: f64,
}

impl LlmUsage {
    pub fn record(&mut self, prompt_tokens: u64, completion_tokens: u64, cost_per_1k: f64) {
        self.calls += 1;
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.estimated_cost += (prompt_tokens + completion_tokens) as f64 / 1000.0 * cost_per_1k;
    }

    pub fn merge(&mut self, other: &LlmUsage) {
        self.calls += other.calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.estimated_cost += other.estimated_cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A reviewer's edit to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCorrection {
    pub field: String,
    pub previous: serde_json::Value,
    pub corrected: serde_json::Value,
    pub corrected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// One entry of the reconstructed timeline: how long the Task stayed in a state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub state: TaskState,
    pub entered_at: DateTime<Utc>,
    /// `None` for the current state.
    pub duration_ms: Option<i64>,
    pub note: Option<String>,
}

/// One processing attempt for one file under one immutable rule version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub file: FileRef,
    pub fingerprint: String,
    pub page_count: usize,
    pub rule_id: String,
    pub rule_version: u32,
    pub state: TaskState,
    /// Result was cloned from a prior Task with the same fingerprint.
    pub instant: bool,
    pub reused_from: Option<Uuid>,
    pub merged_text: String,
    pub pages: Vec<PageOcr>,
    pub fields: BTreeMap<String, FieldResult>,
    pub review_reasons: Vec<ReviewReason>,
    pub warnings: Vec<String>,
    pub failure: Option<FailureInfo>,
    pub llm_usage: LlmUsage,
    pub corrections: Vec<FieldCorrection>,
    pub transitions: Vec<Transition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a Task in `Queued`, recording the creation transition.
    pub fn queued(file: FileRef, fingerprint: String, rule_id: &str, rule_version: u32) -> Self {
        Self::with_initial_state(file, fingerprint, rule_id, rule_version, TaskState::Queued, None)
    }

    pub(crate) fn with_initial_state(
        file: FileRef,
        fingerprint: String,
        rule_id: &str,
        rule_version: u32,
        state: TaskState,
        note: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            file,
            fingerprint,
            page_count: 0,
            rule_id: rule_id.to_string(),
            rule_version,
            state,
            instant: false,
            reused_from: None,
            merged_text: String::new(),
            pages: Vec::new(),
            fields: BTreeMap::new(),
            review_reasons: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            llm_usage: LlmUsage::default(),
            corrections: Vec::new(),
            transitions: vec![Transition {
                from: None,
                to: state,
                at: now,
                note,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Extracted values as a nested JSON object, keyed by dotted path.
    pub fn result_json(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for (path, field) in &self.fields {
            insert_path(&mut root, path, field.value.clone());
        }
        serde_json::Value::Object(root)
    }

    /// Mean field confidence; 0 when nothing was extracted.
    pub fn overall_confidence(&self) -> f32 {
        if self.fields.is_empty() {
            return 0.0;
        }
        self.fields.values().map(|f| f.confidence).sum::<f32>() / self.fields.len() as f32
    }

    /// Ordered state history with per-state durations.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries = Vec::with_capacity(self.transitions.len());
        for (i, t) in self.transitions.iter().enumerate() {
            let duration_ms = self
                .transitions
                .get(i + 1)
                .map(|next| (next.at - t.at).num_milliseconds());
            entries.push(TimelineEntry {
                state: t.to,
                entered_at: t.at,
                duration_ms,
                note: t.note.clone(),
            });
        }
        entries
    }

    /// Timestamp at which the Task entered `state`, if it ever did.
    pub fn entered_at(&self, state: TaskState) -> Option<DateTime<Utc>> {
        self.transitions.iter().find(|t| t.to == state).map(|t| t.at)
    }

    pub fn reason_fields(&self) -> Vec<&str> {
        self.review_reasons
            .iter()
            .filter_map(|r| r.field.as_deref())
            .collect()
    }
}

fn insert_path(root: &mut serde_json::Map<String, serde_json::Value>, path: &str, value: serde_json::Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = serde_json::Value::Object(serde_json::Map::new());
        }
        current = match entry {
            serde_json::Value::Object(map) => map,
            _ => return,
        };
    }
}
