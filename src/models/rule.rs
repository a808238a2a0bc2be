//! Immutable, versioned processing rules bound to a Task at creation time.
//!
//! A `RuleVersion` is plain data: which OCR engines to use, which pages to
//! read, the field schema with one extraction strategy per leaf, the cleaning
//! pipeline, validation checks, enhancement settings and webhook bindings.
//! Documents are JSON and go through `RuleVersion::validate` on load.

use serde::{Deserialize, Serialize};

use super::enums::FieldType;

/// Deepest nesting allowed in a field schema.
pub const MAX_SCHEMA_DEPTH: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVersion {
    pub rule_id: String,
    pub version: u32,
    #[serde(default)]
    pub ocr: OcrSettings,
    pub schema: Vec<SchemaNode>,
    #[serde(default)]
    pub cleaning: Vec<CleaningRule>,
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    #[serde(default)]
    pub enhancement: EnhancementSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Ids of webhook targets; target configuration is resolved at push time.
    #[serde(default)]
    pub webhooks: Vec<String>,
}

// ---------------------------------------------------------------------------
// OCR settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub engine: String,
    pub fallbacks: Vec<String>,
    pub page_strategy: PageStrategy,
    /// Inserted between pages in the merged text.
    pub separator: String,
    /// Page counts above this are OCR'd in parallel.
    pub parallel_threshold: usize,
    pub max_workers: usize,
    pub timeout: OcrTimeout,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            engine: "default".into(),
            fallbacks: Vec::new(),
            page_strategy: PageStrategy::All,
            separator: "\n".into(),
            parallel_threshold: 5,
            max_workers: 4,
            timeout: OcrTimeout::default(),
        }
    }
}

/// Wall-clock bound for a document: `base + per_page * pages`, capped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrTimeout {
    pub base_secs: u64,
    pub per_page_secs: u64,
    pub ceiling_secs: u64,
}

impl Default for OcrTimeout {
    fn default() -> Self {
        Self {
            base_secs: 30,
            per_page_secs: 10,
            ceiling_secs: 600,
        }
    }
}

impl OcrTimeout {
    pub fn for_pages(&self, pages: usize) -> std::time::Duration {
        let secs = self
            .base_secs
            .saturating_add(self.per_page_secs.saturating_mul(pages as u64))
            .min(self.ceiling_secs);
        std::time::Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageStrategy {
    /// One fixed 1-based page.
    Single { page: usize },
    All,
    /// e.g. `"1-3, 5, last"`.
    Expression { expr: String },
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Recursive field schema. `Object` groups children; `Field`, `Array` and
/// `Table` are extraction leaves, each resolved by exactly one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum SchemaNode {
    Object {
        key: String,
        children: Vec<SchemaNode>,
    },
    Array {
        key: String,
        #[serde(default = "default_field_type")]
        item_type: FieldType,
        /// Element shape, described to the LLM. Empty for scalar arrays.
        #[serde(default)]
        items: Vec<SchemaNode>,
        #[serde(default)]
        strategy: Option<Strategy>,
        #[serde(default)]
        fallback: Option<Strategy>,
        #[serde(default)]
        key_field: bool,
    },
    Table {
        key: String,
        columns: Vec<TableColumn>,
        #[serde(default)]
        strategy: Option<Strategy>,
        #[serde(default)]
        fallback: Option<Strategy>,
        #[serde(default)]
        key_field: bool,
    },
    Field {
        key: String,
        #[serde(default = "default_field_type")]
        field_type: FieldType,
        #[serde(default)]
        strategy: Option<Strategy>,
        /// OCR-only strategy used when the LLM is unavailable and as the
        /// independent derivation for consistency checks.
        #[serde(default)]
        fallback: Option<Strategy>,
        #[serde(default)]
        key_field: bool,
        #[serde(default)]
        description: Option<String>,
    },
}

fn default_field_type() -> FieldType {
    FieldType::String
}

impl SchemaNode {
    pub fn key(&self) -> &str {
        match self {
            Self::Object { key, .. }
            | Self::Array { key, .. }
            | Self::Table { key, .. }
            | Self::Field { key, .. } => key,
        }
    }

    /// Nesting depth of this node, counting itself.
    pub fn depth(&self) -> usize {
        match self {
            Self::Object { children, .. } => {
                1 + children.iter().map(SchemaNode::depth).max().unwrap_or(0)
            }
            Self::Array { items, .. } => 1 + items.iter().map(SchemaNode::depth).max().unwrap_or(0),
            Self::Table { .. } | Self::Field { .. } => 1,
        }
    }

    /// Every extraction leaf with its dotted path, in schema order.
    pub fn leaves<'a>(&'a self, prefix: &str, out: &mut Vec<LeafField<'a>>) {
        let path = if prefix.is_empty() {
            self.key().to_string()
        } else {
            format!("{prefix}.{}", self.key())
        };
        match self {
            Self::Object { children, .. } => {
                for child in children {
                    child.leaves(&path, out);
                }
            }
            _ => out.push(LeafField { path, node: self }),
        }
    }

    /// Configured strategy, or the default for this node kind: LLM for
    /// composite values and plain fields, table detection for tables.
    pub fn effective_strategy(&self) -> Strategy {
        match self {
            Self::Table { strategy, .. } => strategy
                .clone()
                .unwrap_or(Strategy::Table(TableStrategy::default())),
            Self::Array { strategy, .. } | Self::Field { strategy, .. } => {
                strategy.clone().unwrap_or(Strategy::Llm(LlmStrategy::default()))
            }
            Self::Object { .. } => Strategy::Llm(LlmStrategy::default()),
        }
    }

    pub fn fallback(&self) -> Option<&Strategy> {
        match self {
            Self::Array { fallback, .. } | Self::Table { fallback, .. } | Self::Field { fallback, .. } => {
                fallback.as_ref()
            }
            Self::Object { .. } => None,
        }
    }

    pub fn is_key_field(&self) -> bool {
        match self {
            Self::Array { key_field, .. } | Self::Table { key_field, .. } | Self::Field { key_field, .. } => {
                *key_field
            }
            Self::Object { .. } => false,
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Field { field_type, .. } => Some(*field_type),
            _ => None,
        }
    }
}

/// A schema leaf paired with its dotted path.
#[derive(Debug, Clone)]
pub struct LeafField<'a> {
    pub path: String,
    pub node: &'a SchemaNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub key: String,
    /// Header text as printed in the document.
    pub header: String,
    #[serde(default = "default_field_type")]
    pub field_type: FieldType,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Regex(RegexStrategy),
    Anchor(AnchorStrategy),
    Table(TableStrategy),
    Llm(LlmStrategy),
}

impl Strategy {
    pub fn is_llm(&self) -> bool {
        matches!(self, Self::Llm(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexStrategy {
    pub pattern: String,
    /// Capture group to read. Defaults to group 1 when the pattern has one, else the whole match.
    #[serde(default)]
    pub group: Option<CaptureGroup>,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureGroup {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    FirstMatch,
    AllMatches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorStrategy {
    pub anchor: String,
    #[serde(default)]
    pub direction: AnchorDirection,
    /// Text window read after the anchor.
    #[serde(default = "default_anchor_window")]
    pub max_chars: usize,
    /// When set and blocks carry coordinates, read the nearest block within
    /// this pixel offset instead of the text window.
    #[serde(default)]
    pub max_offset_px: Option<u32>,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
}

fn default_anchor_window() -> usize {
    40
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorDirection {
    #[default]
    Right,
    Below,
    RightBelow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableStrategy {
    /// Header keywords identifying the table. Empty = heuristic detection only.
    pub header_keywords: Vec<String>,
    pub min_header_matches: usize,
    /// For a scalar field: the column to read.
    pub column: Option<String>,
    /// For a scalar field: 0-based data row to read.
    pub row: usize,
}

impl Default for TableStrategy {
    fn default() -> Self {
        Self {
            header_keywords: Vec::new(),
            min_header_matches: 2,
            column: None,
            row: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmStrategy {
    pub scope: ContextScope,
    /// Extra guidance appended to the prompt for this field.
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextScope {
    #[default]
    FullText,
    FirstPages { count: usize },
    /// 1-based inclusive page range, truncated to `max_chars`.
    Region {
        start_page: usize,
        end_page: usize,
        max_chars: usize,
    },
}

// ---------------------------------------------------------------------------
// Cleaning & validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningRule {
    pub field: String,
    pub ops: Vec<CleaningOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CleaningOp {
    RegexReplace { pattern: String, replacement: String },
    Trim,
    CollapseWhitespace,
    Uppercase,
    Lowercase,
    /// Parse with the first matching chrono format, re-emit with `output`.
    DateNormalize { formats: Vec<String>, output: String },
    NumberFormat {
        decimals: u32,
        #[serde(default = "default_decimal_separator")]
        decimal_separator: char,
    },
    Coerce { to: FieldType },
}

fn default_decimal_separator() -> char {
    '.'
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Field path; `None` for cross-field expressions.
    #[serde(default)]
    pub field: Option<String>,
    pub check: Check,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    Required,
    Pattern { regex: String },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Boolean expression over field paths, e.g. `total == subtotal + tax`.
    Expression { expr: String },
}

// ---------------------------------------------------------------------------
// Enhancement, consistency, breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementSettings {
    /// Fields scoring below this (0-100) go to manual review.
    pub confidence_threshold: f32,
    pub weights: ConfidenceWeights,
    pub consistency: ConsistencySettings,
    pub llm: LlmSettings,
}

impl Default for EnhancementSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 60.0,
            weights: ConfidenceWeights::default(),
            consistency: ConsistencySettings::default(),
            llm: LlmSettings::default(),
        }
    }
}

/// Weights for `100 * (ocr * ocr_conf + strategy * match_quality)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub ocr: f32,
    pub strategy: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            ocr: 0.6,
            strategy: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencySettings {
    pub enabled: bool,
    /// Similarity (0.0-1.0) below which a field is a mismatch.
    pub threshold: f32,
    pub scope: ConsistencyScope,
}

impl Default for ConsistencySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.8,
            scope: ConsistencyScope::KeyFieldsOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyScope {
    AllFields,
    #[default]
    KeyFieldsOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub cost_per_1k_tokens: f64,
    /// Hard cap on context characters sent in one prompt.
    pub max_context_chars: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".into(),
            cost_per_1k_tokens: 0.0,
            max_context_chars: 12_000,
        }
    }
}

/// Thresholds for the process-wide breaker guarding a dependency. The first
/// rule to reach a dependency configures its breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub call_timeout_secs: u64,
    pub cooldown_secs: u64,
    /// A single timeout trips the breaker.
    pub trip_on_timeout: bool,
    /// A single server-side (5xx) error trips the breaker.
    pub trip_on_server_error: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout_secs: 60,
            cooldown_secs: 300,
            trip_on_timeout: true,
            trip_on_server_error: true,
        }
    }
}

impl RuleVersion {
    /// All extraction leaves in schema order.
    pub fn leaves(&self) -> Vec<LeafField<'_>> {
        let mut out = Vec::new();
        for node in &self.schema {
            node.leaves("", &mut out);
        }
        out
    }

    pub fn leaf(&self, path: &str) -> Option<&SchemaNode> {
        self.leaves().into_iter().find(|l| l.path == path).map(|l| l.node)
    }

    pub fn required_fields(&self) -> Vec<&str> {
        self.validation
            .iter()
            .filter(|r| r.check == Check::Required)
            .filter_map(|r| r.field.as_deref())
            .collect()
    }
}
