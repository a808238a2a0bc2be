//! Rule store collaborator: immutable RuleVersions and webhook targets.
//!
//! RuleVersions never change once published, so `CachedRuleStore` keeps them
//! forever. Targets are mutable configuration and are always read fresh,
//! which is what lets a dead-lettered push be retried against the current
//! URL and secret.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{
    CaptureGroup, Check, CleaningOp, ContextScope, ErrorClass, PageStrategy, RuleVersion, SchemaNode, Strategy,
    WebhookTarget, MAX_SCHEMA_DEPTH,
};
use crate::pipeline::cleaning::format_date;
use crate::pipeline::expression;
use crate::pipeline::extraction::pattern;
use crate::pipeline::ocr::PageExpression;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule not found: {rule_id} v{version}")]
    NotFound { rule_id: String, version: u32 },

    #[error("Webhook target not found: {0}")]
    TargetNotFound(String),

    #[error("Invalid rule {rule_id} v{version}: {}", problems.join("; "))]
    Invalid {
        rule_id: String,
        version: u32,
        problems: Vec<String>,
    },

    #[error("Rule {rule_id} v{version} is already published")]
    AlreadyPublished { rule_id: String, version: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed rule document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rule store lock poisoned")]
    LockPoisoned,
}

impl RuleError {
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::LockPoisoned => ErrorClass::TransientIo,
            Self::TargetNotFound(_) => ErrorClass::Delivery,
            _ => ErrorClass::Content,
        }
    }
}

// ---------------------------------------------------------------------------
// Load-time validation
// ---------------------------------------------------------------------------

impl RuleVersion {
    /// Structural checks run whenever a rule is loaded or published. Every
    /// problem is reported, not just the first.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut problems = Vec::new();

        if self.rule_id.trim().is_empty() {
            problems.push("rule_id is empty".to_string());
        }
        if self.version == 0 {
            problems.push("versions start at 1".to_string());
        }

        self.validate_ocr(&mut problems);

        check_siblings(&self.schema, "", &mut problems);
        for node in &self.schema {
            if node.depth() > MAX_SCHEMA_DEPTH {
                problems.push(format!(
                    "schema under '{}' is deeper than {MAX_SCHEMA_DEPTH} levels",
                    node.key()
                ));
            }
        }
        for leaf in self.leaves() {
            if let Some(strategy) = node_strategy(leaf.node) {
                check_strategy(&leaf.path, strategy, &mut problems);
            }
            if let Some(fallback) = leaf.node.fallback() {
                if fallback.is_llm() {
                    problems.push(format!("fallback for '{}' must not use the LLM", leaf.path));
                }
                check_strategy(&leaf.path, fallback, &mut problems);
            }
        }

        for rule in &self.cleaning {
            if !self.has_path(&rule.field) {
                problems.push(format!("cleaning targets unknown field '{}'", rule.field));
            }
            for op in &rule.ops {
                match op {
                    CleaningOp::RegexReplace { pattern: p, .. } => {
                        if let Err(e) = pattern::compile(p, false) {
                            problems.push(format!("cleaning for '{}': {e}", rule.field));
                        }
                    }
                    CleaningOp::DateNormalize { output, .. } if output.trim().is_empty() => {
                        problems.push(format!("date_normalize for '{}' has no output format", rule.field));
                    }
                    CleaningOp::DateNormalize { output, .. } => {
                        if let Err(e) = format_date(NaiveDate::MIN, output) {
                            problems.push(format!("date_normalize for '{}': {e}", rule.field));
                        }
                    }
                    _ => {}
                }
            }
        }

        for rule in &self.validation {
            match (&rule.field, &rule.check) {
                (Some(field), _) if !self.has_path(field) => {
                    problems.push(format!("validation targets unknown field '{field}'"));
                }
                (None, Check::Expression { .. }) => {}
                (None, check) => problems.push(format!("{check:?} check needs a field")),
                _ => {}
            }
            match &rule.check {
                Check::Pattern { regex } => {
                    if let Err(e) = pattern::compile(regex, false) {
                        problems.push(e.to_string());
                    }
                }
                Check::Range {
                    min: Some(min),
                    max: Some(max),
                } if min > max => problems.push(format!("range {min}..{max} is empty")),
                Check::Length {
                    min: Some(min),
                    max: Some(max),
                } if min > max => problems.push(format!("length {min}..{max} is empty")),
                Check::Expression { expr } => self.check_expression(expr, &mut problems),
                _ => {}
            }
        }

        self.validate_enhancement(&mut problems);

        let mut seen = HashSet::new();
        for id in &self.webhooks {
            if id.trim().is_empty() {
                problems.push("webhook target id is empty".to_string());
            } else if !seen.insert(id.as_str()) {
                problems.push(format!("webhook target '{id}' is bound twice"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Invalid {
                rule_id: self.rule_id.clone(),
                version: self.version,
                problems,
            })
        }
    }

    fn validate_ocr(&self, problems: &mut Vec<String>) {
        if self.ocr.engine.trim().is_empty() {
            problems.push("OCR engine is empty".to_string());
        }
        if self.ocr.max_workers == 0 {
            problems.push("OCR max_workers must be at least 1".to_string());
        }
        match &self.ocr.page_strategy {
            PageStrategy::Single { page: 0 } => problems.push("pages are numbered from 1".to_string()),
            PageStrategy::Expression { expr } => {
                if let Err(e) = PageExpression::parse(expr) {
                    problems.push(e.to_string());
                }
            }
            _ => {}
        }
    }

    fn validate_enhancement(&self, problems: &mut Vec<String>) {
        let e = &self.enhancement;
        if !(0.0..=100.0).contains(&e.confidence_threshold) {
            problems.push(format!("confidence threshold {} is outside 0-100", e.confidence_threshold));
        }
        if e.weights.ocr < 0.0 || e.weights.strategy < 0.0 || e.weights.ocr + e.weights.strategy <= 0.0 {
            problems.push("confidence weights must be non-negative and not both zero".to_string());
        }
        if !(0.0..=1.0).contains(&e.consistency.threshold) {
            problems.push(format!("consistency threshold {} is outside 0-1", e.consistency.threshold));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("breaker failure_threshold must be at least 1".to_string());
        }
    }

    fn check_expression(&self, expr: &str, problems: &mut Vec<String>) {
        match expression::parse(expr) {
            Ok(parsed) => {
                if let Err(e) = parsed.check_functions() {
                    problems.push(format!("expression '{expr}': {e}"));
                }
                for field in parsed.fields() {
                    if !self.has_path(field) {
                        problems.push(format!("expression '{expr}' reads unknown field '{field}'"));
                    }
                }
            }
            Err(e) => problems.push(format!("expression '{expr}': {e}")),
        }
    }

    /// A leaf path, or `<table>.<column>` / `<array>.<item>` inside one.
    pub fn has_path(&self, path: &str) -> bool {
        if self.leaf(path).is_some() {
            return true;
        }
        let Some((parent, child)) = path.rsplit_once('.') else {
            return false;
        };
        match self.leaf(parent) {
            Some(SchemaNode::Table { columns, .. }) => columns.iter().any(|c| c.key == child),
            Some(SchemaNode::Array { items, .. }) => items.iter().any(|i| i.key() == child),
            _ => false,
        }
    }
}

fn node_strategy(node: &SchemaNode) -> Option<&Strategy> {
    match node {
        SchemaNode::Field { strategy, .. }
        | SchemaNode::Array { strategy, .. }
        | SchemaNode::Table { strategy, .. } => strategy.as_ref(),
        SchemaNode::Object { .. } => None,
    }
}

fn check_siblings(nodes: &[SchemaNode], prefix: &str, problems: &mut Vec<String>) {
    let mut keys = HashSet::new();
    for node in nodes {
        let key = node.key();
        let path = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        };
        if key.trim().is_empty() || key.contains('.') {
            problems.push(format!("invalid field key '{path}'"));
        }
        if !keys.insert(key) {
            problems.push(format!("duplicate field key '{path}'"));
        }
        match node {
            SchemaNode::Object { children, .. } => check_siblings(children, &path, problems),
            SchemaNode::Array { items, .. } => check_siblings(items, &path, problems),
            SchemaNode::Table { columns, .. } => {
                if columns.is_empty() {
                    problems.push(format!("table '{path}' has no columns"));
                }
                let mut seen = HashSet::new();
                for column in columns {
                    if !seen.insert(column.key.as_str()) {
                        problems.push(format!("duplicate column '{}' in '{path}'", column.key));
                    }
                }
            }
            SchemaNode::Field { .. } => {}
        }
    }
}

fn check_strategy(path: &str, strategy: &Strategy, problems: &mut Vec<String>) {
    match strategy {
        Strategy::Regex(regex) => match pattern::compile(&regex.pattern, regex.case_insensitive) {
            Ok(compiled) => {
                let group_exists = match &regex.group {
                    Some(CaptureGroup::Index(i)) => *i < compiled.captures_len(),
                    Some(CaptureGroup::Name(name)) => compiled.capture_names().any(|n| n == Some(name.as_str())),
                    None => true,
                };
                if !group_exists {
                    problems.push(format!("regex for '{path}' has no group {:?}", regex.group));
                }
            }
            Err(e) => problems.push(format!("'{path}': {e}")),
        },
        Strategy::Anchor(anchor) => {
            if anchor.anchor.trim().is_empty() {
                problems.push(format!("anchor for '{path}' is empty"));
            }
            if anchor.max_chars == 0 {
                problems.push(format!("anchor window for '{path}' is zero"));
            }
        }
        Strategy::Table(_) => {}
        Strategy::Llm(llm) => match llm.scope {
            ContextScope::FirstPages { count: 0 } => {
                problems.push(format!("LLM scope for '{path}' reads zero pages"));
            }
            ContextScope::Region {
                start_page,
                end_page,
                ..
            } if start_page == 0 || start_page > end_page => {
                problems.push(format!("LLM region {start_page}-{end_page} for '{path}' is invalid"));
            }
            _ => {}
        },
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub trait RuleStore: Send + Sync {
    fn get_config(&self, rule_id: &str, version: u32) -> Result<Arc<RuleVersion>, RuleError>;
    fn get_target(&self, target_id: &str) -> Result<WebhookTarget, RuleError>;
}

/// Store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<(String, u32), Arc<RuleVersion>>>,
    targets: RwLock<HashMap<String, WebhookTarget>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish. A published (rule_id, version) is never replaced.
    pub fn publish(&self, rule: RuleVersion) -> Result<Arc<RuleVersion>, RuleError> {
        rule.validate()?;
        let mut rules = self.rules.write().map_err(|_| RuleError::LockPoisoned)?;
        let key = (rule.rule_id.clone(), rule.version);
        if rules.contains_key(&key) {
            return Err(RuleError::AlreadyPublished {
                rule_id: rule.rule_id,
                version: rule.version,
            });
        }
        let rule = Arc::new(rule);
        rules.insert(key, rule.clone());
        Ok(rule)
    }

    pub fn put_target(&self, target: WebhookTarget) -> Result<(), RuleError> {
        self.targets
            .write()
            .map_err(|_| RuleError::LockPoisoned)?
            .insert(target.id.clone(), target);
        Ok(())
    }
}

impl RuleStore for InMemoryRuleStore {
    fn get_config(&self, rule_id: &str, version: u32) -> Result<Arc<RuleVersion>, RuleError> {
        self.rules
            .read()
            .map_err(|_| RuleError::LockPoisoned)?
            .get(&(rule_id.to_string(), version))
            .cloned()
            .ok_or_else(|| RuleError::NotFound {
                rule_id: rule_id.to_string(),
                version,
            })
    }

    fn get_target(&self, target_id: &str) -> Result<WebhookTarget, RuleError> {
        self.targets
            .read()
            .map_err(|_| RuleError::LockPoisoned)?
            .get(target_id)
            .cloned()
            .ok_or_else(|| RuleError::TargetNotFound(target_id.to_string()))
    }
}

/// JSON documents on disk: `<root>/rules/<rule_id>/v<version>.json` and
/// `<root>/targets/<target_id>.json`.
pub struct DirRuleStore {
    root: PathBuf,
}

impl DirRuleStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn rule_path(&self, rule_id: &str, version: u32) -> PathBuf {
        self.root.join("rules").join(rule_id).join(format!("v{version}.json"))
    }

    fn target_path(&self, target_id: &str) -> PathBuf {
        self.root.join("targets").join(format!("{target_id}.json"))
    }

    pub fn publish(&self, rule: &RuleVersion) -> Result<(), RuleError> {
        rule.validate()?;
        if !is_safe_id(&rule.rule_id) {
            return Err(RuleError::Invalid {
                rule_id: rule.rule_id.clone(),
                version: rule.version,
                problems: vec!["rule_id must be alphanumeric, '-' or '_'".to_string()],
            });
        }
        let path = self.rule_path(&rule.rule_id, rule.version);
        if path.exists() {
            return Err(RuleError::AlreadyPublished {
                rule_id: rule.rule_id.clone(),
                version: rule.version,
            });
        }
        write_json(&path, &serde_json::to_string_pretty(rule)?)?;
        tracing::info!(rule_id = %rule.rule_id, version = rule.version, "Published rule version");
        Ok(())
    }

    pub fn put_target(&self, target: &WebhookTarget) -> Result<(), RuleError> {
        write_json(&self.target_path(&target.id), &serde_json::to_string_pretty(target)?)
    }
}

fn write_json(path: &Path, body: &str) -> Result<(), RuleError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

impl RuleStore for DirRuleStore {
    fn get_config(&self, rule_id: &str, version: u32) -> Result<Arc<RuleVersion>, RuleError> {
        let not_found = || RuleError::NotFound {
            rule_id: rule_id.to_string(),
            version,
        };
        if !is_safe_id(rule_id) {
            return Err(not_found());
        }
        let raw = match std::fs::read_to_string(self.rule_path(rule_id, version)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let rule: RuleVersion = serde_json::from_str(&raw)?;
        if rule.rule_id != rule_id || rule.version != version {
            return Err(RuleError::Invalid {
                rule_id: rule_id.to_string(),
                version,
                problems: vec![format!(
                    "document declares {} v{}",
                    rule.rule_id, rule.version
                )],
            });
        }
        rule.validate()?;
        Ok(Arc::new(rule))
    }

    fn get_target(&self, target_id: &str) -> Result<WebhookTarget, RuleError> {
        if !is_safe_id(target_id) {
            return Err(RuleError::TargetNotFound(target_id.to_string()));
        }
        match std::fs::read_to_string(self.target_path(target_id)) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RuleError::TargetNotFound(target_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Caches RuleVersions for the life of the process.
pub struct CachedRuleStore<S> {
    inner: S,
    cache: Mutex<HashMap<(String, u32), Arc<RuleVersion>>>,
}

impl<S: RuleStore> CachedRuleStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: RuleStore> RuleStore for CachedRuleStore<S> {
    fn get_config(&self, rule_id: &str, version: u32) -> Result<Arc<RuleVersion>, RuleError> {
        let key = (rule_id.to_string(), version);
        if let Some(rule) = self.cache.lock().map_err(|_| RuleError::LockPoisoned)?.get(&key) {
            return Ok(rule.clone());
        }
        let rule = self.inner.get_config(rule_id, version)?;
        self.cache
            .lock()
            .map_err(|_| RuleError::LockPoisoned)?
            .insert(key, rule.clone());
        Ok(rule)
    }

    fn get_target(&self, target_id: &str) -> Result<WebhookTarget, RuleError> {
        self.inner.get_target(target_id)
    }
}
