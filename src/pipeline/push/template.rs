//! Request body rendering with `{{variable}}` placeholders.
//!
//! Variables: `task_id`, `rule_id`, `rule_version`, `file_url`, `file_name`,
//! `content_hash`, `confidence`, `result_json`, `metadata`, and
//! `result.<path>` for a single extracted value. JSON-valued variables are
//! substituted as JSON text. Strings are substituted as-is into text bodies
//! and JSON-escaped into JSON bodies, so a template like `"{{file_name}}"`
//! stays valid whatever the file is called.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{json, Value};

use super::PushError;
use crate::models::{value_to_text, Task};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").expect("static regex")
});

/// How string values are written into a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Text,
}

impl BodyFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Variable text, and whether it is already JSON.
struct Substitution {
    text: String,
    json: bool,
}

impl Substitution {
    fn write(self, format: BodyFormat) -> String {
        if self.json || format == BodyFormat::Text {
            return self.text;
        }
        let quoted = Value::String(self.text).to_string();
        quoted[1..quoted.len() - 1].to_string()
    }
}

const JSON_VARS: &[&str] = &["result_json", "metadata"];

pub struct TemplateContext {
    vars: BTreeMap<&'static str, String>,
    result: Value,
    metadata: Value,
}

impl TemplateContext {
    pub fn for_task(task: &Task, file_url: &str) -> Self {
        let result = task.result_json();
        let metadata = json!({
            "file_name": task.file.file_name,
            "content_hash": task.file.content_hash,
            "size_bytes": task.file.size_bytes,
            "page_count": task.page_count,
            "confidence": task.overall_confidence(),
            "instant": task.instant,
            "corrected_fields": task.corrections.iter().map(|c| c.field.as_str()).collect::<Vec<_>>(),
            "warnings": task.warnings,
            "llm_usage": task.llm_usage,
        });

        let mut vars = BTreeMap::new();
        vars.insert("task_id", task.id.to_string());
        vars.insert("rule_id", task.rule_id.clone());
        vars.insert("rule_version", task.rule_version.to_string());
        vars.insert("file_url", file_url.to_string());
        vars.insert("file_name", task.file.file_name.clone());
        vars.insert("content_hash", task.file.content_hash.clone());
        vars.insert("confidence", format!("{:.1}", task.overall_confidence()));
        vars.insert("result_json", result.to_string());
        vars.insert("metadata", metadata.to_string());

        Self { vars, result, metadata }
    }

    /// Body sent when a target declares no template.
    pub fn envelope(&self) -> String {
        let var = |name: &str| self.vars.get(name).cloned().unwrap_or_default();
        json!({
            "task_id": var("task_id"),
            "rule_id": var("rule_id"),
            "rule_version": var("rule_version").parse::<u32>().unwrap_or_default(),
            "file_url": var("file_url"),
            "result": self.result,
            "metadata": self.metadata,
        })
        .to_string()
    }

    fn lookup(&self, name: &str) -> Option<Substitution> {
        if let Some(path) = name.strip_prefix("result.") {
            let value = path
                .split('.')
                .try_fold(&self.result, |node, key| node.get(key))
                .unwrap_or(&Value::Null);
            return Some(match value {
                Value::Array(_) | Value::Object(_) => Substitution {
                    text: value.to_string(),
                    json: true,
                },
                other => Substitution {
                    text: value_to_text(other),
                    json: false,
                },
            });
        }
        self.vars.get(name).map(|text| Substitution {
            text: text.clone(),
            json: JSON_VARS.contains(&name),
        })
    }
}

pub fn render(template: &str, ctx: &TemplateContext, format: BodyFormat) -> Result<String, PushError> {
    let mut unknown = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match ctx.lookup(name) {
            Some(sub) => sub.write(format),
            None => {
                unknown.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match unknown {
        Some(name) => Err(PushError::Template(format!("unknown variable '{name}'"))),
        None => Ok(rendered.into_owned()),
    }
}
