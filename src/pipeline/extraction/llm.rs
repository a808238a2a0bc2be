use std::collections::BTreeMap;

use serde_json::Value;

use super::confidence::normalize_reported;
use super::ExtractionError;
use crate::models::{value_to_text, ContextScope, SchemaNode};
use crate::pipeline::ocr::MergedDocument;

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a document data extraction assistant. Your ONLY role is to read the
document text you are given and return the requested fields as JSON.

RULES:
1. Extract ONLY information explicitly present in the document.
2. Never guess. If a field is missing or unreadable, its value is null.
3. Copy values verbatim (numbers, dates, identifiers) unless a type is requested.
4. Output exactly one JSON object and nothing else.
"#;

/// One LLM-resolved leaf with its prompt hints.
#[derive(Debug, Clone)]
pub struct LlmField<'a> {
    pub path: String,
    pub node: &'a SchemaNode,
    pub instruction: Option<String>,
}

/// Parsed answer for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmAnswer {
    pub value: Value,
    /// Self-reported, normalised to 0.0-1.0.
    pub confidence: Option<f32>,
}

/// Text sent to the model for a scope, capped at `max_context_chars`.
pub fn context_for(doc: &MergedDocument, scope: &ContextScope, max_context_chars: usize) -> String {
    let text = match scope {
        ContextScope::FullText => doc.text.clone(),
        ContextScope::FirstPages { count } => doc
            .pages
            .iter()
            .take(*count)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(&doc.separator),
        ContextScope::Region {
            start_page,
            end_page,
            max_chars,
        } => truncate_chars(&doc.text_for_pages(*start_page, *end_page), *max_chars),
    };
    truncate_chars(&text, max_context_chars)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Build the extraction prompt for a group of fields sharing one context.
pub fn build_prompt(context: &str, fields: &[LlmField<'_>]) -> String {
    let mut listing = String::new();
    for field in fields {
        listing.push_str(&format!("- \"{}\": {}", field.path, describe(field.node)));
        if let SchemaNode::Field {
            description: Some(description),
            ..
        } = field.node
        {
            listing.push_str(&format!(". {description}"));
        }
        if let Some(instruction) = &field.instruction {
            listing.push_str(&format!(". {instruction}"));
        }
        listing.push('\n');
    }

    format!(
        r#"<document>
{context}
</document>

Extract the fields below from the document above.
Answer with ONE JSON object whose keys are the field paths exactly as listed.
Each value is an object {{"value": <extracted value or null>, "confidence": <0.0-1.0>}}.

Fields:
{listing}"#
    )
}

fn describe(node: &SchemaNode) -> String {
    match node {
        SchemaNode::Field { field_type, .. } => field_type.as_str().to_string(),
        SchemaNode::Array { item_type, items, .. } if items.is_empty() => {
            format!("array of {}", item_type.as_str())
        }
        SchemaNode::Array { items, .. } => format!(
            "array of objects with keys {}",
            items
                .iter()
                .map(|i| format!("{} ({})", i.key(), describe(i)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        SchemaNode::Table { columns, .. } => format!(
            "array of rows, each an object with keys {}",
            columns
                .iter()
                .map(|c| format!("{} (column \"{}\", {})", c.key, c.header, c.field_type.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        SchemaNode::Object { children, .. } => format!(
            "object with keys {}",
            children.iter().map(SchemaNode::key).collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Parse the model's answer. Keys may be flat dotted paths or nested
/// objects; values may be wrapped as `{value, confidence}` or bare.
/// Requested paths missing from the answer come back as null.
pub fn parse_response(response: &str, paths: &[&str]) -> Result<BTreeMap<String, LlmAnswer>, ExtractionError> {
    let json = extract_json_object(response)
        .ok_or_else(|| ExtractionError::LlmOutput("no JSON object in response".into()))?;
    let root: Value =
        serde_json::from_str(json).map_err(|e| ExtractionError::LlmOutput(e.to_string()))?;
    let Value::Object(map) = &root else {
        return Err(ExtractionError::LlmOutput("response is not a JSON object".into()));
    };

    let mut answers = BTreeMap::new();
    for path in paths {
        let entry = map.get(*path).or_else(|| lookup_nested(&root, path));
        let answer = match entry {
            Some(Value::Object(wrapped)) if wrapped.contains_key("value") => LlmAnswer {
                value: wrapped.get("value").cloned().unwrap_or(Value::Null),
                confidence: wrapped
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .and_then(normalize_reported),
            },
            Some(bare) => LlmAnswer {
                value: bare.clone(),
                confidence: None,
            },
            None => LlmAnswer {
                value: Value::Null,
                confidence: None,
            },
        };
        answers.insert(path.to_string(), answer);
    }
    Ok(answers)
}

/// The JSON object inside an optional ```json fence.
fn extract_json_object(response: &str) -> Option<&str> {
    let body = match response.find("```") {
        Some(fence) => {
            let after = &response[fence + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => response,
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

fn lookup_nested<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, key| node.get(key))
}

/// First page whose text contains the value (case-insensitive).
pub fn source_page_for(doc: &MergedDocument, value: &Value) -> Option<usize> {
    let needle = first_scalar_text(value)?.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    doc.pages
        .iter()
        .find(|p| p.text.to_lowercase().contains(&needle))
        .map(|p| p.page_number)
}

fn first_scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) => items.iter().find_map(first_scalar_text),
        Value::Object(map) => map.values().find_map(first_scalar_text),
        other => Some(value_to_text(other)),
    }
}
