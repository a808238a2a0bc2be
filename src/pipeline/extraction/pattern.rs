use regex::{Captures, Regex, RegexBuilder};
use serde_json::Value;

use super::confidence::quality;
use super::{Candidate, ExtractionError};
use crate::models::{CaptureGroup, MatchMode, RegexStrategy};
use crate::pipeline::ocr::MergedDocument;

pub fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, ExtractionError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .multi_line(true)
        .build()
        .map_err(|source| ExtractionError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Selected group of one match, with its byte offset in the text.
fn pick<'t>(re: &Regex, caps: &Captures<'t>, group: Option<&CaptureGroup>) -> Option<regex::Match<'t>> {
    match group {
        Some(CaptureGroup::Index(i)) => caps.get(*i),
        Some(CaptureGroup::Name(name)) => caps.name(name),
        None if re.captures_len() > 1 => caps.get(1),
        None => caps.get(0),
    }
}

/// Match against the merged text. The page separator is part of the text,
/// so patterns may span a page boundary; the source page is where the
/// selected group starts.
pub fn extract(doc: &MergedDocument, strategy: &RegexStrategy) -> Result<Option<Candidate>, ExtractionError> {
    let re = compile(&strategy.pattern, strategy.case_insensitive)?;
    let matches: Vec<(usize, String)> = re
        .captures_iter(&doc.text)
        .filter_map(|caps| pick(&re, &caps, strategy.group.as_ref()))
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .filter(|(_, text)| !text.is_empty())
        .collect();

    let Some((first_offset, first_text)) = matches.first().cloned() else {
        return Ok(None);
    };

    let candidate = match strategy.mode {
        MatchMode::FirstMatch => {
            let match_quality = if matches.len() == 1 {
                quality::REGEX_UNIQUE
            } else {
                quality::REGEX_AMBIGUOUS
            };
            Candidate::new(Value::String(first_text), doc.page_at(first_offset), match_quality)
        }
        MatchMode::AllMatches => {
            let row_pages = matches
                .iter()
                .filter_map(|(offset, _)| doc.page_at(*offset))
                .collect();
            Candidate {
                row_pages,
                ..Candidate::new(
                    Value::Array(matches.into_iter().map(|(_, t)| Value::String(t)).collect()),
                    doc.page_at(first_offset),
                    quality::REGEX_UNIQUE,
                )
            }
        }
    };
    Ok(Some(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageOcr;
    use serde_json::json;

    fn doc(pages: &[&str], separator: &str) -> MergedDocument {
        MergedDocument::from_pages(
            pages
                .iter()
                .enumerate()
                .map(|(i, t)| PageOcr {
                    page_number: i + 1,
                    text: t.to_string(),
                    confidence: 0.9,
                    blocks: vec![],
                    engine: None,
                })
                .collect(),
            separator,
        )
    }

    fn strategy(pattern: &str) -> RegexStrategy {
        RegexStrategy {
            pattern: pattern.into(),
            group: None,
            mode: MatchMode::FirstMatch,
            case_insensitive: false,
        }
    }

    #[test]
    fn first_match_uses_group_one_by_default() {
        let d = doc(&["Invoice INV-0042 dated today"], "\n");
        let c = extract(&d, &strategy(r"INV-(\d+)")).unwrap().unwrap();
        assert_eq!(c.value, json!("0042"));
        assert_eq!(c.source_page, Some(1));
        assert_eq!(c.match_quality, quality::REGEX_UNIQUE);
    }

    #[test]
    fn several_candidates_lower_quality() {
        let d = doc(&["INV-1", "INV-2"], "\n");
        let c = extract(&d, &strategy(r"INV-\d")).unwrap().unwrap();
        assert_eq!(c.value, json!("INV-1"));
        assert_eq!(c.match_quality, quality::REGEX_AMBIGUOUS);
    }

    #[test]
    fn all_matches_keeps_page_of_each() {
        let d = doc(&["Ref A1", "Ref B2 Ref C3"], "\n");
        let mut s = strategy(r"Ref (\w\d)");
        s.mode = MatchMode::AllMatches;
        let c = extract(&d, &s).unwrap().unwrap();
        assert_eq!(c.value, json!(["A1", "B2", "C3"]));
        assert_eq!(c.row_pages, vec![1, 2, 2]);
    }

    #[test]
    fn named_group_and_case_insensitivity() {
        let d = doc(&["TOTAL: 99.50 EUR"], "\n");
        let mut s = strategy(r"total:\s*(?P<amount>[\d.]+)\s*(?P<cur>[A-Z]{3})");
        s.case_insensitive = true;
        s.group = Some(CaptureGroup::Name("cur".into()));
        assert_eq!(extract(&d, &s).unwrap().unwrap().value, json!("EUR"));
        s.group = Some(CaptureGroup::Index(1));
        assert_eq!(extract(&d, &s).unwrap().unwrap().value, json!("99.50"));
    }

    #[test]
    fn match_spanning_separator_resolves_start_page() {
        let d = doc(&["Total amount due:", "1,250.00 EUR"], "\n");
        let c = extract(&d, &strategy(r"due:\s*([\d,.]+)")).unwrap().unwrap();
        assert_eq!(c.value, json!("1,250.00"));
        assert_eq!(c.source_page, Some(2));
    }

    #[test]
    fn separator_prevents_token_fusion() {
        // Without a separator the page tail and head would read "1234"
        let d = doc(&["Code 12", "34 units"], "\n");
        let c = extract(&d, &strategy(r"Code (\d+)")).unwrap().unwrap();
        assert_eq!(c.value, json!("12"));
    }

    #[test]
    fn no_match_is_none() {
        let d = doc(&["nothing here"], "\n");
        assert!(extract(&d, &strategy(r"INV-\d+")).unwrap().is_none());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let d = doc(&["x"], "\n");
        assert!(matches!(
            extract(&d, &strategy("(unclosed")),
            Err(ExtractionError::Pattern { .. })
        ));
    }
}
