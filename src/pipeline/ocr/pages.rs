//! Page selection: a single page, all pages, or an expression such as
//! `"1-3, 5, last"` or `"2-last"`.

use std::collections::BTreeSet;

use crate::models::PageStrategy;

use super::OcrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageRef {
    Number(usize),
    First,
    Last,
}

impl PageRef {
    fn resolve(self, page_count: usize) -> usize {
        match self {
            Self::Number(n) => n,
            Self::First => 1,
            Self::Last => page_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Single(PageRef),
    Range(PageRef, PageRef),
}

/// Parsed page expression, independent of any document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageExpression {
    items: Vec<Item>,
}

/// Pages chosen for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSelection {
    /// Ascending, unique, 1-based.
    pub pages: Vec<usize>,
    /// Requested pages past the end of the document, as merged inclusive
    /// ranges.
    pub skipped: Vec<(usize, usize)>,
}

impl PageSelection {
    pub fn skipped_warnings(&self, page_count: usize) -> Vec<String> {
        self.skipped
            .iter()
            .map(|&(a, b)| {
                if a == b {
                    format!("Page {a} requested but document has {page_count} pages")
                } else {
                    format!("Pages {a}-{b} requested but document has {page_count} pages")
                }
            })
            .collect()
    }
}

/// Sort and join overlapping or adjacent ranges.
fn merge_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
    for (a, b) in ranges {
        match merged.last_mut() {
            Some(last) if a <= last.1.saturating_add(1) => last.1 = last.1.max(b),
            _ => merged.push((a, b)),
        }
    }
    merged
}

fn invalid(expr: &str, reason: impl Into<String>) -> OcrError {
    OcrError::InvalidPageExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_ref(expr: &str, token: &str) -> Result<PageRef, OcrError> {
    match token.trim().to_ascii_lowercase().as_str() {
        "first" => Ok(PageRef::First),
        "last" => Ok(PageRef::Last),
        t => match t.parse::<usize>() {
            Ok(0) => Err(invalid(expr, "pages are numbered from 1")),
            Ok(n) => Ok(PageRef::Number(n)),
            Err(_) => Err(invalid(expr, format!("'{t}' is not a page"))),
        },
    }
}

impl PageExpression {
    pub fn parse(expr: &str) -> Result<Self, OcrError> {
        let mut items = Vec::new();
        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid(expr, "empty list item"));
            }
            let item = match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_ref(expr, start)?;
                    let end = parse_ref(expr, end)?;
                    if let (PageRef::Number(a), PageRef::Number(b)) = (start, end) {
                        if a > b {
                            return Err(invalid(expr, format!("range {a}-{b} is reversed")));
                        }
                    }
                    Item::Range(start, end)
                }
                None => Item::Single(parse_ref(expr, part)?),
            };
            items.push(item);
        }
        Ok(Self { items })
    }

    /// Only pages inside the document are enumerated; whatever lies past
    /// the end is kept as a range.
    pub fn resolve(&self, page_count: usize) -> PageSelection {
        let mut pages = BTreeSet::new();
        let mut skipped = Vec::new();
        for item in &self.items {
            let (a, b) = match *item {
                Item::Single(r) => (r.resolve(page_count), r.resolve(page_count)),
                Item::Range(a, b) => (a.resolve(page_count), b.resolve(page_count)),
            };
            let a = a.max(1);
            if a > b {
                continue;
            }
            if a <= page_count {
                pages.extend(a..=b.min(page_count));
            }
            if b > page_count {
                skipped.push((a.max(page_count + 1), b));
            }
        }
        PageSelection {
            pages: pages.into_iter().collect(),
            skipped: merge_ranges(skipped),
        }
    }
}

/// Resolve a rule's page strategy against a document's page count.
pub fn resolve_pages(strategy: &PageStrategy, page_count: usize) -> Result<PageSelection, OcrError> {
    let selection = match strategy {
        PageStrategy::All => PageSelection {
            pages: (1..=page_count).collect(),
            skipped: Vec::new(),
        },
        PageStrategy::Single { page } => {
            if *page == 0 {
                return Err(invalid(&page.to_string(), "pages are numbered from 1"));
            }
            if *page <= page_count {
                PageSelection { pages: vec![*page], skipped: Vec::new() }
            } else {
                PageSelection { pages: Vec::new(), skipped: vec![(*page, *page)] }
            }
        }
        PageStrategy::Expression { expr } => PageExpression::parse(expr)?.resolve(page_count),
    };
    if selection.pages.is_empty() {
        return Err(OcrError::NoPages { page_count });
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(s: &str) -> PageStrategy {
        PageStrategy::Expression { expr: s.into() }
    }

    #[test]
    fn ranges_lists_and_last() {
        let sel = resolve_pages(&expr("1-3, 5, last"), 8).unwrap();
        assert_eq!(sel.pages, vec![1, 2, 3, 5, 8]);
        assert!(sel.skipped.is_empty());
    }

    #[test]
    fn overlapping_items_are_deduplicated_and_sorted() {
        let sel = resolve_pages(&expr("last, 2-4, 3, first"), 4).unwrap();
        assert_eq!(sel.pages, vec![1, 2, 3, 4]);
    }

    #[test]
    fn symbolic_range() {
        let sel = resolve_pages(&expr("2-last"), 4).unwrap();
        assert_eq!(sel.pages, vec![2, 3, 4]);
    }

    #[test]
    fn pages_past_end_are_skipped() {
        let sel = resolve_pages(&expr("2, 9"), 3).unwrap();
        assert_eq!(sel.pages, vec![2]);
        assert_eq!(sel.skipped, vec![(9, 9)]);
        assert_eq!(
            sel.skipped_warnings(3),
            vec!["Page 9 requested but document has 3 pages".to_string()]
        );
    }

    #[test]
    fn huge_range_is_clamped_to_the_document() {
        let sel = resolve_pages(&expr("1-4000000000, 2-9, 12"), 3).unwrap();
        assert_eq!(sel.pages, vec![1, 2, 3]);
        assert_eq!(sel.skipped, vec![(4, 4_000_000_000)]);
        assert_eq!(sel.skipped_warnings(3).len(), 1);
        assert!(sel.skipped_warnings(3)[0].starts_with("Pages 4-4000000000"));
    }

    #[test]
    fn separate_overflow_ranges_stay_apart() {
        let sel = resolve_pages(&expr("2, 6-7, 9"), 3).unwrap();
        assert_eq!(sel.skipped, vec![(6, 7), (9, 9)]);
    }

    #[test]
    fn nothing_selected_is_an_error() {
        assert!(matches!(
            resolve_pages(&PageStrategy::Single { page: 4 }, 3),
            Err(OcrError::NoPages { page_count: 3 })
        ));
        assert!(matches!(resolve_pages(&PageStrategy::All, 0), Err(OcrError::NoPages { .. })));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "1,,2", "0", "3-1", "a-b", "1-2-3"] {
            assert!(PageExpression::parse(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn single_and_all() {
        assert_eq!(resolve_pages(&PageStrategy::Single { page: 2 }, 3).unwrap().pages, vec![2]);
        assert_eq!(resolve_pages(&PageStrategy::All, 3).unwrap().pages, vec![1, 2, 3]);
    }
}
