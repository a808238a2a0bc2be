//! Keyword anchors: find a label, read the value next to it.
//!
//! Two modes. With `max_offset_px` set and blocks carrying coordinates, the
//! value is the nearest block to the right of (or below) the label within
//! that offset. Otherwise a character window of the merged text is read.

use serde_json::Value;

use super::confidence::anchor_quality;
use super::table_detect::{positioned_cells, COLUMN_GAP};
use super::{pattern, Candidate, ExtractionError};
use crate::models::{AnchorDirection, AnchorStrategy, BoundingBox, OcrBlock};
use crate::pipeline::ocr::MergedDocument;

/// `None` when the anchor is absent or nothing readable sits next to it.
pub fn extract(doc: &MergedDocument, strategy: &AnchorStrategy) -> Result<Option<Candidate>, ExtractionError> {
    if let Some(offset_px) = strategy.max_offset_px {
        if let Some(candidate) = extract_by_layout(doc, strategy, offset_px) {
            return Ok(Some(candidate));
        }
    }
    extract_by_text(doc, strategy)
}

// ---------------------------------------------------------------------------
// Text window
// ---------------------------------------------------------------------------

fn extract_by_text(doc: &MergedDocument, strategy: &AnchorStrategy) -> Result<Option<Candidate>, ExtractionError> {
    let label = strategy.anchor.trim();
    if label.is_empty() {
        return Ok(None);
    }
    let re = pattern::compile(&regex::escape(label), strategy.case_insensitive)?;
    let Some(found) = re.find(&doc.text) else {
        return Ok(None);
    };

    let window = strategy.max_chars;
    let candidate = match strategy.direction {
        AnchorDirection::Right => read_right(doc, found.end(), window),
        AnchorDirection::Below => read_below(doc, found.start(), found.end(), window),
        AnchorDirection::RightBelow => read_right(doc, found.end(), window)
            .or_else(|| read_below(doc, found.start(), found.end(), window)),
    };
    Ok(candidate)
}

/// Rest of the anchor's line, past any `:` or `-` label punctuation, up to
/// the next column gap.
fn read_right(doc: &MergedDocument, anchor_end: usize, window: usize) -> Option<Candidate> {
    let text = &doc.text;
    let line_end = text[anchor_end..]
        .find('\n')
        .map_or(text.len(), |i| anchor_end + i);
    let rest = &text[anchor_end..line_end];
    let value_start = anchor_end + label_punctuation_len(rest);

    let cell = positioned_cells(&text[value_start..line_end], COLUMN_GAP)
        .into_iter()
        .next()
        .filter(|c| c.byte == 0)?;
    let value = clip(cell.text, window)?;
    let distance = text[anchor_end..value_start].chars().count();
    Some(Candidate::new(
        Value::String(value),
        doc.page_at(value_start),
        anchor_quality(distance, window),
    ))
}

/// Byte length of leading whitespace and label punctuation. A `-` directly
/// followed by a digit is a sign and is kept.
fn label_punctuation_len(rest: &str) -> usize {
    let mut chars = rest.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        let is_sign = ch == '-' && chars.peek().is_some_and(|(_, next)| next.is_ascii_digit());
        if !(ch.is_whitespace() || ch == ':' || ch == '-') || is_sign {
            return i;
        }
    }
    rest.len()
}

/// Cell of the next non-blank line closest to the anchor's column.
fn read_below(doc: &MergedDocument, anchor_start: usize, anchor_end: usize, window: usize) -> Option<Candidate> {
    let text = &doc.text;
    let line_start = text[..anchor_start].rfind('\n').map_or(0, |i| i + 1);
    let anchor_col = text[line_start..anchor_start].chars().count();

    let mut pos = text[anchor_end..].find('\n').map(|i| anchor_end + i + 1)?;
    while pos < text.len() {
        let line_end = text[pos..].find('\n').map_or(text.len(), |i| pos + i);
        let line = &text[pos..line_end];
        if !line.trim().is_empty() {
            let cell = positioned_cells(line, COLUMN_GAP)
                .into_iter()
                .min_by_key(|c| c.col.abs_diff(anchor_col))?;
            let value = clip(cell.text, window)?;
            return Some(Candidate::new(
                Value::String(value),
                doc.page_at(pos + cell.byte),
                anchor_quality(cell.col.abs_diff(anchor_col), window),
            ));
        }
        pos = line_end + 1;
    }
    None
}

fn clip(text: &str, window: usize) -> Option<String> {
    let value: String = text.chars().take(window.max(1)).collect();
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

// ---------------------------------------------------------------------------
// Block layout
// ---------------------------------------------------------------------------

struct Placed<'a> {
    block: &'a OcrBlock,
    bbox: BoundingBox,
}

fn extract_by_layout(doc: &MergedDocument, strategy: &AnchorStrategy, offset_px: u32) -> Option<Candidate> {
    let words: Vec<String> = strategy
        .anchor
        .split_whitespace()
        .map(|w| normalize_word(w, strategy.case_insensitive))
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return None;
    }

    for page in &doc.pages {
        let placed: Vec<Placed> = page
            .blocks
            .iter()
            .filter_map(|block| block.bounding_box.map(|bbox| Placed { block, bbox }))
            .collect();
        if placed.len() < words.len() {
            continue;
        }

        for start in 0..=placed.len() - words.len() {
            let is_label = words.iter().enumerate().all(|(k, w)| {
                normalize_word(&placed[start + k].block.text, strategy.case_insensitive) == *w
            });
            if !is_label {
                continue;
            }
            let label = &placed[start..start + words.len()];
            let label_box = union(label.iter().map(|p| p.bbox));
            let others: Vec<&Placed> = placed
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < start || *i >= start + words.len())
                .map(|(_, p)| p)
                .collect();

            let nearest = match strategy.direction {
                AnchorDirection::Right => nearest_right(&others, &label_box, offset_px),
                AnchorDirection::Below => nearest_below(&others, &label_box, offset_px),
                AnchorDirection::RightBelow => nearest_right(&others, &label_box, offset_px)
                    .or_else(|| nearest_below(&others, &label_box, offset_px)),
            };
            let (first, distance) = nearest?;
            let chosen = extend_along_line(&others, first);
            let value = chosen
                .iter()
                .map(|p| p.block.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            let mut candidate = Candidate::new(
                Value::String(value),
                Some(page.page_number),
                anchor_quality(distance as usize, offset_px as usize),
            );
            candidate.ocr_confidence =
                Some(chosen.iter().map(|p| p.block.confidence).sum::<f32>() / chosen.len() as f32);
            return Some(candidate);
        }
    }
    None
}

fn normalize_word(word: &str, case_insensitive: bool) -> String {
    let trimmed = word.trim().trim_end_matches(':');
    if case_insensitive {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

fn union(boxes: impl Iterator<Item = BoundingBox>) -> BoundingBox {
    let mut acc: Option<(u32, u32, u32, u32)> = None;
    for b in boxes {
        acc = Some(match acc {
            None => (b.x, b.y, b.right(), b.bottom()),
            Some((x, y, r, btm)) => (x.min(b.x), y.min(b.y), r.max(b.right()), btm.max(b.bottom())),
        });
    }
    let (x, y, r, b) = acc.unwrap_or_default();
    BoundingBox {
        x,
        y,
        width: r - x,
        height: b - y,
    }
}

fn nearest_right<'a>(others: &[&'a Placed<'a>], label: &BoundingBox, max: u32) -> Option<(&'a Placed<'a>, u32)> {
    others
        .iter()
        .filter(|p| p.bbox.overlaps_vertically(label) && p.bbox.x >= label.right())
        .map(|p| (*p, p.bbox.x - label.right()))
        .filter(|(_, d)| *d <= max)
        .min_by_key(|(p, d)| (*d, p.bbox.x))
}

fn nearest_below<'a>(others: &[&'a Placed<'a>], label: &BoundingBox, max: u32) -> Option<(&'a Placed<'a>, u32)> {
    others
        .iter()
        .filter(|p| p.bbox.overlaps_horizontally(label) && p.bbox.y >= label.bottom())
        .map(|p| (*p, p.bbox.y - label.bottom()))
        .filter(|(_, d)| *d <= max)
        .min_by_key(|(p, d)| (*d, p.bbox.x))
}

/// The first block plus following blocks on its line separated by no more
/// than one line height (a word gap, not a column gap).
fn extend_along_line<'a>(others: &[&'a Placed<'a>], first: &'a Placed<'a>) -> Vec<&'a Placed<'a>> {
    let mut chosen = vec![first];
    let mut current = first;
    loop {
        let gap = current.bbox.height.max(1);
        let next = others
            .iter()
            .filter(|p| p.bbox.overlaps_vertically(&current.bbox) && p.bbox.x >= current.bbox.right())
            .filter(|p| p.bbox.x - current.bbox.right() <= gap)
            .min_by_key(|p| p.bbox.x);
        match next {
            Some(p) => {
                chosen.push(*p);
                current = *p;
            }
            None => return chosen,
        }
    }
}
