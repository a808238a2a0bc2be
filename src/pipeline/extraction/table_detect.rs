//! Per-page table detection over OCR text.
//!
//! A table is found either by a header line carrying enough of the expected
//! keywords, or heuristically as a run of lines that look column-aligned.

use crate::models::PageOcr;

/// Minimum number of lines at page boundary to check for table patterns.
const BOUNDARY_LINES: usize = 3;

/// Minimum ratio of tabular lines needed to consider a boundary as tabular.
const TABULAR_THRESHOLD: f64 = 0.60;

/// Spaces separating two cells of a keyword-located table row.
pub const CELL_GAP: usize = 2;

/// Spaces separating two columns of free text (anchor windows stop there).
pub const COLUMN_GAP: usize = 3;

/// How a table was located. Keyword headers are more trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Keywords,
    Heuristic,
}

/// One cell of a line with its byte offset and character column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell<'a> {
    pub byte: usize,
    pub col: usize,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    /// Page the row was printed on.
    pub page: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableBlock {
    pub page: usize,
    pub header: Option<Vec<String>>,
    pub rows: Vec<TableRow>,
    pub detection: Detection,
    /// Only blank lines follow the last row on its page.
    pub reaches_page_end: bool,
}

/// Rows found at the top of a page that continue a table from the page before.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub rows: Vec<TableRow>,
    pub repeated_header: bool,
    pub reaches_page_end: bool,
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// Split a line into cells on tabs, on pipes (outer pipes framing the row
/// are dropped), or else on runs of at least `min_gap` spaces.
pub fn positioned_cells(line: &str, min_gap: usize) -> Vec<Cell<'_>> {
    if line.contains('\t') {
        return delimited_cells(line, '\t');
    }
    if line.matches('|').count() >= 2 {
        return delimited_cells(line, '|');
    }

    let mut cells = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0;
    let mut spaces = 0;
    for (i, ch) in line.char_indices() {
        if ch.is_whitespace() {
            spaces += 1;
            if spaces >= min_gap {
                if let Some(s) = start.take() {
                    cells.push(make_cell(line, s, last_end));
                }
            }
            continue;
        }
        spaces = 0;
        if start.is_none() {
            start = Some(i);
        }
        last_end = i + ch.len_utf8();
    }
    if let Some(s) = start {
        cells.push(make_cell(line, s, last_end));
    }
    cells
}

fn delimited_cells(line: &str, delimiter: char) -> Vec<Cell<'_>> {
    let mut cells = Vec::new();
    let mut segment_start = 0;
    let boundaries = line
        .char_indices()
        .filter(|(_, ch)| *ch == delimiter)
        .map(|(i, _)| i)
        .chain(std::iter::once(line.len()));
    for end in boundaries {
        let raw = &line[segment_start..end];
        let start = segment_start + (raw.len() - raw.trim_start().len());
        cells.push(make_cell(line, start, start + raw.trim().len()));
        segment_start = (end + delimiter.len_utf8()).min(line.len());
    }
    if delimiter == '|' {
        if cells.first().is_some_and(|c| c.text.is_empty()) {
            cells.remove(0);
        }
        if cells.last().is_some_and(|c| c.text.is_empty()) {
            cells.pop();
        }
    }
    cells
}

fn make_cell(line: &str, start: usize, end: usize) -> Cell<'_> {
    Cell {
        byte: start,
        col: line[..start].chars().count(),
        text: &line[start..end],
    }
}

pub fn cell_texts(line: &str) -> Vec<String> {
    positioned_cells(line, CELL_GAP)
        .into_iter()
        .map(|c| c.text.to_string())
        .collect()
}

/// Case and spacing-insensitive form used to compare header rows.
pub fn header_signature(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// First table on the page. With keywords, a header line must contain at
/// least `min_matches` of them; without, the first run of two or more
/// tabular lines is taken.
pub fn find_table(page: &PageOcr, keywords: &[String], min_matches: usize) -> Option<TableBlock> {
    let lines: Vec<&str> = page.text.lines().collect();
    if keywords.is_empty() {
        return find_heuristic(page.page_number, &lines);
    }

    let needed = min_matches.clamp(1, keywords.len());
    let header_idx = lines.iter().position(|line| keyword_hits(line, keywords) >= needed)?;
    let (rows, consumed) = collect_rows(&lines[header_idx + 1..], page.page_number);
    Some(TableBlock {
        page: page.page_number,
        header: Some(cell_texts(lines[header_idx])),
        rows,
        detection: Detection::Keywords,
        reaches_page_end: only_blank(&lines[header_idx + 1 + consumed..]),
    })
}

fn find_heuristic(page_number: usize, lines: &[&str]) -> Option<TableBlock> {
    let mut i = 0;
    while i < lines.len() {
        let run = lines[i..].iter().take_while(|l| is_tabular_line(l)).count();
        if run >= 2 {
            let first = cell_texts(lines[i]);
            let has_header = !first.iter().any(|c| c.chars().any(|ch| ch.is_ascii_digit()));
            let body_start = if has_header { i + 1 } else { i };
            let rows = lines[body_start..i + run]
                .iter()
                .map(|l| TableRow {
                    page: page_number,
                    cells: cell_texts(l),
                })
                .collect();
            return Some(TableBlock {
                page: page_number,
                header: has_header.then_some(first),
                rows,
                detection: Detection::Heuristic,
                reaches_page_end: only_blank(&lines[i + run..]),
            });
        }
        i += run.max(1);
    }
    None
}

/// Rows at the top of `page` continuing a table whose header is `header`.
/// A verbatim repeat of the header is consumed, whatever trails the table
/// on the previous page. Without one, the table must have run to the
/// bottom of the previous page (`tail_open`) and the page head must look
/// tabular with the same number of columns.
pub fn continuation(
    previous: &PageOcr,
    page: &PageOcr,
    header: Option<&[String]>,
    width: usize,
    tail_open: bool,
) -> Option<Continuation> {
    let lines: Vec<&str> = page.text.lines().collect();
    let mut start = lines.iter().position(|l| !l.trim().is_empty())?;

    let repeated_header = header
        .is_some_and(|h| header_signature(&cell_texts(lines[start])) == header_signature(h));
    if repeated_header {
        start += 1;
    } else if !(tail_open
        && is_tail_tabular(&previous.text)
        && is_head_tabular(&page.text)
        && cell_texts(lines[start]).len() == width)
    {
        return None;
    }

    let (rows, consumed) = collect_rows(&lines[start..], page.page_number);
    Some(Continuation {
        rows,
        repeated_header,
        reaches_page_end: only_blank(&lines[start + consumed..]),
    })
}

/// Consecutive lines with at least two cells, stopping at the first blank
/// or single-cell line.
fn collect_rows(lines: &[&str], page: usize) -> (Vec<TableRow>, usize) {
    let mut rows = Vec::new();
    for line in lines {
        let cells = cell_texts(line);
        if cells.len() < 2 {
            break;
        }
        rows.push(TableRow { page, cells });
    }
    let consumed = rows.len();
    (rows, consumed)
}

fn keyword_hits(line: &str, keywords: &[String]) -> usize {
    let lower = line.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty() && lower.contains(&k.trim().to_lowercase()))
        .count()
}

fn only_blank(lines: &[&str]) -> bool {
    lines.iter().all(|l| l.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Line heuristics
// ---------------------------------------------------------------------------

/// Check if the last BOUNDARY_LINES of the text look tabular.
pub fn is_tail_tabular(text: &str) -> bool {
    let lines: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(BOUNDARY_LINES)
        .collect();
    tabular_ratio(&lines) >= TABULAR_THRESHOLD
}

/// Check if the first BOUNDARY_LINES of the text look tabular.
pub fn is_head_tabular(text: &str) -> bool {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(BOUNDARY_LINES)
        .collect();
    tabular_ratio(&lines) >= TABULAR_THRESHOLD
}

fn tabular_ratio(lines: &[&str]) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    let tabular_count = lines.iter().filter(|l| is_tabular_line(l)).count();
    tabular_count as f64 / lines.len() as f64
}

/// Heuristic: a line looks tabular if it has multiple columns separated by
/// tabs, pipes, or consistent multi-space gaps.
///
/// Patterns detected:
/// - Tab-separated: "Item\tQty\tPrice"
/// - Pipe-separated: "Item | Qty | Price"
/// - Multi-space aligned: "Widget    2    10.00"
pub fn is_tabular_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() < 5 {
        return false;
    }

    if trimmed.matches('\t').count() >= 2 {
        return true;
    }

    if trimmed.matches('|').count() >= 2 {
        return true;
    }

    count_multi_space_gaps(trimmed) >= 2
}

/// Count runs of 3+ consecutive spaces that separate non-empty text segments.
pub fn count_multi_space_gaps(text: &str) -> usize {
    let mut count = 0;
    let mut in_gap = false;
    let mut gap_len = 0;

    for ch in text.chars() {
        if ch == ' ' {
            gap_len += 1;
            if gap_len >= COLUMN_GAP && !in_gap {
                in_gap = true;
                count += 1;
            }
        } else {
            in_gap = false;
            gap_len = 0;
        }
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize, text: &str) -> PageOcr {
        PageOcr {
            page_number: n,
            text: text.into(),
            confidence: 0.9,
            blocks: vec![],
            engine: None,
        }
    }

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    // --- cells ---

    #[test]
    fn cells_split_on_space_runs_keep_single_spaces() {
        let cells = positioned_cells("Blue widget   2   10.00", CELL_GAP);
        let texts: Vec<&str> = cells.iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["Blue widget", "2", "10.00"]);
        assert_eq!(cells[1].col, 14);
        assert_eq!(cells[1].byte, 14);
    }

    #[test]
    fn pipe_cells_drop_outer_frame_keep_inner_blanks() {
        let texts: Vec<String> = positioned_cells("| A |  | C |", CELL_GAP)
            .into_iter()
            .map(|c| c.text.to_string())
            .collect();
        assert_eq!(texts, vec!["A", "", "C"]);
    }

    #[test]
    fn tab_cells() {
        assert_eq!(cell_texts("Item\tQty\tPrice"), vec!["Item", "Qty", "Price"]);
    }

    #[test]
    fn cell_columns_count_characters_not_bytes() {
        let cells = positioned_cells("Café  crème", CELL_GAP);
        assert_eq!(cells[1].col, 6);
        assert_eq!(cells[1].byte, 7);
    }

    // --- line heuristics ---

    #[test]
    fn tabular_line_shapes() {
        assert!(is_tabular_line("Item\tQty\tPrice"));
        assert!(is_tabular_line("Item | Qty | Price"));
        assert!(is_tabular_line("Widget    2    10.00"));
        assert!(!is_tabular_line("This is a normal sentence."));
        assert!(!is_tabular_line("Hi"));
    }

    #[test]
    fn counts_multiple_gaps() {
        assert_eq!(count_multi_space_gaps("A   B   C"), 2);
        assert_eq!(count_multi_space_gaps("Hello   World"), 1);
        assert_eq!(count_multi_space_gaps("Hello World"), 0);
    }

    #[test]
    fn boundary_checks_ignore_blank_lines() {
        let text = "Intro text\nWidget    2    10.00\nGadget    1    5.00\n\n";
        assert!(is_tail_tabular(text));
        assert!(!is_head_tabular("Dear customer,\nThanks for your order.\nRegards"));
    }

    // --- detection ---

    #[test]
    fn keyword_header_locates_table() {
        let p = page(
            1,
            "Invoice 42\n\nItem      Qty   Price\nWidget    2     10.00\nGadget    1     5.00\n\nThank you",
        );
        let t = find_table(&p, &kw(&["item", "qty", "price"]), 2).unwrap();
        assert_eq!(t.detection, Detection::Keywords);
        assert_eq!(t.header.as_deref(), Some(&kw(&["Item", "Qty", "Price"])[..]));
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[1].cells, kw(&["Gadget", "1", "5.00"]));
        assert!(!t.reaches_page_end);
    }

    #[test]
    fn too_few_keywords_is_no_table() {
        let p = page(1, "Item list follows\nWidget    2     10.00");
        assert!(find_table(&p, &kw(&["item", "qty", "price"]), 2).is_none());
    }

    #[test]
    fn heuristic_run_with_text_header() {
        let p = page(1, "Summary\nName     Amount     Date\nAlpha    10.00      2024-01-01\nBeta     20.00      2024-01-02\n");
        let t = find_table(&p, &[], 2).unwrap();
        assert_eq!(t.detection, Detection::Heuristic);
        assert_eq!(t.header.unwrap(), kw(&["Name", "Amount", "Date"]));
        assert_eq!(t.rows.len(), 2);
        assert!(t.reaches_page_end);
    }

    #[test]
    fn heuristic_without_header_keeps_every_row() {
        let p = page(1, "Alpha    10.00    x\nBeta     20.00    y");
        let t = find_table(&p, &[], 2).unwrap();
        assert!(t.header.is_none());
        assert_eq!(t.rows.len(), 2);
    }

    // --- continuation ---

    #[test]
    fn repeated_header_is_consumed() {
        let prev = page(1, "Item      Qty   Price\nWidget    2     10.00\n");
        let next = page(2, "\nitem      QTY   price\nBolt      9     0.10\nNut       9     0.05\n\nTotal 10.95");
        let header = kw(&["Item", "Qty", "Price"]);
        let c = continuation(&prev, &next, Some(&header), 3, true).unwrap();
        assert!(c.repeated_header);
        assert_eq!(c.rows.len(), 2);
        assert!(c.rows.iter().all(|r| r.page == 2));
        assert!(!c.reaches_page_end);
    }

    #[test]
    fn headerless_continuation_needs_tabular_boundary_and_width() {
        let prev = page(1, "Item      Qty     Price\nWidget    2       10.00\nGadget    1       5.00\n");
        let next = page(2, "Bolt      9       0.10\nNut       9       0.05\n");
        let header = kw(&["Item", "Qty", "Price"]);
        let c = continuation(&prev, &next, Some(&header), 3, true).unwrap();
        assert!(!c.repeated_header);
        assert_eq!(c.rows.len(), 2);

        // different width
        assert!(continuation(&prev, &next, Some(&header), 4, true).is_none());
        // prose head
        let prose = page(2, "Terms and conditions apply.\nPayment within 30 days.");
        assert!(continuation(&prev, &prose, Some(&header), 3, true).is_none());
        // table closed before the page end
        assert!(continuation(&prev, &next, Some(&header), 3, false).is_none());
    }

    #[test]
    fn repeated_header_continues_after_page_footer() {
        let prev = page(1, "Item      Qty   Price\nWidget    2     10.00\n\nPage 1 of 2\n");
        let next = page(2, "Item      Qty   Price\nBolt      10    0.10\n");
        let header = kw(&["Item", "Qty", "Price"]);
        let c = continuation(&prev, &next, Some(&header), 3, false).unwrap();
        assert!(c.repeated_header);
        assert_eq!(c.rows.len(), 1);
        assert_eq!(c.rows[0].cells[0], "Bolt");
    }
}
