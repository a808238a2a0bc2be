//! Table strategy: locate a table, stitch it across page breaks, then read
//! whole tables, one column or one cell out of it.
//!
//! Stitching rule: a table on page K continues on page K+1 when that page
//! opens with the same header (the repeat is dropped, and footers after the
//! table on page K are ignored). Without a repeated header, the table must
//! run to the bottom of page K and page K+1 must open with rows of the same
//! width. Every row keeps the page it was printed on.

use serde_json::{Map, Value};

use super::confidence::quality;
use super::table_detect::{continuation, find_table, Detection, TableRow};
use super::Candidate;
use crate::models::{FieldType, SchemaNode, TableStrategy};
use crate::pipeline::cleaning::coerce;
use crate::pipeline::ocr::MergedDocument;

#[derive(Debug, Clone, PartialEq)]
pub struct StitchedTable {
    pub header: Option<Vec<String>>,
    pub rows: Vec<TableRow>,
    pub detection: Detection,
}

impl StitchedTable {
    fn width(&self) -> usize {
        self.header
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.rows.first().map(|r| r.cells.len()))
            .unwrap_or(0)
    }

    /// Column matching `wanted` by header text (exact, then substring),
    /// else `position` when the table has no header.
    fn column_index(&self, wanted: &str, position: Option<usize>) -> Option<usize> {
        let wanted = normalize(wanted);
        match &self.header {
            Some(header) => header
                .iter()
                .position(|h| normalize(h) == wanted)
                .or_else(|| {
                    header
                        .iter()
                        .position(|h| !wanted.is_empty() && normalize(h).contains(&wanted))
                })
                .or(position),
            None => position,
        }
    }
}

/// First table in the document, with continuation rows from following pages.
pub fn stitch(doc: &MergedDocument, keywords: &[String], min_matches: usize) -> Option<StitchedTable> {
    for (i, page) in doc.pages.iter().enumerate() {
        let Some(block) = find_table(page, keywords, min_matches) else {
            continue;
        };
        let mut table = StitchedTable {
            header: block.header,
            rows: block.rows,
            detection: block.detection,
        };
        let width = table.width();
        let mut open = block.reaches_page_end;
        let mut previous = page;

        for next in &doc.pages[i + 1..] {
            if next.page_number != previous.page_number + 1 {
                break;
            }
            let Some(cont) = continuation(previous, next, table.header.as_deref(), width, open) else {
                break;
            };
            tracing::debug!(
                page = next.page_number,
                rows = cont.rows.len(),
                repeated_header = cont.repeated_header,
                "Table continues across page break"
            );
            table.rows.extend(cont.rows);
            open = cont.reaches_page_end;
            previous = next;
        }
        return Some(table);
    }
    None
}

pub fn extract(doc: &MergedDocument, strategy: &TableStrategy, node: &SchemaNode) -> Option<Candidate> {
    let keywords = if strategy.header_keywords.is_empty() {
        match node {
            SchemaNode::Table { columns, .. } => columns.iter().map(|c| c.header.clone()).collect(),
            _ => Vec::new(),
        }
    } else {
        strategy.header_keywords.clone()
    };
    let table = stitch(doc, &keywords, strategy.min_header_matches)?;
    let match_quality = match table.detection {
        Detection::Keywords => quality::TABLE_KEYWORDS,
        Detection::Heuristic => quality::TABLE_HEURISTIC,
    };

    match node {
        SchemaNode::Table { columns, .. } => {
            let indexes: Vec<Option<usize>> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| table.column_index(&c.header, Some(i)))
                .collect();
            let mut rows = Vec::new();
            let mut row_pages = Vec::new();
            for row in &table.rows {
                let mut object = Map::new();
                for (column, index) in columns.iter().zip(&indexes) {
                    let cell = index.and_then(|i| row.cells.get(i)).map_or("", String::as_str);
                    object.insert(column.key.clone(), typed_cell(cell, column.field_type));
                }
                if object.values().all(Value::is_null) {
                    continue;
                }
                rows.push(Value::Object(object));
                row_pages.push(row.page);
            }
            table_candidate(Value::Array(rows), row_pages, match_quality)
        }
        SchemaNode::Array { item_type, .. } => {
            let index = table.column_index(strategy.column.as_deref().unwrap_or(""), Some(0))?;
            let mut values = Vec::new();
            let mut row_pages = Vec::new();
            for row in &table.rows {
                let value = typed_cell(row.cells.get(index).map_or("", String::as_str), *item_type);
                if !value.is_null() {
                    values.push(value);
                    row_pages.push(row.page);
                }
            }
            table_candidate(Value::Array(values), row_pages, match_quality)
        }
        SchemaNode::Field { field_type, .. } => {
            let index = match &strategy.column {
                Some(name) => table.column_index(name, None)?,
                None => 0,
            };
            let row = table.rows.get(strategy.row)?;
            let value = typed_cell(row.cells.get(index).map_or("", String::as_str), *field_type);
            (!value.is_null()).then(|| Candidate::new(value, Some(row.page), match_quality))
        }
        SchemaNode::Object { .. } => None,
    }
}

fn table_candidate(value: Value, row_pages: Vec<usize>, match_quality: f32) -> Option<Candidate> {
    if row_pages.is_empty() {
        return None;
    }
    Some(Candidate {
        row_pages: row_pages.clone(),
        ..Candidate::new(value, row_pages.first().copied(), match_quality)
    })
}

/// Blank cells become null; cells that do not parse as the declared type
/// are kept as text for validation to flag.
fn typed_cell(cell: &str, field_type: FieldType) -> Value {
    let cell = cell.trim();
    if cell.is_empty() {
        return Value::Null;
    }
    let text = Value::String(cell.to_string());
    coerce(&text, field_type).unwrap_or(text)
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PageOcr, TableColumn};
    use serde_json::json;

    fn doc(pages: &[(usize, &str)]) -> MergedDocument {
        MergedDocument::from_pages(
            pages
                .iter()
                .map(|(n, t)| PageOcr {
                    page_number: *n,
                    text: t.to_string(),
                    confidence: 0.9,
                    blocks: vec![],
                    engine: None,
                })
                .collect(),
            "\n",
        )
    }

    fn lines_node() -> SchemaNode {
        SchemaNode::Table {
            key: "lines".into(),
            columns: vec![
                TableColumn { key: "item".into(), header: "Item".into(), field_type: FieldType::String },
                TableColumn { key: "qty".into(), header: "Qty".into(), field_type: FieldType::Integer },
                TableColumn { key: "price".into(), header: "Price".into(), field_type: FieldType::Number },
            ],
            strategy: None,
            fallback: None,
            key_field: false,
        }
    }

    const PAGE_ONE: &str = "Invoice 7\n\nItem      Qty   Price\nWidget    2     10.00\nGadget    1     5.50\n";
    const PAGE_TWO: &str = "Item      Qty   Price\nBolt      10    0.10\n\nTotal     25.50";

    #[test]
    fn repeated_header_stitches_rows_once() {
        let d = doc(&[(1, PAGE_ONE), (2, PAGE_TWO)]);
        let table = stitch(&d, &["Item".into(), "Qty".into(), "Price".into()], 2).unwrap();
        assert_eq!(table.header.as_ref().unwrap().len(), 3);
        assert_eq!(table.rows.len(), 3);
        assert!(table.rows.iter().all(|r| r.cells[0] != "Item"));
        assert_eq!(table.rows.iter().map(|r| r.page).collect::<Vec<_>>(), vec![1, 1, 2]);
    }

    #[test]
    fn repeated_header_stitches_past_page_footer() {
        let page_one = "Item  Qty  Price\nWidget  2  10.00\nGadget  1  5.50\n\nPage 1 of 2\n";
        let page_two = "Item  Qty  Price\nBolt  10  0.10\n";
        let d = doc(&[(1, page_one), (2, page_two)]);
        let table = stitch(&d, &["Item".into(), "Qty".into(), "Price".into()], 2).unwrap();
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows.iter().map(|r| r.page).collect::<Vec<_>>(), vec![1, 1, 2]);
        assert_eq!(table.rows[2].cells[0], "Bolt");
    }

    #[test]
    fn headerless_rows_after_page_footer_are_not_stitched() {
        let page_one = "Item  Qty  Price\nWidget  2  10.00\n\nPage 1 of 2\n";
        let page_two = "Bolt  10  0.10\nNut  4  0.05\n";
        let d = doc(&[(1, page_one), (2, page_two)]);
        let table = stitch(&d, &["Item".into(), "Qty".into(), "Price".into()], 2).unwrap();
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn table_node_types_cells_and_keeps_row_pages() {
        let d = doc(&[(1, PAGE_ONE), (2, PAGE_TWO)]);
        let c = extract(&d, &TableStrategy::default(), &lines_node()).unwrap();
        assert_eq!(
            c.value,
            json!([
                { "item": "Widget", "qty": 2, "price": 10.0 },
                { "item": "Gadget", "qty": 1, "price": 5.5 },
                { "item": "Bolt", "qty": 10, "price": 0.1 },
            ])
        );
        assert_eq!(c.row_pages, vec![1, 1, 2]);
        assert_eq!(c.source_page, Some(1));
        assert_eq!(c.match_quality, quality::TABLE_KEYWORDS);
    }

    #[test]
    fn columns_map_by_header_not_position() {
        let d = doc(&[(1, "Price     Item      Qty\n3.00      Nut       4\n")]);
        let c = extract(&d, &TableStrategy::default(), &lines_node()).unwrap();
        assert_eq!(c.value, json!([{ "item": "Nut", "qty": 4, "price": 3.0 }]));
    }

    #[test]
    fn gap_in_page_numbers_stops_stitching() {
        let d = doc(&[(1, PAGE_ONE), (3, PAGE_TWO)]);
        let c = extract(&d, &TableStrategy::default(), &lines_node()).unwrap();
        assert_eq!(c.row_pages, vec![1, 1]);
    }

    #[test]
    fn scalar_field_reads_one_cell() {
        let d = doc(&[(1, PAGE_ONE), (2, PAGE_TWO)]);
        let node = SchemaNode::Field {
            key: "first_price".into(),
            field_type: FieldType::Number,
            strategy: None,
            fallback: None,
            key_field: false,
            description: None,
        };
        let strategy = TableStrategy {
            header_keywords: vec!["item".into(), "price".into()],
            column: Some("price".into()),
            row: 2,
            ..TableStrategy::default()
        };
        let c = extract(&d, &strategy, &node).unwrap();
        assert_eq!(c.value, json!(0.1));
        assert_eq!(c.source_page, Some(2));

        let missing_column = TableStrategy {
            column: Some("discount".into()),
            ..strategy
        };
        assert!(extract(&d, &missing_column, &node).is_none());
    }

    #[test]
    fn array_node_reads_one_column() {
        let d = doc(&[(1, PAGE_ONE)]);
        let node = SchemaNode::Array {
            key: "items".into(),
            item_type: FieldType::String,
            items: vec![],
            strategy: None,
            fallback: None,
            key_field: false,
        };
        let strategy = TableStrategy {
            header_keywords: vec!["item".into(), "qty".into()],
            column: Some("Item".into()),
            ..TableStrategy::default()
        };
        let c = extract(&d, &strategy, &node).unwrap();
        assert_eq!(c.value, json!(["Widget", "Gadget"]));
        assert_eq!(c.row_pages, vec![1, 1]);
    }

    #[test]
    fn heuristic_detection_scores_lower() {
        let d = doc(&[(1, "Name     Amount     Date\nAlpha    10.00      2024-01-01\n")]);
        let node = SchemaNode::Array {
            key: "names".into(),
            item_type: FieldType::String,
            items: vec![],
            strategy: None,
            fallback: None,
            key_field: false,
        };
        let c = extract(&d, &TableStrategy::default(), &node).unwrap();
        assert_eq!(c.value, json!(["Alpha"]));
        assert_eq!(c.match_quality, quality::TABLE_HEURISTIC);
    }

    #[test]
    fn no_table_is_none() {
        let d = doc(&[(1, "Just a letter.\nNo columns here.")]);
        assert!(extract(&d, &TableStrategy::default(), &lines_node()).is_none());
    }
}
