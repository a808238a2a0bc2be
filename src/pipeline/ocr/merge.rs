use crate::models::PageOcr;

/// Byte range of one page inside the merged text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub page: usize,
    pub start: usize,
    pub end: usize,
}

/// Pages in ascending order joined by the separator, with the offsets
/// needed to map a match back to its source page.
#[derive(Debug, Clone)]
pub struct MergedDocument {
    pub text: String,
    pub pages: Vec<PageOcr>,
    pub spans: Vec<PageSpan>,
    pub separator: String,
}

impl MergedDocument {
    /// Sorts by page number regardless of input order.
    pub fn from_pages(mut pages: Vec<PageOcr>, separator: &str) -> Self {
        pages.sort_by_key(|p| p.page_number);
        let mut text = String::new();
        let mut spans = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            if i > 0 {
                text.push_str(separator);
            }
            let start = text.len();
            text.push_str(&page.text);
            spans.push(PageSpan {
                page: page.page_number,
                start,
                end: text.len(),
            });
        }
        Self {
            text,
            pages,
            spans,
            separator: separator.to_string(),
        }
    }

    /// Page containing byte `offset`. Offsets inside a separator belong to
    /// the following page.
    pub fn page_at(&self, offset: usize) -> Option<usize> {
        self.spans
            .iter()
            .find(|s| offset < s.end || (offset == s.end && s.start == s.end))
            .or_else(|| self.spans.last())
            .map(|s| s.page)
    }

    pub fn page(&self, number: usize) -> Option<&PageOcr> {
        self.pages.iter().find(|p| p.page_number == number)
    }

    /// Mean confidence of non-empty pages.
    pub fn mean_confidence(&self) -> f32 {
        let read: Vec<f32> = self
            .pages
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.confidence)
            .collect();
        if read.is_empty() {
            0.0
        } else {
            read.iter().sum::<f32>() / read.len() as f32
        }
    }

    /// OCR confidence for a value found on `page`.
    pub fn confidence_for(&self, page: Option<usize>, value: &str) -> f32 {
        match page.and_then(|n| self.page(n)) {
            Some(p) => p.confidence_for(value),
            None => self.mean_confidence(),
        }
    }

    /// Text of the given 1-based inclusive page range, joined by the separator.
    pub fn text_for_pages(&self, first: usize, last: usize) -> String {
        self.pages
            .iter()
            .filter(|p| p.page_number >= first && p.page_number <= last)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}
