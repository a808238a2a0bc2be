use serde::{Deserialize, Serialize};

/// Bounding box for a text block, in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn overlaps_vertically(&self, other: &BoundingBox) -> bool {
        self.y < other.bottom() && other.y < self.bottom()
    }

    pub fn overlaps_horizontally(&self, other: &BoundingBox) -> bool {
        self.x < other.right() && other.x < self.right()
    }
}

/// One recognised block of text with its engine confidence (0.0-1.0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub confidence: f32,
    pub bounding_box: Option<BoundingBox>,
}

/// OCR output for a single page, as stored on the Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOcr {
    /// 1-based page number in the source document.
    pub page_number: usize,
    pub text: String,
    /// Page-level confidence (0.0-1.0).
    pub confidence: f32,
    pub blocks: Vec<OcrBlock>,
    /// Engine that produced the accepted result, `None` when every engine failed.
    pub engine: Option<String>,
}

impl PageOcr {
    pub fn empty(page_number: usize) -> Self {
        Self {
            page_number,
            text: String::new(),
            confidence: 0.0,
            blocks: Vec::new(),
            engine: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Mean confidence of blocks whose text overlaps `value`, falling back to
    /// the page confidence when no block matches.
    pub fn confidence_for(&self, value: &str) -> f32 {
        let needle = value.trim().to_lowercase();
        if needle.is_empty() {
            return self.confidence;
        }
        let matching: Vec<f32> = self
            .blocks
            .iter()
            .filter(|b| {
                let text = b.text.trim().to_lowercase();
                !text.is_empty() && (needle.contains(&text) || text.contains(&needle))
            })
            .map(|b| b.confidence)
            .collect();
        if matching.is_empty() {
            self.confidence
        } else {
            matching.iter().sum::<f32>() / matching.len() as f32
        }
    }
}
