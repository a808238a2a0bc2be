use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;

use super::{OcrError, PageImage};
use crate::models::{BoundingBox, OcrBlock};

/// Raw engine output for one page.
#[derive(Debug, Clone)]
pub struct OcrPageResult {
    pub text: String,
    /// 0.0-1.0
    pub confidence: f32,
    pub blocks: Vec<OcrBlock>,
}

impl OcrPageResult {
    /// Text joined from blocks, confidence averaged over them.
    pub fn from_blocks(blocks: Vec<OcrBlock>) -> Self {
        let confidence = if blocks.is_empty() {
            0.0
        } else {
            blocks.iter().map(|b| b.confidence).sum::<f32>() / blocks.len() as f32
        };
        let text = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            text,
            confidence,
            blocks,
        }
    }

    /// Empty or zero-confidence output counts as a failed read.
    pub fn is_usable(&self) -> bool {
        !self.text.trim().is_empty() && self.confidence > 0.0
    }
}

/// OCR engine abstraction (allows mocking for tests). Calls are blocking and
/// run on the blocking thread pool.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, page: &PageImage) -> Result<OcrPageResult, OcrError>;
}

/// Engines by configured name.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn OcrEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, engine: Arc<dyn OcrEngine>) -> Self {
        self.register(name, engine);
        self
    }

    pub fn register(&mut self, name: &str, engine: Arc<dyn OcrEngine>) {
        self.engines.insert(name.to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OcrEngine>> {
        self.engines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

const CHAR_WIDTH_PX: u32 = 10;
const LINE_HEIGHT_PX: u32 = 20;

/// Born-digital pages: the page bytes already are UTF-8 text. Each word
/// becomes a block at confidence 1.0 with a synthetic monospace grid box,
/// so coordinate-based anchors work on text input too.
pub struct PlainTextOcr;

impl OcrEngine for PlainTextOcr {
    fn recognize(&self, page: &PageImage) -> Result<OcrPageResult, OcrError> {
        let text = std::str::from_utf8(&page.bytes).map_err(|e| OcrError::Engine {
            engine: "plain_text".into(),
            message: format!("page {} is not UTF-8 text: {e}", page.number),
        })?;
        let mut blocks = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            for (start, word) in split_words(line) {
                let col = line[..start].chars().count();
                blocks.push(OcrBlock {
                    text: word.to_string(),
                    confidence: 1.0,
                    bounding_box: Some(BoundingBox {
                        x: col as u32 * CHAR_WIDTH_PX,
                        y: line_no as u32 * LINE_HEIGHT_PX,
                        width: word.chars().count() as u32 * CHAR_WIDTH_PX,
                        height: LINE_HEIGHT_PX - 4,
                    }),
                });
            }
        }
        let confidence = if text.trim().is_empty() { 0.0 } else { 1.0 };
        Ok(OcrPageResult {
            text: text.trim_end_matches(['\n', '\r']).to_string(),
            confidence,
            blocks,
        })
    }
}

/// Whitespace-separated words with their byte offsets.
fn split_words(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

// ---------------------------------------------------------------------------
// Remote engine
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RemoteBlock {
    text: String,
    confidence: f32,
    #[serde(default)]
    bbox: Option<BoundingBox>,
}

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    blocks: Vec<RemoteBlock>,
    /// Raw Tesseract TSV, accepted instead of `blocks`.
    #[serde(default)]
    tsv: Option<String>,
}

/// OCR service over HTTP: POSTs the base64 page image as JSON and reads
/// word blocks back, either as JSON or as Tesseract TSV.
pub struct HttpOcrEngine {
    name: String,
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpOcrEngine {
    /// Must be built outside an async context (blocking client).
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, OcrError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn engine_error(&self, message: String) -> OcrError {
        OcrError::Engine {
            engine: self.name.clone(),
            message,
        }
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recognize(&self, page: &PageImage) -> Result<OcrPageResult, OcrError> {
        let body = serde_json::json!({
            "page": page.number,
            "image": base64::engine::general_purpose::STANDARD.encode(&page.bytes),
        });
        let response = self
            .client
            .post(format!("{}/ocr", self.url))
            .json(&body)
            .send()
            .map_err(|e| self.engine_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(self.engine_error(format!("HTTP {status}: {text}")));
        }

        let parsed: RemoteResponse = response
            .json()
            .map_err(|e| self.engine_error(format!("bad response body: {e}")))?;

        let blocks = match parsed.tsv {
            Some(tsv) => parse_tesseract_tsv(&tsv),
            None => parsed
                .blocks
                .into_iter()
                .map(|b| OcrBlock {
                    text: b.text,
                    confidence: b.confidence.clamp(0.0, 1.0),
                    bounding_box: b.bbox,
                })
                .collect(),
        };
        Ok(OcrPageResult::from_blocks(blocks))
    }
}

/// Parse Tesseract TSV output into word blocks.
/// Columns: level page_num block_num par_num line_num word_num left top width height conf text.
/// Level 5 = individual word entries. Confidence is 0-100, scaled to 0.0-1.0.
pub fn parse_tesseract_tsv(tsv: &str) -> Vec<OcrBlock> {
    let mut results = Vec::new();

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        let level: i32 = match fields[0].parse() {
            Ok(l) => l,
            Err(_) => continue,
        };
        if level != 5 {
            continue;
        }

        let conf: f32 = match fields[10].parse() {
            Ok(c) => c,
            Err(_) => continue,
        };

        let word = fields[11].trim();
        if word.is_empty() {
            continue;
        }

        // -1 means no confidence assigned
        let confidence = if conf < 0.0 { 0.0 } else { conf / 100.0 };

        results.push(OcrBlock {
            text: word.to_string(),
            confidence,
            bounding_box: parse_bounding_box(fields[6], fields[7], fields[8], fields[9]),
        });
    }

    results
}

fn parse_bounding_box(left: &str, top: &str, width: &str, height: &str) -> Option<BoundingBox> {
    Some(BoundingBox {
        x: left.parse().ok()?,
        y: top.parse().ok()?,
        width: width.parse().ok()?,
        height: height.parse().ok()?,
    })
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Mock OCR engine: same text and confidence for every page.
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn recognize(&self, _page: &PageImage) -> Result<OcrPageResult, OcrError> {
        let blocks = self
            .text
            .split_whitespace()
            .map(|w| OcrBlock {
                text: w.to_string(),
                confidence: self.confidence,
                bounding_box: None,
            })
            .collect();
        Ok(OcrPageResult {
            text: self.text.clone(),
            confidence: self.confidence,
            blocks,
        })
    }
}

/// Per-page scripted engine. Records calls and peak concurrency; pages can
/// be delayed to force out-of-order completion.
#[derive(Default)]
pub struct ScriptedOcrEngine {
    pages: HashMap<usize, (String, f32)>,
    failing: HashSet<usize>,
    delays: HashMap<usize, Duration>,
    default_delay: Option<Duration>,
    calls: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedOcrEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, number: usize, text: &str, confidence: f32) -> Self {
        self.pages.insert(number, (text.to_string(), confidence));
        self
    }

    pub fn fail_page(mut self, number: usize) -> Self {
        self.failing.insert(number);
        self
    }

    pub fn delay_page(mut self, number: usize, delay: Duration) -> Self {
        self.delays.insert(number, delay);
        self
    }

    pub fn delay_all(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl OcrEngine for ScriptedOcrEngine {
    fn recognize(&self, page: &PageImage) -> Result<OcrPageResult, OcrError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(page.number);
        }

        if let Some(delay) = self.delays.get(&page.number).copied().or(self.default_delay) {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&page.number) {
            return Err(OcrError::Engine {
                engine: "scripted".into(),
                message: format!("page {} failed", page.number),
            });
        }
        let (text, confidence) = self
            .pages
            .get(&page.number)
            .cloned()
            .unwrap_or_default();
        Ok(OcrPageResult {
            blocks: text
                .split_whitespace()
                .map(|w| OcrBlock {
                    text: w.to_string(),
                    confidence,
                    bounding_box: None,
                })
                .collect(),
            text,
            confidence,
        })
    }
}
