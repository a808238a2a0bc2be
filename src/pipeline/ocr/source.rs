use super::OcrError;

/// One page of a source document, ready for an OCR engine.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based.
    pub number: usize,
    pub bytes: Vec<u8>,
}

/// Splits an uploaded file into pages.
pub trait PageSource: Send + Sync {
    fn split(&self, file_bytes: &[u8]) -> Result<Vec<PageImage>, OcrError>;
}

/// Text documents with pages separated by form feed (`\x0c`), the way
/// `pdftotext` emits them. A trailing form feed does not open a new page.
pub struct TextPageSource;

impl PageSource for TextPageSource {
    fn split(&self, file_bytes: &[u8]) -> Result<Vec<PageImage>, OcrError> {
        if file_bytes.is_empty() {
            return Err(OcrError::Unreadable("file is empty".into()));
        }
        let mut parts: Vec<&[u8]> = file_bytes.split(|b| *b == 0x0c).collect();
        if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| PageImage {
                number: i + 1,
                bytes: bytes.to_vec(),
            })
            .collect())
    }
}
