//! Format adapters: raw document bytes → plain UTF-8 text.
//!
//! Each supported [`DocumentFormat`] has one [`TextExtractor`] registered
//! in an [`ExtractorRegistry`]. Adapters are interchangeable per format;
//! the processor only ever talks to the registry.
//!
//! | Format | Adapter | Library |
//! |--------|---------|---------|
//! | text, markdown | [`PlainTextExtractor`] | strict UTF-8 decode |
//! | pdf | [`PdfExtractor`] | `pdf-extract` |
//! | docx | [`DocxExtractor`] | `zip` + `quick-xml` |
//!
//! Every failure is reported as [`Error::CorruptInput`]; adapters never panic
//! on malformed input they can detect.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use hearth_core::models::DocumentFormat;
use hearth_core::{Error, Result};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Turns the raw bytes of one format into plain text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String>;
}

/// Strict UTF-8 decoding for `.txt` and `.md`. A leading BOM is dropped.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| Error::CorruptInput(format!("invalid UTF-8: {e}")))
    }
}

pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| Error::CorruptInput(format!("PDF extraction failed: {e}")))
    }
}

/// Reads `word/document.xml` and joins its `<w:t>` runs, one line per paragraph.
pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ooxml_error(e.to_string()))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ooxml_error("word/document.xml not found".to_string()))?;
        let mut doc_xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ooxml_error(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ooxml_error(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
        extract_paragraphs(&doc_xml)
    }
}

fn ooxml_error(msg: String) -> Error {
    Error::CorruptInput(format!("DOCX extraction failed: {msg}"))
}

fn extract_paragraphs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ooxml_error(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_error(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Per-format adapter lookup.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<DocumentFormat, Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry with an adapter for every supported format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let plain: Arc<dyn TextExtractor> = Arc::new(PlainTextExtractor);
        registry.register(DocumentFormat::Text, plain.clone());
        registry.register(DocumentFormat::Markdown, plain);
        registry.register(DocumentFormat::Pdf, Arc::new(PdfExtractor));
        registry.register(DocumentFormat::Docx, Arc::new(DocxExtractor));
        registry
    }

    /// Install or replace the adapter for `format`.
    pub fn register(&mut self, format: DocumentFormat, extractor: Arc<dyn TextExtractor>) {
        self.extractors.insert(format, extractor);
    }

    pub fn extract(&self, format: DocumentFormat, bytes: &[u8]) -> Result<String> {
        let extractor = self.extractors.get(&format).ok_or_else(|| {
            Error::UnsupportedFormat(format!("no extractor registered for {format}"))
        })?;
        extractor.extract(bytes)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_strips_bom() {
        let text = PlainTextExtractor.extract(b"\xEF\xBB\xBFhello").unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn invalid_utf8_is_corrupt_input() {
        let err = PlainTextExtractor.extract(&[0x66, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::CorruptInput(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = ExtractorRegistry::with_defaults()
            .extract(DocumentFormat::Pdf, b"not a pdf")
            .unwrap_err();
        assert!(matches!(err, Error::CorruptInput(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = ExtractorRegistry::with_defaults()
            .extract(DocumentFormat::Docx, b"not a zip")
            .unwrap_err();
        assert!(matches!(err, Error::CorruptInput(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = br#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Boil water </w:t></w:r><w:r><w:t>for one minute.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Let it cool &amp; store.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_paragraphs(xml).unwrap();
        assert_eq!(text, "Boil water for one minute.\nLet it cool & store.\n");
    }

    #[test]
    fn missing_adapter_is_unsupported() {
        let err = ExtractorRegistry::empty()
            .extract(DocumentFormat::Text, b"x")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn adapters_are_replaceable() {
        struct Shouty;
        impl TextExtractor for Shouty {
            fn extract(&self, bytes: &[u8]) -> Result<String> {
                Ok(String::from_utf8_lossy(bytes).to_uppercase())
            }
        }
        let mut registry = ExtractorRegistry::with_defaults();
        registry.register(DocumentFormat::Markdown, Arc::new(Shouty));
        assert_eq!(registry.extract(DocumentFormat::Markdown, b"hi").unwrap(), "HI");
        assert_eq!(registry.extract(DocumentFormat::Text, b"hi").unwrap(), "hi");
    }
}
