//! # Document parsers
//!
//! One capability interface, [`DocumentParser`], and a [`ParserRegistry`] of
//! tagged implementations keyed by mime type. Call sites resolve a parser by
//! the declared mime string and never name a concrete implementation, so new
//! formats slot in without touching the pipeline.
//!
//! Supported out of the box: CSV, PDF, plain text, and JSON. An unknown mime
//! type is a *rejection* ([`RagweedError::Validation`]) rather than a pipeline
//! failure; the upload never gets as far as parsing.

use std::collections::BTreeMap;

use crate::error::{RagweedError, Result};

/// One logical document produced by a parser.
///
/// A single upload can yield several of these (a CSV yields one per record);
/// each is split and embedded independently downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    /// Extracted text content.
    pub content: String,
    /// Parser-specific provenance (row numbers and the like).
    pub metadata: BTreeMap<String, String>,
}

impl ParsedDocument {
    fn new(content: String) -> Self {
        Self {
            content,
            metadata: BTreeMap::new(),
        }
    }
}

/// Capability interface for turning raw bytes into logical documents.
pub trait DocumentParser: Send + Sync {
    /// Mime types this parser accepts.
    fn mime_types(&self) -> &'static [&'static str];

    /// Parse raw bytes into zero or more logical documents.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<ParsedDocument>>;
}

/// CSV: one logical document per record, rendered as `header: value` lines.
pub struct CsvParser;

impl DocumentParser for CsvParser {
    fn mime_types(&self) -> &'static [&'static str] {
        &["text/csv"]
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<ParsedDocument>> {
        let mut reader = csv::Reader::from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| RagweedError::Validation(format!("invalid CSV header: {e}")))?
            .clone();

        let mut documents = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record =
                record.map_err(|e| RagweedError::Validation(format!("invalid CSV row: {e}")))?;
            let content = headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| format!("{header}: {value}"))
                .collect::<Vec<_>>()
                .join("\n");
            let mut document = ParsedDocument::new(content);
            document.metadata.insert("row".to_string(), (row + 1).to_string());
            documents.push(document);
        }
        Ok(documents)
    }
}

/// PDF: the whole file extracted as one document (no per-page split).
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn mime_types(&self) -> &'static [&'static str] {
        &["application/pdf"]
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<ParsedDocument>> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| RagweedError::Validation(format!("cannot extract PDF text: {e}")))?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ParsedDocument::new(text)])
    }
}

/// Plain text: the whole file as one document. Must be valid UTF-8.
pub struct TextParser;

impl DocumentParser for TextParser {
    fn mime_types(&self) -> &'static [&'static str] {
        &["text/plain"]
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<ParsedDocument>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RagweedError::Validation(format!("text file is not UTF-8: {e}")))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ParsedDocument::new(text.to_string())])
    }
}

/// JSON: every string value in the document, depth-first, one line each,
/// gathered into a single logical document.
pub struct JsonParser;

impl JsonParser {
    fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => out.push(s.clone()),
            serde_json::Value::Array(items) => {
                for item in items {
                    Self::collect_strings(item, out);
                }
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    Self::collect_strings(item, out);
                }
            }
            _ => {}
        }
    }
}

impl DocumentParser for JsonParser {
    fn mime_types(&self) -> &'static [&'static str] {
        &["application/json"]
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<ParsedDocument>> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| RagweedError::Validation(format!("invalid JSON: {e}")))?;
        let mut strings = Vec::new();
        Self::collect_strings(&value, &mut strings);
        if strings.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ParsedDocument::new(strings.join("\n"))])
    }
}

/// Fixed registry of parsers, resolved by mime type.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// An empty registry; mostly useful in tests.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// The registry with all built-in parsers.
    pub fn with_default_parsers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CsvParser));
        registry.register(Box::new(PdfParser));
        registry.register(Box::new(TextParser));
        registry.register(Box::new(JsonParser));
        registry
    }

    /// Add a parser. Later registrations win on mime-type collisions.
    pub fn register(&mut self, parser: Box<dyn DocumentParser>) {
        self.parsers.push(parser);
    }

    /// Find the parser for a mime type.
    pub fn resolve(&self, mime_type: &str) -> Option<&dyn DocumentParser> {
        self.parsers
            .iter()
            .rev()
            .find(|p| p.mime_types().contains(&mime_type))
            .map(|p| p.as_ref())
    }

    /// Parse `bytes` with the parser registered for `mime_type`.
    ///
    /// # Errors
    /// [`RagweedError::Validation`] when no parser handles the mime type or
    /// when the selected parser rejects the bytes.
    pub fn parse(&self, mime_type: &str, bytes: &[u8]) -> Result<Vec<ParsedDocument>> {
        let parser = self.resolve(mime_type).ok_or_else(|| {
            RagweedError::Validation(format!("unsupported file type: {mime_type}"))
        })?;
        parser.parse(bytes)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_default_parsers()
    }
}
