//! # Ingestion pipeline
//!
//! Turns an uploaded byte buffer into persisted, embedded chunks:
//!
//! 1. select a parser by mime type from the registry (unknown type is a
//!    rejection, not a pipeline failure),
//! 2. parse into logical documents,
//! 3. split each document into overlapping fixed-size windows,
//! 4. batch-embed every window in one gateway call,
//! 5. persist all chunks for the resource in one transaction.
//!
//! **Atomicity**: if anything past parser selection fails (parse error,
//! embedding failure, store failure), the error comes back as
//! [`RagweedError::PartialIngestion`] and zero chunks remain visible for the
//! resource. A partial chunk set would silently degrade retrieval with no
//! signal, so it is forbidden outright.
//!
//! Mime/size validation against the upload whitelist happens in the calling
//! layer before this module is reached.

use diesel::prelude::*;
use std::sync::Arc;
use tracing::info;

use crate::error::{RagweedError, Result};
use crate::gateway::EmbeddingGateway;
use crate::models::DocumentChunk;
use crate::parser::{ParsedDocument, ParserRegistry};
use crate::vector_store::ChunkStore;

/// Splits text into overlapping fixed-size character windows.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    /// Create a splitter.
    ///
    /// # Errors
    /// [`RagweedError::Validation`] unless `chunk_size` is positive and
    /// `chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagweedError::Validation("chunk_size must be positive".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagweedError::Validation(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    /// Split `text` into windows of `chunk_size` characters, each starting
    /// `chunk_size - chunk_overlap` characters after the previous one.
    ///
    /// Windows are counted in characters, not bytes, so multi-byte text never
    /// splits inside a code point. Empty input yields no windows.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        let step = self.chunk_size - self.chunk_overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let end = usize::min(start + self.chunk_size, chars.len());
            windows.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        windows
    }
}

/// The parse → split → embed → persist pipeline.
pub struct IngestionPipeline {
    registry: Arc<ParserRegistry>,
    splitter: TextSplitter,
    embedding: Arc<EmbeddingGateway>,
    chunk_store: Arc<ChunkStore>,
}

impl IngestionPipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        registry: Arc<ParserRegistry>,
        splitter: TextSplitter,
        embedding: Arc<EmbeddingGateway>,
        chunk_store: Arc<ChunkStore>,
    ) -> Self {
        Self {
            registry,
            splitter,
            embedding,
            chunk_store,
        }
    }

    /// Ingest one uploaded buffer for an existing resource.
    ///
    /// # Returns
    /// The number of chunks persisted (equals the splitter's window count).
    ///
    /// # Errors
    /// - [`RagweedError::Validation`] when no parser handles `mime_type`.
    /// - [`RagweedError::PartialIngestion`] when any later step fails; zero
    ///   chunks for `resource_id` are visible afterwards.
    pub async fn run(
        &self,
        conn: &mut SqliteConnection,
        resource_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<usize> {
        let parser = self.registry.resolve(mime_type).ok_or_else(|| {
            RagweedError::Validation(format!("unsupported file type: {mime_type}"))
        })?;

        let failed = |reason: String| RagweedError::PartialIngestion {
            resource_id: resource_id.to_string(),
            reason,
        };

        let documents = parser
            .parse(bytes)
            .map_err(|e| failed(format!("parse: {e}")))?;

        let (texts, metadata) = self.split_documents(&documents);
        if texts.is_empty() {
            info!("resource {resource_id} produced no text windows");
            return Ok(0);
        }

        let vectors = self
            .embedding
            .embed(&texts)
            .await
            .map_err(|e| failed(format!("embed: {e}")))?;

        let mut chunks = Vec::with_capacity(texts.len());
        for ((content, metadata), vector) in
            texts.into_iter().zip(metadata.into_iter()).zip(vectors)
        {
            chunks.push(DocumentChunk {
                id: None,
                content,
                embedding: DocumentChunk::encode_embedding(&vector)
                    .map_err(|e| failed(format!("encode: {e}")))?,
                metadata,
                resource_id: resource_id.to_string(),
            });
        }

        let stored = self
            .chunk_store
            .store(conn, chunks)
            .map_err(|e| failed(format!("store: {e}")))?;

        info!("ingested {} chunks for resource {resource_id}", stored.len());
        Ok(stored.len())
    }

    /// Window every document, carrying the parser's metadata plus the window
    /// index into each chunk's metadata JSON.
    fn split_documents(&self, documents: &[ParsedDocument]) -> (Vec<String>, Vec<String>) {
        let mut texts = Vec::new();
        let mut metadata = Vec::new();
        for document in documents {
            for (window_index, window) in self.splitter.split(&document.content).into_iter().enumerate()
            {
                let mut map = document.metadata.clone();
                map.insert("window".to_string(), window_index.to_string());
                texts.push(window);
                metadata.push(serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string()));
            }
        }
        (texts, metadata)
    }
}
