//! Configuration loading and database bootstrap.
//!
//! Defines [`RagweedConfig`], the YAML-backed configuration for the whole
//! service, plus helpers to open the SQLite database and create its tables.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use ragweed::config::{RagweedConfig, load_config};
//!
//! let config: RagweedConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config);
//! ```

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

use crate::error::{RagweedError, Result};

/// Distance metric used by the chunk store for nearest-neighbor ranking.
///
/// Chosen once in configuration and fixed for the store's lifetime; chunks
/// indexed under one metric are never compared under another.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity).
    Cosine,
    /// Euclidean (L2) distance.
    L2,
}

/// Represents the application's configuration.
///
/// Holds the gateway endpoints, model names, chunking and retrieval knobs, and
/// the background-extraction queue parameters. Constructed by deserializing a
/// YAML file via [`load_config`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RagweedConfig {
    /// The API key used to authenticate requests to the model endpoint.
    pub api_key: String,

    /// Base URL of the OpenAI-compatible endpoint (e.g. `http://localhost:11434/v1`).
    pub api_base: String,

    /// Model used for answer generation, query rewriting, and extraction.
    pub chat_model: String,

    /// Model used for text embeddings.
    pub embedding_model: String,

    /// Output dimension of the embedding model. Every stored chunk vector and
    /// every query vector must have exactly this length.
    pub embedding_dimensions: usize,

    /// Nearest-neighbor metric for the chunk store.
    #[serde(default = "default_metric")]
    pub distance_metric: DistanceMetric,

    /// Character length of each document window.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Character overlap between consecutive windows. Must be < `chunk_size`.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Number of chunks retrieved per query unless the caller overrides it.
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,

    /// Upper bound on any single gateway call, in seconds.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// Token budget for conversation history injected into generation requests,
    /// counted with the cl100k tokenizer. Oldest turns are dropped first.
    #[serde(default = "default_history_max_tokens")]
    pub history_max_tokens: usize,

    /// SQLite database url (a filesystem path).
    pub database_url: String,

    /// Maximum accepted upload size in bytes. Enforced by the calling layer
    /// before ingestion, exposed here so all callers agree on one number.
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: usize,

    /// Maximum number of conversations kept warm in session memory.
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,

    /// Bound on the background extraction queue.
    #[serde(default = "default_extraction_queue_depth")]
    pub extraction_queue_depth: usize,

    /// Attempts per extraction job before it is dead-lettered.
    #[serde(default = "default_extraction_max_attempts")]
    pub extraction_max_attempts: u32,

    /// Base backoff between extraction attempts, in milliseconds (doubled per
    /// attempt).
    #[serde(default = "default_extraction_backoff_ms")]
    pub extraction_backoff_ms: u64,
}

fn default_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_retrieval_k() -> usize {
    5
}

fn default_gateway_timeout_secs() -> u64 {
    60
}

fn default_history_max_tokens() -> usize {
    2048
}

fn default_max_file_size_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_session_cache_capacity() -> usize {
    256
}

fn default_extraction_queue_depth() -> usize {
    64
}

fn default_extraction_max_attempts() -> u32 {
    3
}

fn default_extraction_backoff_ms() -> u64 {
    250
}

/// Mime types the default parser registry understands. The calling layer
/// rejects anything else before the pipeline runs.
pub const SUPPORTED_MIME_TYPES: [&str; 4] = [
    "text/csv",
    "application/pdf",
    "text/plain",
    "application/json",
];

/// Returns `true` when `mime_type` is one of [`SUPPORTED_MIME_TYPES`].
pub fn is_supported_mime_type(mime_type: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime_type)
}

/// Loads the application's configuration from a YAML file.
///
/// # Parameters
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
/// - `Ok(RagweedConfig)`: The loaded configuration.
/// - `Err(RagweedError::Validation)`: The file could not be read or parsed, or
///   the chunking parameters are inconsistent.
pub fn load_config(file: &str) -> Result<RagweedConfig> {
    debug!("loading config from {file}");
    let content = fs::read_to_string(file)
        .map_err(|e| RagweedError::Validation(format!("cannot read config {file}: {e}")))?;
    let config: RagweedConfig = serde_yaml::from_str(&content)
        .map_err(|e| RagweedError::Validation(format!("cannot parse config {file}: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl RagweedConfig {
    /// Check the invariants that YAML cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagweedError::Validation(
                "chunk_size must be positive".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagweedError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(RagweedError::Validation(
                "embedding_dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Open a SQLite connection with foreign-key enforcement switched on.
///
/// The busy timeout covers the request workers and the background extraction
/// worker writing through separate connections.
pub fn establish_connection(db_url: &str) -> Result<SqliteConnection> {
    let mut connection = SqliteConnection::establish(db_url)?;
    connection
        .batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        .map_err(|e| RagweedError::Persistence(e.to_string()))?;
    Ok(connection)
}

/// Create the schema if it does not exist yet.
///
/// The application owns its DDL; there is no external migration step. Safe to
/// call on every startup.
pub fn initialize_database(connection: &mut SqliteConnection) -> Result<()> {
    connection
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY NOT NULL,
                mime_type TEXT NOT NULL,
                file_size BIGINT NOT NULL,
                uploaded_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                resource_id TEXT NOT NULL
                    REFERENCES resources(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                required_attributes TEXT NOT NULL DEFAULT '[]',
                extracted_attributes TEXT NOT NULL DEFAULT '{}',
                last_extraction_date TIMESTAMP,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id),
                title TEXT,
                summary TEXT,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                conversation_id INTEGER NOT NULL
                    REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_resource
                ON document_chunks(resource_id);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
            "#,
        )
        .map_err(|e| RagweedError::Persistence(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(extra: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
api_key: "example_api_key"
api_base: "http://example.com/v1"
chat_model: "example-chat"
embedding_model: "example-embed"
embedding_dimensions: 8
database_url: "ragweed.db"
{extra}
"#
        )
        .unwrap();
        temp_file
    }

    #[test]
    fn test_load_config_valid_file() {
        let temp_file = write_config("");
        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.api_key, "example_api_key");
        assert_eq!(config.chat_model, "example-chat");
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.retrieval_k, 5);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(config.is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let temp_file = write_config("chunk_size: 100\nchunk_overlap: 100");
        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(matches!(config, Err(RagweedError::Validation(_))));
    }

    #[test]
    fn test_mime_whitelist() {
        assert!(is_supported_mime_type("text/plain"));
        assert!(is_supported_mime_type("application/pdf"));
        assert!(!is_supported_mime_type("image/png"));
    }

    #[test]
    fn test_initialize_database_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        let mut conn = establish_connection(db.to_str().unwrap()).unwrap();
        initialize_database(&mut conn).unwrap();
        initialize_database(&mut conn).unwrap();
    }
}
