//! # ragweed (library root)
//!
//! Retrieval-augmented answering core with per-conversation memory and
//! incremental user-attribute extraction:
//!
//! - Document ingestion: parse → window → embed → store ([`parser`],
//!   [`ingest`]).
//! - Chunk storage and nearest-neighbor retrieval over SQLite + an in-process
//!   HNSW index ([`vector_store`], [`store`]).
//! - The conversational retrieval-generation chain with session memory and
//!   history-aware query rewriting ([`chain`], [`session`]).
//! - The checkpointed attribute-extraction engine and its background queue
//!   ([`extraction`], [`queue`]).
//! - Model gateways over any OpenAI-compatible endpoint ([`gateway`]).
//! - The facade the HTTP/CLI layer talks to ([`service`]).
//!
//! The `rgw` binary in this crate is one such calling layer; everything it
//! does goes through [`service::RagweedService`].
//!
//! ## Modules
//! - [`chain`], [`config`], [`error`], [`extraction`], [`gateway`],
//!   [`ingest`], [`models`], [`parser`], [`prompts`], [`queue`], [`schema`],
//!   [`service`], [`session`], [`store`], [`vector_store`]

use directories::ProjectDirs;

pub mod chain;
pub mod config;
pub mod error;
pub mod extraction;
pub mod gateway;
pub mod ingest;
pub mod models;
pub mod parser;
pub mod prompts;
pub mod queue;
pub mod schema;
pub mod service;
pub mod session;
pub mod store;
pub mod vector_store;

use crate::error::{RagweedError, Result};

/// Return the per-platform configuration directory used by ragweed.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("io", "ragweed", "rgw")`, so you get the right place on each OS
/// (e.g., `~/.config/rgw` on Linux under XDG).
///
/// The directory is **not** created by this function; callers that need it
/// should create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be
/// determined (rare, but possible in heavily sandboxed environments).
pub fn config_dir() -> Result<std::path::PathBuf> {
    let proj_dirs = ProjectDirs::from("io", "ragweed", "rgw").ok_or_else(|| {
        RagweedError::Validation("unable to determine config directory".into())
    })?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
