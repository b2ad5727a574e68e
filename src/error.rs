//! # Error taxonomy
//!
//! Every fallible operation in the crate returns [`RagweedError`]. The variants
//! partition failures by who is at fault and what the caller may do about them:
//!
//! - [`Validation`](RagweedError::Validation): the caller's input was bad
//!   (unsupported mime type, oversized upload, malformed attribute request).
//!   Retrying without changing the input is pointless.
//! - [`NotFound`](RagweedError::NotFound): a referenced resource, conversation,
//!   user, or message does not exist.
//! - [`ExternalService`](RagweedError::ExternalService): the embedding or
//!   generation endpoint timed out, was unreachable, or returned garbage. The
//!   caller may retry with backoff; the core never retries on its own.
//! - [`Persistence`](RagweedError::Persistence): the store is unavailable or a
//!   constraint was violated.
//! - [`PartialIngestion`](RagweedError::PartialIngestion): an ingestion step
//!   after parser selection failed. The pipeline guarantees zero chunks remain
//!   for the resource when this is returned.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RagweedError>;

/// Unified error type for the ragweed core.
#[derive(Error, Debug)]
pub enum RagweedError {
    /// The caller supplied invalid input. Not retryable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"conversation"` or `"resource"`.
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// An embedding/generation gateway call timed out or misbehaved.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// The persistent store failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An ingestion step after parser selection failed; no chunks were kept.
    #[error("ingestion failed for resource {resource_id}: {reason}")]
    PartialIngestion {
        /// Resource whose chunks were rolled back.
        resource_id: String,
        /// What went wrong (parse, embed, or store).
        reason: String,
    },
}

impl RagweedError {
    /// Shorthand for a [`RagweedError::NotFound`] with an owned id.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<diesel::result::Error> for RagweedError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<diesel::result::ConnectionError> for RagweedError {
    fn from(err: diesel::result::ConnectionError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<async_openai::error::OpenAIError> for RagweedError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        Self::ExternalService(err.to_string())
    }
}

impl From<reqwest::Error> for RagweedError {
    fn from(err: reqwest::Error) -> Self {
        Self::ExternalService(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_entity_and_id() {
        let err = RagweedError::not_found("conversation", "42");
        assert_eq!(err.to_string(), "conversation not found: 42");
    }

    #[test]
    fn diesel_errors_map_to_persistence() {
        let err: RagweedError = diesel::result::Error::NotFound.into();
        assert!(matches!(err, RagweedError::Persistence(_)));
    }
}
