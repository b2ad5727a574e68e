//! # Database models
//!
//! Data structures that map to the project's SQLite schema via **Diesel**.
//!
//! These models are used by higher-level modules to persist and query:
//!
//! - [`Resource`]: one uploaded document.
//! - [`DocumentChunk`]: a text fragment of a resource together with its
//!   embedding vector. Immutable after insertion; there is deliberately no
//!   update path for chunks anywhere in the crate.
//! - [`Conversation`] / [`Message`]: a user's chat threads and their turns.
//! - [`User`]: externally-identified user plus the attribute-extraction state
//!   (`required_attributes`, `extracted_attributes`, `last_extraction_date`).
//!
//! ## Diesel expectations
//!
//! This module assumes the tables created by
//! [`crate::config::initialize_database`] (see `crate::schema`). Each struct
//! derives the appropriate Diesel traits (`Queryable`, `Insertable`,
//! `Associations`, `Identifiable`, `Selectable`) and is annotated with
//! `#[diesel(table_name = ...)]` and `#[diesel(belongs_to(...))]` where needed.
//!
//! ## Attribute typing
//!
//! `required_attributes` and `extracted_attributes` are stored as JSON text but
//! never handed to callers raw: [`User::required_attribute_names`] and
//! [`User::attribute_map`] decode them into a `Vec<String>` and a
//! `BTreeMap<String, String>`. The extraction engine filters every model output
//! against the required set before anything reaches
//! [`User::extracted_attributes`].

use chrono::NaiveDateTime;
use diesel::prelude::*;
use std::collections::BTreeMap;

use crate::error::{RagweedError, Result};

/// Sender of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// A human turn.
    User,
    /// A model turn.
    Assistant,
}

impl MessageRole {
    /// The column value for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    /// Parse a column value. Anything but `"user"` / `"assistant"` is a
    /// validation error.
    pub fn parse(role: &str) -> Result<Self> {
        match role {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(RagweedError::Validation(format!(
                "unknown message role: {other}"
            ))),
        }
    }
}

/// An uploaded document.
///
/// ### Table
/// - `resources`
///
/// Deleting a resource deletes its chunks (enforced both by `ON DELETE CASCADE`
/// and by the explicit delete in the store layer).
#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::resources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Resource {
    /// Caller-supplied identifier (a UUID in practice).
    pub id: String,
    /// Declared mime type, validated by the calling layer.
    pub mime_type: String,
    /// Upload size in bytes.
    pub file_size: i64,
    /// Upload timestamp.
    pub uploaded_at: NaiveDateTime,
}

/// A fragment of a [`Resource`] with its embedding vector.
///
/// ### Table
/// - `document_chunks`
///
/// The embedding is stored as a bincode-encoded `Vec<f32>` so the floats
/// round-trip bit-exactly through SQLite.
#[derive(Queryable, Associations, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(Resource))]
#[diesel(table_name = crate::schema::document_chunks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentChunk {
    /// Auto-increment primary key (set by the DB on insert).
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// Raw chunk text.
    pub content: String,
    /// bincode-encoded embedding vector.
    pub embedding: Vec<u8>,
    /// Free-form metadata as a JSON object string.
    pub metadata: String,
    /// Foreign key to the owning [`Resource`].
    pub resource_id: String,
}

impl DocumentChunk {
    /// Encode an embedding vector into the BLOB column representation.
    pub fn encode_embedding(vector: &Vec<f32>) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(vector, bincode::config::standard())
            .map_err(|e| RagweedError::Persistence(format!("embedding encode failed: {e}")))
    }

    /// Decode the stored BLOB back into the embedding vector.
    pub fn embedding_vector(&self) -> Result<Vec<f32>> {
        let (vector, _) =
            bincode::serde::decode_from_slice(&self.embedding, bincode::config::standard())
                .map_err(|e| {
                    RagweedError::Persistence(format!("embedding decode failed: {e}"))
                })?;
        Ok(vector)
    }

    /// Decode the metadata JSON into a string map. Unknown shapes decode to an
    /// empty map rather than failing a read path.
    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// An externally-identified user and their attribute-extraction state.
///
/// ### Table
/// - `users`
///
/// ### Invariants
/// - Keys of `extracted_attributes` are always a subset of
///   `required_attributes` (enforced at the merge boundary and again on write).
/// - `last_extraction_date`, once set, never moves backwards.
#[derive(Queryable, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    /// Identifier assigned by the calling system.
    pub id: String,
    /// JSON array of attribute names the system must try to learn.
    pub required_attributes: String,
    /// JSON object of learned attribute values, keys ⊆ `required_attributes`.
    pub extracted_attributes: String,
    /// Checkpoint: messages created at or before this instant have been
    /// scanned. `None` means extraction has never completed with changes.
    pub last_extraction_date: Option<NaiveDateTime>,
    /// Row creation timestamp.
    pub created_at: NaiveDateTime,
    /// Last mutation timestamp.
    pub updated_at: NaiveDateTime,
}

impl User {
    /// Decode `required_attributes` into an ordered name list.
    pub fn required_attribute_names(&self) -> Vec<String> {
        serde_json::from_str(&self.required_attributes).unwrap_or_default()
    }

    /// Decode `extracted_attributes` into a typed map.
    pub fn attribute_map(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.extracted_attributes).unwrap_or_default()
    }
}

/// A chat thread owned by exactly one [`User`].
///
/// ### Table
/// - `conversations`
#[derive(Queryable, Associations, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(User))]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    /// Auto-increment primary key (set by the DB on insert).
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// Foreign key to the owning [`User`].
    pub user_id: String,
    /// Optional human-readable title.
    pub title: Option<String>,
    /// Optional rolling summary of earlier turns.
    pub summary: Option<String>,
    /// Row creation timestamp.
    pub created_at: NaiveDateTime,
    /// Bumped on every new message.
    pub updated_at: NaiveDateTime,
}

impl Conversation {
    /// Convenience accessor for the assigned primary key.
    ///
    /// Returns `Some(id)` once the row has been inserted.
    #[inline]
    pub fn id(&self) -> Option<i32> {
        self.id
    }
}

/// One turn in a conversation.
///
/// ### Table
/// - `messages`
///
/// ### Ordering
/// `(created_at, id)` is the canonical order: creation time first, the
/// auto-increment id breaks ties in insertion order.
#[derive(Queryable, Associations, Identifiable, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    /// Auto-increment primary key (set by the DB on insert).
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// Foreign key to the owning [`Conversation`].
    pub conversation_id: i32,
    /// Sender role: `"user"` or `"assistant"`.
    pub role: String,
    /// Raw message text.
    pub content: String,
    /// Creation timestamp (the ordering key).
    pub created_at: NaiveDateTime,
}

impl Message {
    /// Typed view of the `role` column.
    pub fn message_role(&self) -> Result<MessageRole> {
        MessageRole::parse(&self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_round_trips_exactly() {
        let vector = vec![0.1_f32, -2.5, 3.1415927, f32::MIN_POSITIVE, 1e30];
        let blob = DocumentChunk::encode_embedding(&vector).unwrap();
        let chunk = DocumentChunk {
            id: None,
            content: "x".into(),
            embedding: blob,
            metadata: "{}".into(),
            resource_id: "r".into(),
        };
        let decoded = chunk.embedding_vector().unwrap();
        assert_eq!(decoded.len(), vector.len());
        for (a, b) in decoded.iter().zip(vector.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn role_parsing_rejects_unknown_values() {
        assert_eq!(MessageRole::parse("user").unwrap(), MessageRole::User);
        assert_eq!(
            MessageRole::parse("assistant").unwrap(),
            MessageRole::Assistant
        );
        assert!(MessageRole::parse("system").is_err());
    }

    #[test]
    fn attribute_accessors_decode_json_columns() {
        let user = User {
            id: "u1".into(),
            required_attributes: r#"["name","city"]"#.into(),
            extracted_attributes: r#"{"name":"Alice"}"#.into(),
            last_extraction_date: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };
        assert_eq!(user.required_attribute_names(), vec!["name", "city"]);
        assert_eq!(user.attribute_map().get("name").unwrap(), "Alice");
    }
}
