//! # Store module
//!
//! Transactional query helpers over the SQLite schema: resources, document
//! chunks, users, conversations, and messages.
//!
//! Everything here is synchronous Diesel against a caller-provided
//! `SqliteConnection`; higher layers decide where connections come from and
//! how calls are serialized. Message reads always order by
//! `(created_at, id)` so creation time is the ordering key and the
//! auto-increment id breaks ties in insertion order.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use std::collections::BTreeMap;

use crate::error::{RagweedError, Result};
use crate::models::{Conversation, DocumentChunk, Message, MessageRole, Resource, User};
use crate::schema::{conversations, document_chunks, messages, resources, users};

// --- Resources --------------------------------------------------------------

/// Insert a resource row. The id is caller-supplied.
pub fn create_resource(
    conn: &mut SqliteConnection,
    id: &str,
    mime_type: &str,
    file_size: i64,
) -> Result<Resource> {
    let resource = Resource {
        id: id.to_string(),
        mime_type: mime_type.to_string(),
        file_size,
        uploaded_at: Utc::now().naive_utc(),
    };
    conn.transaction(|conn| {
        diesel::insert_into(resources::table)
            .values(&resource)
            .execute(conn)
    })?;
    Ok(resource)
}

/// Fetch a resource by id.
pub fn get_resource(conn: &mut SqliteConnection, id: &str) -> Result<Resource> {
    resources::table
        .find(id)
        .first(conn)
        .optional()?
        .ok_or_else(|| RagweedError::not_found("resource", id))
}

/// All resources, newest upload first.
pub fn list_resources(conn: &mut SqliteConnection) -> Result<Vec<Resource>> {
    Ok(resources::table
        .order(resources::uploaded_at.desc())
        .load(conn)?)
}

/// Delete a resource and its chunks in one transaction.
///
/// The chunk delete is explicit even though the schema also cascades.
pub fn delete_resource(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let affected = conn.transaction(|conn| {
        diesel::delete(document_chunks::table.filter(document_chunks::resource_id.eq(id)))
            .execute(conn)?;
        diesel::delete(resources::table.find(id)).execute(conn)
    })?;
    if affected == 0 {
        return Err(RagweedError::not_found("resource", id));
    }
    Ok(())
}

// --- Document chunks --------------------------------------------------------

/// Persist a batch of chunks in a single transaction.
///
/// Either every chunk becomes visible or none does; a partial chunk set can
/// never be observed for a resource.
pub fn insert_chunks(
    conn: &mut SqliteConnection,
    chunks: &[DocumentChunk],
) -> Result<Vec<DocumentChunk>> {
    let inserted = conn.transaction(|conn| {
        let mut inserted = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let row: DocumentChunk = diesel::insert_into(document_chunks::table)
                .values(chunk)
                .returning(DocumentChunk::as_returning())
                .get_result(conn)?;
            inserted.push(row);
        }
        Ok::<_, diesel::result::Error>(inserted)
    })?;
    Ok(inserted)
}

/// All chunks belonging to one resource.
pub fn chunks_by_resource(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Vec<DocumentChunk>> {
    Ok(document_chunks::table
        .filter(document_chunks::resource_id.eq(resource_id))
        .order(document_chunks::id.asc())
        .load(conn)?)
}

/// Number of chunks stored for one resource.
pub fn count_chunks_for_resource(conn: &mut SqliteConnection, resource_id: &str) -> Result<i64> {
    Ok(document_chunks::table
        .filter(document_chunks::resource_id.eq(resource_id))
        .count()
        .get_result(conn)?)
}

/// Delete every chunk of a resource. Returns the number removed.
pub fn delete_chunks_by_resource(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<usize> {
    Ok(conn.transaction(|conn| {
        diesel::delete(
            document_chunks::table.filter(document_chunks::resource_id.eq(resource_id)),
        )
        .execute(conn)
    })?)
}

/// Every chunk in the store, in id order. Used to rebuild the vector index.
pub fn all_chunks(conn: &mut SqliteConnection) -> Result<Vec<DocumentChunk>> {
    Ok(document_chunks::table
        .order(document_chunks::id.asc())
        .load(conn)?)
}

/// Fetch chunks by id, returned in the order the ids were given.
pub fn chunks_by_ids(conn: &mut SqliteConnection, ids: &[i32]) -> Result<Vec<DocumentChunk>> {
    let rows: Vec<DocumentChunk> = document_chunks::table
        .filter(document_chunks::id.eq_any(ids))
        .load(conn)?;
    let mut by_id: BTreeMap<i32, DocumentChunk> = rows
        .into_iter()
        .filter_map(|c| c.id.map(|id| (id, c)))
        .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

// --- Users ------------------------------------------------------------------

/// Fetch a user, creating the row on first sight of the id.
pub fn find_or_create_user(conn: &mut SqliteConnection, user_id: &str) -> Result<User> {
    conn.transaction(|conn| {
        let existing: Option<User> = users::table.find(user_id).first(conn).optional()?;
        if let Some(user) = existing {
            return Ok(user);
        }
        let now = Utc::now().naive_utc();
        let user = User {
            id: user_id.to_string(),
            required_attributes: "[]".to_string(),
            extracted_attributes: "{}".to_string(),
            last_extraction_date: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(users::table).values(&user).execute(conn)?;
        Ok::<_, diesel::result::Error>(user)
    })
    .map_err(Into::into)
}

/// Fetch a user by id.
pub fn get_user(conn: &mut SqliteConnection, user_id: &str) -> Result<User> {
    users::table
        .find(user_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| RagweedError::not_found("user", user_id))
}

/// Replace the set of attribute names the system should learn for a user.
pub fn set_required_attributes(
    conn: &mut SqliteConnection,
    user_id: &str,
    names: &[String],
) -> Result<()> {
    let encoded = serde_json::to_string(names)
        .map_err(|e| RagweedError::Validation(format!("bad attribute names: {e}")))?;
    let affected = conn.transaction(|conn| {
        diesel::update(users::table.find(user_id))
            .set((
                users::required_attributes.eq(encoded),
                users::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
    })?;
    if affected == 0 {
        return Err(RagweedError::not_found("user", user_id));
    }
    Ok(())
}

/// Persist a merged attribute map.
///
/// Rejects any key that is not in the user's `required_attributes`; the merge
/// boundary upstream already filters, this keeps the invariant at the write.
pub fn update_extracted_attributes(
    conn: &mut SqliteConnection,
    user_id: &str,
    attributes: &BTreeMap<String, String>,
) -> Result<()> {
    conn.transaction(|conn| {
        let user: Option<User> = users::table.find(user_id).first(conn).optional()?;
        let Some(user) = user else {
            return Err(RagweedError::not_found("user", user_id));
        };
        let required = user.required_attribute_names();
        if let Some(stray) = attributes.keys().find(|k| !required.contains(k)) {
            return Err(RagweedError::Validation(format!(
                "attribute {stray} is not in required_attributes for user {user_id}"
            )));
        }
        let encoded = serde_json::to_string(attributes)
            .map_err(|e| RagweedError::Persistence(e.to_string()))?;
        diesel::update(users::table.find(user_id))
            .set((
                users::extracted_attributes.eq(encoded),
                users::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .map_err(RagweedError::from)?;
        Ok(())
    })
}

/// Advance the extraction checkpoint.
///
/// The update only applies when it moves the checkpoint forward, so overlapping
/// runs can never drag it backwards.
pub fn advance_extraction_checkpoint(
    conn: &mut SqliteConnection,
    user_id: &str,
    run_start: NaiveDateTime,
) -> Result<()> {
    conn.transaction(|conn| {
        diesel::update(
            users::table.find(user_id).filter(
                users::last_extraction_date
                    .is_null()
                    .or(users::last_extraction_date.le(run_start)),
            ),
        )
        .set((
            users::last_extraction_date.eq(run_start),
            users::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)
    })?;
    Ok(())
}

// --- Conversations ----------------------------------------------------------

/// Create a conversation for a user (the user row is created if unseen).
pub fn create_conversation(
    conn: &mut SqliteConnection,
    user_id: &str,
    title: Option<&str>,
) -> Result<Conversation> {
    find_or_create_user(conn, user_id)?;
    let now = Utc::now().naive_utc();
    let conversation = Conversation {
        id: None,
        user_id: user_id.to_string(),
        title: title.map(|t| t.to_string()),
        summary: None,
        created_at: now,
        updated_at: now,
    };
    let row = conn.transaction(|conn| {
        diesel::insert_into(conversations::table)
            .values(&conversation)
            .returning(Conversation::as_returning())
            .get_result(conn)
    })?;
    Ok(row)
}

/// Fetch a conversation by id.
pub fn get_conversation(conn: &mut SqliteConnection, id: i32) -> Result<Conversation> {
    conversations::table
        .find(id)
        .first(conn)
        .optional()?
        .ok_or_else(|| RagweedError::not_found("conversation", id.to_string()))
}

/// A user's conversations, most recently updated first.
pub fn list_conversations(conn: &mut SqliteConnection, user_id: &str) -> Result<Vec<Conversation>> {
    Ok(conversations::table
        .filter(conversations::user_id.eq(user_id))
        .order(conversations::updated_at.desc())
        .load(conn)?)
}

/// Number of conversations a user owns.
pub fn count_conversations_for_user(conn: &mut SqliteConnection, user_id: &str) -> Result<i64> {
    Ok(conversations::table
        .filter(conversations::user_id.eq(user_id))
        .count()
        .get_result(conn)?)
}

/// Replace a conversation's rolling summary.
pub fn update_conversation_summary(
    conn: &mut SqliteConnection,
    id: i32,
    summary: &str,
) -> Result<()> {
    let affected = conn.transaction(|conn| {
        diesel::update(conversations::table.find(id))
            .set((
                conversations::summary.eq(summary),
                conversations::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
    })?;
    if affected == 0 {
        return Err(RagweedError::not_found("conversation", id.to_string()));
    }
    Ok(())
}

/// Delete a conversation and its messages in one transaction.
pub fn delete_conversation(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let affected = conn.transaction(|conn| {
        diesel::delete(messages::table.filter(messages::conversation_id.eq(id))).execute(conn)?;
        diesel::delete(conversations::table.find(id)).execute(conn)
    })?;
    if affected == 0 {
        return Err(RagweedError::not_found("conversation", id.to_string()));
    }
    Ok(())
}

// --- Messages ---------------------------------------------------------------

/// Append a message to a conversation and bump the conversation's
/// `updated_at`, in one transaction.
pub fn insert_message(
    conn: &mut SqliteConnection,
    conversation_id: i32,
    role: MessageRole,
    content: &str,
) -> Result<Message> {
    let now = Utc::now().naive_utc();
    let message = Message {
        id: None,
        conversation_id,
        role: role.as_str().to_string(),
        content: content.to_string(),
        created_at: now,
    };
    let row = conn.transaction(|conn| {
        let row: Message = diesel::insert_into(messages::table)
            .values(&message)
            .returning(Message::as_returning())
            .get_result(conn)?;
        diesel::update(conversations::table.find(conversation_id))
            .set(conversations::updated_at.eq(now))
            .execute(conn)?;
        Ok::<_, diesel::result::Error>(row)
    })?;
    Ok(row)
}

/// All messages of a conversation in `(created_at, id)` order.
pub fn conversation_messages(
    conn: &mut SqliteConnection,
    conversation_id: i32,
) -> Result<Vec<Message>> {
    Ok(messages::table
        .filter(messages::conversation_id.eq(conversation_id))
        .order((messages::created_at.asc(), messages::id.asc()))
        .load(conn)?)
}

/// Fetch a single message.
pub fn get_message(conn: &mut SqliteConnection, id: i32) -> Result<Message> {
    messages::table
        .find(id)
        .first(conn)
        .optional()?
        .ok_or_else(|| RagweedError::not_found("message", id.to_string()))
}

/// Delete a single message.
pub fn delete_message(conn: &mut SqliteConnection, id: i32) -> Result<()> {
    let affected =
        conn.transaction(|conn| diesel::delete(messages::table.find(id)).execute(conn))?;
    if affected == 0 {
        return Err(RagweedError::not_found("message", id.to_string()));
    }
    Ok(())
}

/// A user's `user`-role messages across all of their conversations, oldest
/// first. When `since` is given, only messages created strictly after it.
pub fn user_messages(
    conn: &mut SqliteConnection,
    user_id: &str,
    since: Option<NaiveDateTime>,
) -> Result<Vec<Message>> {
    let mut query = messages::table
        .inner_join(conversations::table)
        .filter(conversations::user_id.eq(user_id))
        .filter(messages::role.eq(MessageRole::User.as_str()))
        .select(Message::as_select())
        .into_boxed();
    if let Some(since) = since {
        query = query.filter(messages::created_at.gt(since));
    }
    Ok(query
        .order((messages::created_at.asc(), messages::id.asc()))
        .load(conn)?)
}
