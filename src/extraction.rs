//! # Attribute extraction engine
//!
//! Incrementally infers structured personal attributes about a user from
//! their `user`-role messages. Each run:
//!
//! 1. loads the user; an empty `required_attributes` set is a no-op,
//! 2. records the run start time,
//! 3. selects candidate messages: everything when the checkpoint
//!    (`last_extraction_date`) is null, otherwise only messages created
//!    strictly after it, oldest first,
//! 4. asks the generation model for a minimal JSON object restricted to the
//!    required attribute names,
//! 5. parses permissively (first `{...}` substring; a parse failure means
//!    "nothing found", not an error), filters keys to the required set, and
//!    coerces values to plain text,
//! 6. merges by pure per-key overwrite (absent keys keep their prior value),
//! 7. persists the merged map and, only when the merge changed something,
//!    advances the checkpoint to the run **start** time, so messages created
//!    during the run are never skipped by the next one. The same message may
//!    be scanned twice by overlapping runs; the overwrite-by-key merge makes
//!    that harmless.
//!
//! A scoped single-message fast path exists for the "message just created"
//! trigger. It only runs when the checkpoint is already set; a null checkpoint
//! falls back to the full scan, so the fast path can never mark unscanned
//! history as processed.
//!
//! The engine has no caller waiting on it: the queue that drives it logs and
//! swallows every failure.

use chrono::Utc;
use diesel::SqliteConnection;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{RagweedError, Result};
use crate::gateway::{GenerationGateway, user_message};
use crate::models::MessageRole;
use crate::prompts;
use crate::store;

/// First JSON-object substring of a model reply, as the original permissive
/// parser matched it. Values are flat strings, so non-nested matching is
/// sufficient.
static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^}]*\}").unwrap());

/// Engine-side view of a user's extraction activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run has been started for this user in this process.
    NeverRun,
    /// A run is currently executing.
    Running,
    /// At least one run finished (successfully or not).
    Idle,
}

/// What one extraction run did.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    /// The user's attribute map after the run.
    pub attributes: BTreeMap<String, String>,
    /// Whether the merge changed at least one key (and hence the checkpoint
    /// advanced).
    pub changed: bool,
    /// Number of candidate messages scanned.
    pub scanned_messages: usize,
}

/// Checkpointed, idempotent attribute extraction.
pub struct AttributeExtractionEngine {
    generation: Arc<GenerationGateway>,
    states: Mutex<HashMap<String, RunState>>,
}

impl AttributeExtractionEngine {
    /// Create an engine over a generation gateway.
    pub fn new(generation: Arc<GenerationGateway>) -> Self {
        Self {
            generation,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The engine's current state for a user.
    pub fn run_state(&self, user_id: &str) -> RunState {
        self.states
            .lock()
            .expect("extraction state lock poisoned")
            .get(user_id)
            .copied()
            .unwrap_or(RunState::NeverRun)
    }

    fn set_state(&self, user_id: &str, state: RunState) {
        self.states
            .lock()
            .expect("extraction state lock poisoned")
            .insert(user_id.to_string(), state);
    }

    /// Full (or incremental, once checkpointed) extraction run for a user.
    pub async fn run_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> Result<ExtractionOutcome> {
        self.set_state(user_id, RunState::Running);
        let result = self.scan_history(conn, user_id).await;
        self.set_state(user_id, RunState::Idle);
        result
    }

    /// Scoped fast path for one just-created message.
    ///
    /// Falls back to the full scan when the user has never been checkpointed.
    pub async fn run_for_message(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        message_id: i32,
    ) -> Result<ExtractionOutcome> {
        self.set_state(user_id, RunState::Running);
        let result = self.scan_message(conn, user_id, message_id).await;
        self.set_state(user_id, RunState::Idle);
        result
    }

    async fn scan_history(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> Result<ExtractionOutcome> {
        let user = store::get_user(conn, user_id)?;
        let required = user.required_attribute_names();
        let existing = user.attribute_map();
        if required.is_empty() {
            debug!("user {user_id} has no required attributes, skipping extraction");
            return Ok(ExtractionOutcome {
                attributes: existing,
                changed: false,
                scanned_messages: 0,
            });
        }

        let run_start = Utc::now().naive_utc();
        let candidates = store::user_messages(conn, user_id, user.last_extraction_date)?;
        if candidates.is_empty() {
            debug!("no candidate messages for user {user_id}");
            return Ok(ExtractionOutcome {
                attributes: existing,
                changed: false,
                scanned_messages: 0,
            });
        }

        info!(
            "extracting attributes for user {user_id} from {} messages",
            candidates.len()
        );
        let text = candidates
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let response = self
            .generation
            .generate(vec![user_message(prompts::extraction_request(
                &required, &text,
            ))])
            .await?;

        let extracted = Self::parse_attributes(&response, &required);
        let (merged, changed) = Self::merge(&existing, &extracted);
        if changed {
            store::update_extracted_attributes(conn, user_id, &merged)?;
            store::advance_extraction_checkpoint(conn, user_id, run_start)?;
        }
        Ok(ExtractionOutcome {
            attributes: merged,
            changed,
            scanned_messages: candidates.len(),
        })
    }

    async fn scan_message(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        message_id: i32,
    ) -> Result<ExtractionOutcome> {
        let user = store::get_user(conn, user_id)?;
        let required = user.required_attribute_names();
        let existing = user.attribute_map();
        if required.is_empty() {
            return Ok(ExtractionOutcome {
                attributes: existing,
                changed: false,
                scanned_messages: 0,
            });
        }

        // First extraction must see the whole history.
        if user.last_extraction_date.is_none() {
            return self.scan_history(conn, user_id).await;
        }

        let run_start = Utc::now().naive_utc();
        let message = store::get_message(conn, message_id)?;
        if message.message_role()? != MessageRole::User {
            debug!("message {message_id} is not a user turn, skipping extraction");
            return Ok(ExtractionOutcome {
                attributes: existing,
                changed: false,
                scanned_messages: 0,
            });
        }
        let conversation = store::get_conversation(conn, message.conversation_id)?;
        if conversation.user_id != user_id {
            return Err(RagweedError::Validation(format!(
                "message {message_id} does not belong to user {user_id}"
            )));
        }

        let response = self
            .generation
            .generate(vec![user_message(prompts::extraction_request(
                &required,
                &message.content,
            ))])
            .await?;

        let extracted = Self::parse_attributes(&response, &required);
        let (merged, changed) = Self::merge(&existing, &extracted);
        if changed {
            store::update_extracted_attributes(conn, user_id, &merged)?;
            store::advance_extraction_checkpoint(conn, user_id, run_start)?;
        }
        Ok(ExtractionOutcome {
            attributes: merged,
            changed,
            scanned_messages: 1,
        })
    }

    /// Permissive parse of a model reply.
    ///
    /// Takes the first `{...}` substring, parses it as JSON, keeps only keys
    /// in `required`, and coerces scalar values to strings. Anything
    /// unparseable means "no attributes found".
    fn parse_attributes(response: &str, required: &[String]) -> BTreeMap<String, String> {
        let Some(object) = JSON_OBJECT.find(response) else {
            warn!("no JSON object in extraction response");
            return BTreeMap::new();
        };
        let parsed: serde_json::Value = match serde_json::from_str(object.as_str()) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to parse extraction response: {e}");
                return BTreeMap::new();
            }
        };
        let Some(map) = parsed.as_object() else {
            return BTreeMap::new();
        };

        let mut attributes = BTreeMap::new();
        for (key, value) in map {
            if !required.contains(key) {
                continue;
            }
            let coerced = match value {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                _ => None,
            };
            if let Some(coerced) = coerced {
                attributes.insert(key.clone(), coerced);
            }
        }
        attributes
    }

    /// Pure per-key overwrite merge: new values win, absent keys keep their
    /// prior value. Idempotent under reprocessing.
    fn merge(
        existing: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> (BTreeMap<String, String>, bool) {
        let mut merged = existing.clone();
        let mut changed = false;
        for (key, value) in new {
            if merged.get(key) != Some(value) {
                changed = true;
            }
            merged.insert(key.clone(), value.clone());
        }
        (merged, changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceMetric, RagweedConfig, establish_connection, initialize_database};
    use crate::store::{
        create_conversation, get_user, insert_message, set_required_attributes,
    };
    use httpmock::prelude::*;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_overwrites_per_key_and_keeps_the_rest() {
        let existing = map(&[("name", "Alice")]);
        let new = map(&[("name", "Bob"), ("city", "Paris")]);
        let (merged, changed) = AttributeExtractionEngine::merge(&existing, &new);
        assert!(changed);
        assert_eq!(merged, map(&[("name", "Bob"), ("city", "Paris")]));
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = map(&[("name", "Bob"), ("city", "Paris")]);
        let new = map(&[("name", "Bob"), ("city", "Paris")]);
        let (merged, changed) = AttributeExtractionEngine::merge(&existing, &new);
        assert!(!changed);
        assert_eq!(merged, existing);
    }

    #[test]
    fn parse_extracts_the_first_json_object() {
        let required = vec!["name".to_string(), "city".to_string()];
        let response = "Sure! Here you go:\n{\"name\": \"Alice\", \"age\": 30}\ntrailing";
        let parsed = AttributeExtractionEngine::parse_attributes(response, &required);
        assert_eq!(parsed, map(&[("name", "Alice")]));
    }

    #[test]
    fn parse_failure_means_nothing_found() {
        let required = vec!["name".to_string()];
        assert!(AttributeExtractionEngine::parse_attributes("no json here", &required).is_empty());
        assert!(AttributeExtractionEngine::parse_attributes("{broken", &required).is_empty());
    }

    #[test]
    fn parse_coerces_scalars_and_drops_the_rest() {
        let required = vec!["age".to_string(), "vip".to_string(), "city".to_string()];
        let response = r#"{"age": 30, "vip": true, "city": null}"#;
        let parsed = AttributeExtractionEngine::parse_attributes(response, &required);
        assert_eq!(parsed, map(&[("age", "30"), ("vip", "true")]));
    }

    fn test_config(base: &str) -> RagweedConfig {
        RagweedConfig {
            api_key: "k".into(),
            api_base: base.into(),
            chat_model: "chat".into(),
            embedding_model: "embed".into(),
            embedding_dimensions: 3,
            distance_metric: DistanceMetric::L2,
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_k: 5,
            gateway_timeout_secs: 5,
            history_max_tokens: 2048,
            database_url: ":memory:".into(),
            max_file_size_bytes: 10 * 1024 * 1024,
            session_cache_capacity: 16,
            extraction_queue_depth: 8,
            extraction_max_attempts: 2,
            extraction_backoff_ms: 10,
        }
    }

    fn test_conn() -> (tempfile::TempDir, SqliteConnection) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("extraction.db");
        let mut conn = establish_connection(db.to_str().unwrap()).unwrap();
        initialize_database(&mut conn).unwrap();
        (dir, conn)
    }

    fn engine_under_test(base: &str) -> AttributeExtractionEngine {
        let config = test_config(base);
        AttributeExtractionEngine::new(Arc::new(GenerationGateway::new(&config)))
    }

    async fn mock_extraction<'a>(server: &'a MockServer, reply: &str) -> httpmock::Mock<'a> {
        let body = json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "chat",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": reply},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(body.clone());
            })
            .await
    }

    #[tokio::test]
    async fn extraction_learns_a_name_end_to_end() {
        let server = MockServer::start_async().await;
        let _mock = mock_extraction(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, mut conn) = test_conn();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        set_required_attributes(&mut conn, "u1", &["name".to_string()]).unwrap();
        insert_message(
            &mut conn,
            conversation.id.unwrap(),
            MessageRole::User,
            "my name is Alice",
        )
        .unwrap();

        let engine = engine_under_test(&server.url("/v1"));
        assert_eq!(engine.run_state("u1"), RunState::NeverRun);

        let outcome = engine.run_for_user(&mut conn, "u1").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.attributes, map(&[("name", "Alice")]));
        assert_eq!(engine.run_state("u1"), RunState::Idle);

        let user = get_user(&mut conn, "u1").unwrap();
        assert_eq!(user.attribute_map(), map(&[("name", "Alice")]));
        assert!(user.last_extraction_date.is_some());
    }

    #[tokio::test]
    async fn second_run_with_no_new_messages_changes_nothing() {
        let server = MockServer::start_async().await;
        let mock = mock_extraction(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, mut conn) = test_conn();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        set_required_attributes(&mut conn, "u1", &["name".to_string()]).unwrap();
        insert_message(
            &mut conn,
            conversation.id.unwrap(),
            MessageRole::User,
            "my name is Alice",
        )
        .unwrap();

        let engine = engine_under_test(&server.url("/v1"));
        engine.run_for_user(&mut conn, "u1").await.unwrap();
        let after_first = get_user(&mut conn, "u1").unwrap();

        let outcome = engine.run_for_user(&mut conn, "u1").await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.scanned_messages, 0);

        let after_second = get_user(&mut conn, "u1").unwrap();
        assert_eq!(after_second.attribute_map(), after_first.attribute_map());
        assert_eq!(
            after_second.last_extraction_date,
            after_first.last_extraction_date
        );
        // Only the first run called the model.
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn message_created_after_run_start_is_seen_by_the_next_run() {
        let server = MockServer::start_async().await;
        let mut first_mock = mock_extraction(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, mut conn) = test_conn();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        let conversation_id = conversation.id.unwrap();
        set_required_attributes(&mut conn, "u1", &["name".to_string(), "city".to_string()])
            .unwrap();
        insert_message(&mut conn, conversation_id, MessageRole::User, "my name is Alice").unwrap();

        let engine = engine_under_test(&server.url("/v1"));
        engine.run_for_user(&mut conn, "u1").await.unwrap();

        // A message lands strictly after the first run's start time.
        std::thread::sleep(std::time::Duration::from_millis(5));
        insert_message(&mut conn, conversation_id, MessageRole::User, "I live in Paris").unwrap();

        first_mock.delete_async().await;
        let _second_mock = mock_extraction(&server, r#"{"city": "Paris"}"#).await;

        let outcome = engine.run_for_user(&mut conn, "u1").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.scanned_messages, 1, "only the new message is scanned");
        assert_eq!(
            outcome.attributes,
            map(&[("name", "Alice"), ("city", "Paris")])
        );
    }

    #[tokio::test]
    async fn fast_path_falls_back_to_full_scan_before_first_checkpoint() {
        let server = MockServer::start_async().await;
        let _mock = mock_extraction(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, mut conn) = test_conn();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        let conversation_id = conversation.id.unwrap();
        set_required_attributes(&mut conn, "u1", &["name".to_string()]).unwrap();
        insert_message(&mut conn, conversation_id, MessageRole::User, "older context").unwrap();
        let trigger =
            insert_message(&mut conn, conversation_id, MessageRole::User, "my name is Alice")
                .unwrap();

        let engine = engine_under_test(&server.url("/v1"));
        let outcome = engine
            .run_for_message(&mut conn, "u1", trigger.id.unwrap())
            .await
            .unwrap();

        assert_eq!(
            outcome.scanned_messages, 2,
            "null checkpoint forces the full history scan"
        );
    }

    #[tokio::test]
    async fn users_without_required_attributes_are_a_no_op() {
        let server = MockServer::start_async().await;
        let mock = mock_extraction(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, mut conn) = test_conn();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        insert_message(
            &mut conn,
            conversation.id.unwrap(),
            MessageRole::User,
            "my name is Alice",
        )
        .unwrap();

        let engine = engine_under_test(&server.url("/v1"));
        let outcome = engine.run_for_user(&mut conn, "u1").await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(mock.hits_async().await, 0);
    }
}
