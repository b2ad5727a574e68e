//! # Service facade
//!
//! [`RagweedService`] wires every component together and exposes the
//! operations the HTTP/CLI layer calls:
//!
//! - `ingest`: upload bytes into chunks for a resource
//! - `answer`: grounded answering, conversational or stateless
//! - `on_user_message_created`: fire-and-forget extraction trigger
//! - `get_user_attributes`: the learned attribute map
//! - plus conversation / message / resource management and an explicit
//!   `extraction_run` for maintenance callers
//!
//! ## Concurrency
//! Requests touching the *same* conversation are serialized through a
//! per-conversation async mutex covering the message writes, the chain run,
//! and the session-memory appends, so turns apply in arrival order and
//! nothing is lost. Requests for different conversations share no state and
//! run fully in parallel. The extraction queue runs detached; its failures
//! never reach a caller.

use diesel::SqliteConnection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::chain::RetrievalGenerationChain;
use crate::config::{RagweedConfig, establish_connection, initialize_database};
use crate::error::{RagweedError, Result};
use crate::extraction::{AttributeExtractionEngine, RunState};
use crate::gateway::{EmbeddingGateway, GenerationGateway, user_message};
use crate::ingest::{IngestionPipeline, TextSplitter};
use crate::models::{Conversation, Message, MessageRole, Resource};
use crate::parser::ParserRegistry;
use crate::prompts;
use crate::queue::ExtractionQueue;
use crate::session::SessionMemory;
use crate::store;
use crate::vector_store::ChunkStore;

/// The assembled service core.
pub struct RagweedService {
    config: RagweedConfig,
    registry: Arc<ParserRegistry>,
    generation: Arc<GenerationGateway>,
    chunk_store: Arc<ChunkStore>,
    pipeline: IngestionPipeline,
    chain: RetrievalGenerationChain,
    session_memory: SessionMemory,
    engine: Arc<AttributeExtractionEngine>,
    queue: ExtractionQueue,
    conversation_locks: AsyncMutex<HashMap<i32, Arc<AsyncMutex<()>>>>,
}

impl RagweedService {
    /// Build the service: open the database, create the schema if missing,
    /// rebuild the vector index from stored chunks, and start the background
    /// extraction worker.
    ///
    /// Must be called from within a tokio runtime (the worker is spawned on
    /// it).
    pub fn new(config: RagweedConfig) -> Result<Self> {
        config.validate()?;

        let mut conn = establish_connection(&config.database_url)?;
        initialize_database(&mut conn)?;

        let registry = Arc::new(ParserRegistry::with_default_parsers());
        let embedding = Arc::new(EmbeddingGateway::new(&config));
        let generation = Arc::new(GenerationGateway::new(&config));
        let chunk_store = Arc::new(ChunkStore::new(
            config.embedding_dimensions,
            config.distance_metric,
        ));
        chunk_store.rebuild_from_store(&mut conn)?;

        let pipeline = IngestionPipeline::new(
            Arc::clone(&registry),
            TextSplitter::new(config.chunk_size, config.chunk_overlap)?,
            Arc::clone(&embedding),
            Arc::clone(&chunk_store),
        );
        let chain = RetrievalGenerationChain::new(
            Arc::clone(&embedding),
            Arc::clone(&generation),
            Arc::clone(&chunk_store),
            config.retrieval_k,
            config.history_max_tokens,
        );
        let session_memory = SessionMemory::new(config.session_cache_capacity);
        let engine = Arc::new(AttributeExtractionEngine::new(Arc::clone(&generation)));
        let queue = ExtractionQueue::spawn(
            Arc::clone(&engine),
            config.database_url.clone(),
            config.extraction_queue_depth,
            config.extraction_max_attempts,
            config.extraction_backoff_ms,
        );

        Ok(Self {
            config,
            registry,
            generation,
            chunk_store,
            pipeline,
            chain,
            session_memory,
            engine,
            queue,
            conversation_locks: AsyncMutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> Result<SqliteConnection> {
        establish_connection(&self.config.database_url)
    }

    async fn conversation_lock(&self, conversation_id: i32) -> Arc<AsyncMutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        Arc::clone(
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    // --- Ingestion ----------------------------------------------------------

    /// Ingest an uploaded buffer under a caller-chosen resource id.
    ///
    /// The resource row is created first; on any pipeline failure it stays in
    /// place **with zero chunks** (the consistent, documented failure shape;
    /// callers may delete it). Mime and size validation belong to the calling
    /// layer; this method still refuses mime types no parser handles, before
    /// any row is written.
    ///
    /// # Returns
    /// The number of chunks persisted.
    pub async fn ingest(
        &self,
        resource_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<usize> {
        if self.registry.resolve(mime_type).is_none() {
            return Err(RagweedError::Validation(format!(
                "unsupported file type: {mime_type}"
            )));
        }

        let mut conn = self.conn()?;
        if store::get_resource(&mut conn, resource_id).is_ok() {
            return Err(RagweedError::Validation(format!(
                "resource {resource_id} already exists"
            )));
        }
        store::create_resource(&mut conn, resource_id, mime_type, bytes.len() as i64)?;

        self.pipeline
            .run(&mut conn, resource_id, bytes, mime_type)
            .await
    }

    /// All resources, newest first.
    pub fn list_resources(&self) -> Result<Vec<Resource>> {
        let mut conn = self.conn()?;
        store::list_resources(&mut conn)
    }

    /// Delete a resource and all of its chunks (table and index).
    pub fn delete_resource(&self, resource_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        store::get_resource(&mut conn, resource_id)?;
        self.chunk_store.delete_by_resource(&mut conn, resource_id)?;
        store::delete_resource(&mut conn, resource_id)?;
        info!("deleted resource {resource_id}");
        Ok(())
    }

    // --- Answering ----------------------------------------------------------

    /// Answer a query, optionally inside a conversation.
    ///
    /// With a conversation id the full chain runs: history-aware query
    /// rewriting, retrieval, generation, then the user and assistant turns are
    /// persisted and appended to session memory (in that order) and the
    /// extraction trigger fires. Without one, this is the stateless
    /// single-shot mode: no rewrite, no history, nothing persisted.
    ///
    /// A failed call returns the error and appends nothing, never a partial
    /// answer.
    pub async fn answer(
        &self,
        query: &str,
        conversation_id: Option<i32>,
        user_id: Option<&str>,
    ) -> Result<String> {
        let Some(conversation_id) = conversation_id else {
            let mut conn = self.conn()?;
            let run = self.chain.run(&mut conn, query, &[], None).await?;
            return Ok(run.answer);
        };

        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conn = self.conn()?;
        let conversation = store::get_conversation(&mut conn, conversation_id)?;
        if let Some(user_id) = user_id {
            if conversation.user_id != user_id {
                return Err(RagweedError::Validation(format!(
                    "conversation {conversation_id} does not belong to user {user_id}"
                )));
            }
        }

        let history = self.session_memory.turns(&mut conn, conversation_id)?;
        let user_turn = store::insert_message(&mut conn, conversation_id, MessageRole::User, query)?;

        let run = match self.chain.run(&mut conn, query, &history, None).await {
            Ok(run) => run,
            Err(e) => {
                // The user turn is already persisted; drop the now-stale cache
                // entry so the next access rehydrates from the store.
                self.session_memory.evict(conversation_id);
                return Err(e);
            }
        };

        store::insert_message(&mut conn, conversation_id, MessageRole::Assistant, &run.answer)?;
        self.session_memory
            .append(conversation_id, MessageRole::User, query);
        self.session_memory
            .append(conversation_id, MessageRole::Assistant, &run.answer);

        if let Some(message_id) = user_turn.id {
            self.queue.dispatch(&conversation.user_id, message_id);
        }
        Ok(run.answer)
    }

    // --- Conversations ------------------------------------------------------

    /// Create a conversation; on a user's **first** conversation, generate a
    /// welcome message. Welcome generation failures are logged and the
    /// conversation is returned without one.
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<(Conversation, Option<Message>)> {
        let mut conn = self.conn()?;
        let is_first = store::count_conversations_for_user(&mut conn, user_id)? == 0;
        let conversation = store::create_conversation(&mut conn, user_id, title)?;
        let conversation_id = conversation.id.ok_or_else(|| {
            RagweedError::Persistence("created conversation without a row id".into())
        })?;
        info!("created conversation {conversation_id} for user {user_id}");

        let mut welcome = None;
        if is_first {
            match self
                .generation
                .generate(vec![user_message(prompts::welcome_request(user_id))])
                .await
            {
                Ok(text) => {
                    let message = store::insert_message(
                        &mut conn,
                        conversation_id,
                        MessageRole::Assistant,
                        &text,
                    )?;
                    welcome = Some(message);
                }
                Err(e) => {
                    warn!("welcome message generation failed for user {user_id}: {e}");
                }
            }
        }
        Ok((conversation, welcome))
    }

    /// A conversation together with its messages in creation order.
    pub fn get_conversation(&self, id: i32) -> Result<(Conversation, Vec<Message>)> {
        let mut conn = self.conn()?;
        let conversation = store::get_conversation(&mut conn, id)?;
        let messages = store::conversation_messages(&mut conn, id)?;
        Ok((conversation, messages))
    }

    /// A user's conversations, most recently updated first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let mut conn = self.conn()?;
        store::list_conversations(&mut conn, user_id)
    }

    /// Replace a conversation's rolling summary.
    pub fn update_summary(&self, id: i32, summary: &str) -> Result<()> {
        let mut conn = self.conn()?;
        store::update_conversation_summary(&mut conn, id, summary)
    }

    /// Delete a conversation, its messages, and its session-memory entry.
    pub async fn delete_conversation(&self, id: i32) -> Result<()> {
        let lock = self.conversation_lock(id).await;
        let _guard = lock.lock().await;
        let mut conn = self.conn()?;
        store::delete_conversation(&mut conn, id)?;
        self.session_memory.evict(id);
        Ok(())
    }

    // --- Messages -----------------------------------------------------------

    /// Append a message to a conversation.
    ///
    /// Creating a `user` turn fires the extraction trigger, detached from this
    /// call. Writes for the same conversation are serialized, so two
    /// near-simultaneous calls land in arrival order with nothing lost.
    pub async fn create_message(
        &self,
        conversation_id: i32,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let mut conn = self.conn()?;
        let conversation = store::get_conversation(&mut conn, conversation_id)?;
        let message = store::insert_message(&mut conn, conversation_id, role, content)?;
        self.session_memory.append(conversation_id, role, content);

        if role == MessageRole::User {
            if let Some(message_id) = message.id {
                self.queue.dispatch(&conversation.user_id, message_id);
            }
        }
        Ok(message)
    }

    /// Fetch one message.
    pub fn get_message(&self, id: i32) -> Result<Message> {
        let mut conn = self.conn()?;
        store::get_message(&mut conn, id)
    }

    /// Delete one message.
    pub fn delete_message(&self, id: i32) -> Result<()> {
        let mut conn = self.conn()?;
        let message = store::get_message(&mut conn, id)?;
        store::delete_message(&mut conn, id)?;
        self.session_memory.evict(message.conversation_id);
        Ok(())
    }

    // --- Users & extraction -------------------------------------------------

    /// Notify the core that a `user`-role message was created. Enqueues the
    /// extraction trigger and returns immediately; the caller never sees the
    /// run's outcome.
    pub fn on_user_message_created(&self, user_id: &str, message_id: i32) {
        self.queue.dispatch(user_id, message_id);
    }

    /// The attribute map learned for a user so far.
    pub fn get_user_attributes(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.conn()?;
        Ok(store::get_user(&mut conn, user_id)?.attribute_map())
    }

    /// Replace the attribute names the system should learn for a user,
    /// creating the user if unseen.
    pub fn set_required_attributes(&self, user_id: &str, names: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        store::find_or_create_user(&mut conn, user_id)?;
        store::set_required_attributes(&mut conn, user_id, names)
    }

    /// Run a full extraction pass for a user, synchronously. Maintenance
    /// entry point; the message-created path goes through the queue instead.
    pub async fn extraction_run(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.conn()?;
        Ok(self.engine.run_for_user(&mut conn, user_id).await?.attributes)
    }

    /// The engine's run state for a user.
    pub fn extraction_state(&self, user_id: &str) -> RunState {
        self.engine.run_state(user_id)
    }

    /// Stop the background worker after draining queued jobs.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistanceMetric;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_config(base: &str, database_url: &str) -> RagweedConfig {
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
            database_url: database_url.into(),
            max_file_size_bytes: 10 * 1024 * 1024,
            session_cache_capacity: 16,
            extraction_queue_depth: 8,
            extraction_max_attempts: 2,
            extraction_backoff_ms: 10,
        }
    }

    async fn mock_embeddings(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({
                    "object": "list",
                    "model": "embed",
                    "data": [{"object": "embedding", "index": 0, "embedding": [1.0, 0.0, 0.0]}],
                    "usage": {"prompt_tokens": 1, "total_tokens": 1}
                }));
            })
            .await;
    }

    async fn mock_completions(server: &MockServer, reply: &str) {
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
            .await;
    }

    fn service_under_test(server: &MockServer) -> (tempfile::TempDir, Arc<RagweedService>) {
        let dir = tempfile::tempdir().unwrap();
        let database_url = dir.path().join("service.db").to_str().unwrap().to_string();
        let config = test_config(&server.url("/v1"), &database_url);
        let service = Arc::new(RagweedService::new(config).unwrap());
        (dir, service)
    }

    #[tokio::test]
    async fn ingest_then_answer_end_to_end() {
        let server = MockServer::start_async().await;
        mock_embeddings(&server).await;
        mock_completions(&server, "The sky is blue.").await;

        let (_dir, service) = service_under_test(&server);

        let count = service
            .ingest("r1", b"the sky is blue", "text/plain")
            .await
            .unwrap();
        assert_eq!(count, 1);

        let answer = service
            .answer("what color is the sky", None, None)
            .await
            .unwrap();
        assert_eq!(answer, "The sky is blue.");
    }

    #[tokio::test]
    async fn ingest_rejects_unsupported_mime_before_creating_anything() {
        let server = MockServer::start_async().await;
        let (_dir, service) = service_under_test(&server);

        let result = service.ingest("r1", b"\x89PNG", "image/png").await;
        assert!(matches!(result, Err(RagweedError::Validation(_))));
        assert!(service.list_resources().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversational_answer_persists_both_turns_in_order() {
        let server = MockServer::start_async().await;
        mock_embeddings(&server).await;
        mock_completions(&server, "hello there").await;

        let (_dir, service) = service_under_test(&server);
        let (conversation, _) = service.create_conversation("u1", None).await.unwrap();
        let conversation_id = conversation.id.unwrap();

        let answer = service
            .answer("hi", Some(conversation_id), Some("u1"))
            .await
            .unwrap();
        assert_eq!(answer, "hello there");

        let (_, messages) = service.get_conversation(conversation_id).unwrap();
        // Welcome (first conversation) + user turn + assistant turn.
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["assistant", "user", "assistant"]);
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].content, "hello there");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn only_the_first_conversation_gets_a_welcome() {
        let server = MockServer::start_async().await;
        mock_completions(&server, "welcome!").await;

        let (_dir, service) = service_under_test(&server);
        let (_, first_welcome) = service.create_conversation("u1", None).await.unwrap();
        let (_, second_welcome) = service.create_conversation("u1", None).await.unwrap();

        assert!(first_welcome.is_some());
        assert!(second_welcome.is_none());
    }

    #[tokio::test]
    async fn concurrent_message_creation_loses_nothing() {
        let server = MockServer::start_async().await;
        mock_completions(&server, "{}").await;

        let (_dir, service) = service_under_test(&server);
        let (conversation, _) = service.create_conversation("u1", None).await.unwrap();
        let conversation_id = conversation.id.unwrap();

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .create_message(conversation_id, MessageRole::User, "first")
                    .await
            })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .create_message(conversation_id, MessageRole::User, "second")
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let (_, messages) = service.get_conversation(conversation_id).unwrap();
        let contents: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents.len(), 2, "no lost update");
        // Arrival order: ids strictly increase with position.
        let ids: Vec<i32> = messages.iter().map(|m| m.id.unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn deleting_a_resource_removes_it_from_retrieval() {
        let server = MockServer::start_async().await;
        mock_embeddings(&server).await;

        let (_dir, service) = service_under_test(&server);
        service
            .ingest("r1", b"the sky is blue", "text/plain")
            .await
            .unwrap();

        service.delete_resource("r1").unwrap();
        assert!(service.list_resources().unwrap().is_empty());
        assert!(matches!(
            service.delete_resource("r1"),
            Err(RagweedError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn user_attributes_flow_through_the_service() {
        let server = MockServer::start_async().await;
        mock_completions(&server, r#"{"name": "Alice"}"#).await;

        let (_dir, service) = service_under_test(&server);
        let (conversation, _) = service.create_conversation("u1", None).await.unwrap();
        service
            .set_required_attributes("u1", &["name".to_string()])
            .unwrap();
        service
            .create_message(conversation.id.unwrap(), MessageRole::User, "my name is Alice")
            .await
            .unwrap();

        // Drain the background queue, then observe the merged map.
        service.shutdown().await;
        let attributes = service.get_user_attributes("u1").unwrap();
        assert_eq!(attributes.get("name").unwrap(), "Alice");
    }
}
