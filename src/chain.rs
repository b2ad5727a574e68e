//! # Retrieval-generation chain
//!
//! Per-invocation state machine, never persisted:
//!
//! ```text
//! START → (REWRITE) → RETRIEVE → GENERATE → DONE
//! ```
//!
//! - **REWRITE** runs only when the conversation has prior turns: one
//!   generation call turns the raw utterance into a standalone search query
//!   (resolving pronouns and ellipsis against the history). With no history
//!   the raw utterance is used verbatim.
//! - **RETRIEVE** embeds the search query and takes the top-k chunks; their
//!   texts concatenate, in rank order, into the context.
//! - **GENERATE** sends the fixed system instruction, the (token-budgeted)
//!   prior turns, and one user turn holding context plus the original
//!   question.
//!
//! Gateway failures surface as `ExternalService`, store failures as
//! `Persistence`; the chain retries nothing, retry policy belongs to the
//! transport layer.

use diesel::SqliteConnection;
use std::sync::Arc;
use tiktoken_rs::cl100k_base;
use tracing::debug;

use crate::error::Result;
use crate::gateway::{EmbeddingGateway, GenerationGateway, assistant_message, system_message, user_message};
use crate::models::MessageRole;
use crate::prompts;
use crate::session::Turn;
use crate::vector_store::ChunkStore;

/// The outcome of one chain invocation.
#[derive(Debug, Clone)]
pub struct ChainRun {
    /// The generated answer.
    pub answer: String,
    /// The query actually used for retrieval (rewritten or verbatim).
    pub search_query: String,
    /// Concatenated chunk texts handed to the model as context.
    pub context: String,
}

/// Composes session history, the chunk store, and the gateways into answers.
pub struct RetrievalGenerationChain {
    embedding: Arc<EmbeddingGateway>,
    generation: Arc<GenerationGateway>,
    chunk_store: Arc<ChunkStore>,
    retrieval_k: usize,
    history_max_tokens: usize,
}

impl RetrievalGenerationChain {
    /// Assemble a chain from its collaborators.
    pub fn new(
        embedding: Arc<EmbeddingGateway>,
        generation: Arc<GenerationGateway>,
        chunk_store: Arc<ChunkStore>,
        retrieval_k: usize,
        history_max_tokens: usize,
    ) -> Self {
        Self {
            embedding,
            generation,
            chunk_store,
            retrieval_k,
            history_max_tokens,
        }
    }

    /// Answer `query` against the chunk store, conditioned on `history`.
    ///
    /// Pass an empty `history` for the stateless single-shot mode: REWRITE and
    /// history injection are skipped entirely.
    ///
    /// # Parameters
    /// - `conn`: Connection used for the chunk lookup.
    /// - `query`: The user's raw utterance.
    /// - `history`: Prior turns of the conversation, oldest first.
    /// - `k`: Retrieval depth override; `None` uses the configured default.
    pub async fn run(
        &self,
        conn: &mut SqliteConnection,
        query: &str,
        history: &[Turn],
        k: Option<usize>,
    ) -> Result<ChainRun> {
        // REWRITE
        let search_query = if history.is_empty() {
            query.to_string()
        } else {
            self.rewrite(query, history).await?
        };

        // RETRIEVE
        let query_vector = self.embedding.embed_one(&search_query).await?;
        let hits = self
            .chunk_store
            .search(conn, &query_vector, k.unwrap_or(self.retrieval_k))?;
        debug!("retrieved {} chunks for query", hits.len());
        let context = hits
            .iter()
            .map(|hit| hit.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // GENERATE
        let mut messages = vec![system_message(prompts::ANSWER_SYSTEM_PROMPT)];
        for turn in self.budgeted_history(history) {
            messages.push(match turn.role {
                MessageRole::User => user_message(turn.content.clone()),
                MessageRole::Assistant => assistant_message(turn.content.clone()),
            });
        }
        messages.push(user_message(prompts::context_question_block(&context, query)));

        let answer = self.generation.generate(messages).await?;
        Ok(ChainRun {
            answer,
            search_query,
            context,
        })
    }

    /// One generation call that reformulates `query` into a standalone search
    /// query. Falls back to the raw utterance when the model returns nothing.
    async fn rewrite(&self, query: &str, history: &[Turn]) -> Result<String> {
        let rendered = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![
            system_message(prompts::REWRITE_SYSTEM_PROMPT),
            user_message(prompts::rewrite_request(&rendered, query)),
        ];
        let rewritten = self.generation.generate(messages).await?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Ok(query.to_string());
        }
        debug!("rewrote query to: {rewritten}");
        Ok(rewritten.to_string())
    }

    /// The suffix of `history` that fits the token budget, counted with the
    /// cl100k tokenizer. Oldest turns are dropped first.
    fn budgeted_history<'a>(&self, history: &'a [Turn]) -> &'a [Turn] {
        if history.is_empty() {
            return history;
        }
        let bpe = cl100k_base().unwrap();
        let mut total = 0usize;
        let mut start = history.len();
        for (i, turn) in history.iter().enumerate().rev() {
            total += bpe.encode_with_special_tokens(&turn.content).len();
            if total > self.history_max_tokens {
                break;
            }
            start = i;
        }
        &history[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceMetric, RagweedConfig, establish_connection, initialize_database};
    use crate::models::DocumentChunk;
    use crate::store::create_resource;
    use httpmock::prelude::*;
    use serde_json::json;

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

    fn chain_under_test(base: &str, history_max_tokens: usize) -> (RetrievalGenerationChain, Arc<ChunkStore>) {
        let config = test_config(base);
        let chunk_store = Arc::new(ChunkStore::new(3, DistanceMetric::L2));
        let chain = RetrievalGenerationChain::new(
            Arc::new(EmbeddingGateway::new(&config)),
            Arc::new(GenerationGateway::new(&config)),
            Arc::clone(&chunk_store),
            config.retrieval_k,
            history_max_tokens,
        );
        (chain, chunk_store)
    }

    fn test_conn() -> (tempfile::TempDir, SqliteConnection) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chain.db");
        let mut conn = establish_connection(db.to_str().unwrap()).unwrap();
        initialize_database(&mut conn).unwrap();
        (dir, conn)
    }

    fn seed_chunk(conn: &mut SqliteConnection, store: &ChunkStore, content: &str, vector: Vec<f32>) {
        create_resource(conn, "r1", "text/plain", 1).unwrap();
        store
            .store(
                conn,
                vec![DocumentChunk {
                    id: None,
                    content: content.into(),
                    embedding: DocumentChunk::encode_embedding(&vector).unwrap(),
                    metadata: "{}".into(),
                    resource_id: "r1".into(),
                }],
            )
            .unwrap();
    }

    async fn mock_embeddings(server: &MockServer) -> httpmock::Mock<'_> {
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
            .await
    }

    async fn mock_completions<'a>(server: &'a MockServer, reply: &str) -> httpmock::Mock<'a> {
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
    async fn stateless_run_skips_the_rewrite_call() {
        let server = MockServer::start_async().await;
        let embeddings = mock_embeddings(&server).await;
        let completions = mock_completions(&server, "blue").await;

        let (chain, store) = chain_under_test(&server.url("/v1"), 2048);
        let (_dir, mut conn) = test_conn();
        seed_chunk(&mut conn, &store, "the sky is blue", vec![1.0, 0.0, 0.0]);

        let run = chain
            .run(&mut conn, "what color is the sky", &[], None)
            .await
            .unwrap();

        assert_eq!(run.answer, "blue");
        assert_eq!(run.search_query, "what color is the sky");
        assert!(run.context.contains("the sky is blue"));
        assert_eq!(embeddings.hits_async().await, 1);
        // Exactly one generation call: no history, no rewrite.
        assert_eq!(completions.hits_async().await, 1);
    }

    #[tokio::test]
    async fn history_triggers_one_rewrite_call() {
        let server = MockServer::start_async().await;
        let _embeddings = mock_embeddings(&server).await;
        let completions = mock_completions(&server, "Paris facts").await;

        let (chain, store) = chain_under_test(&server.url("/v1"), 2048);
        let (_dir, mut conn) = test_conn();
        seed_chunk(&mut conn, &store, "Paris is the capital", vec![1.0, 0.0, 0.0]);

        let history = vec![
            Turn::new(MessageRole::User, "tell me about Paris".into()),
            Turn::new(MessageRole::Assistant, "Paris is the capital of France".into()),
        ];
        let run = chain
            .run(&mut conn, "what about its population?", &history, None)
            .await
            .unwrap();

        // Rewrite + generate.
        assert_eq!(completions.hits_async().await, 2);
        assert_eq!(run.search_query, "Paris facts");
        assert_eq!(run.answer, "Paris facts");
    }

    #[tokio::test]
    async fn history_is_token_budgeted_oldest_first() {
        let server = MockServer::start_async().await;
        let (chain, _) = chain_under_test(&server.url("/v1"), 8);

        let history = vec![
            Turn::new(MessageRole::User, "one two three four five six seven".into()),
            Turn::new(MessageRole::Assistant, "short".into()),
            Turn::new(MessageRole::User, "tail".into()),
        ];
        let kept = chain.budgeted_history(&history);
        assert!(kept.len() < history.len());
        assert_eq!(kept.last().unwrap().content, "tail");
        assert_eq!(kept.first().unwrap().content, "short");
    }
}
