//! # Model gateways
//!
//! Thin wrappers around a remote OpenAI-compatible endpoint:
//!
//! - [`EmbeddingGateway`] wraps `POST /embeddings`, batched: a list of texts
//!   goes out, a list of fixed-dimension vectors comes back.
//! - [`GenerationGateway`] wraps `POST /chat/completions`: a message list goes
//!   out, the assistant's text comes back.
//!
//! Every call is bounded by `tokio::time::timeout`; an elapsed timeout, an
//! unreachable host, or malformed output all surface as
//! [`RagweedError::ExternalService`]. Neither gateway retries; retry policy
//! belongs to the caller.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::RagweedConfig;
use crate::error::{RagweedError, Result};

/// Build a system message for a chat request.
pub fn system_message(content: impl Into<String>) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
        content: ChatCompletionRequestSystemMessageContent::Text(content.into()),
        name: None,
    })
}

/// Build a user message for a chat request.
pub fn user_message(content: impl Into<String>) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
        content: ChatCompletionRequestUserMessageContent::Text(content.into()),
        name: None,
    })
}

/// Build an assistant message for a chat request.
#[allow(deprecated)]
pub fn assistant_message(content: impl Into<String>) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
        content: Some(ChatCompletionRequestAssistantMessageContent::Text(
            content.into(),
        )),
        name: None,
        refusal: None,
        audio: None,
        tool_calls: None,
        function_call: None,
    })
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Batched access to the remote embedding model.
pub struct EmbeddingGateway {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl EmbeddingGateway {
    /// Create a gateway from configuration.
    pub fn new(config: &RagweedConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            timeout: Duration::from_secs(config.gateway_timeout_secs),
        }
    }

    /// The configured output dimension D.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a batch of texts in one call.
    ///
    /// # Returns
    /// One vector per input text, in input order, each of length
    /// [`dimensions`](Self::dimensions).
    ///
    /// # Errors
    /// [`RagweedError::ExternalService`] on timeout, transport failure, a
    /// non-success status, a count mismatch, or a wrong-dimension vector.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("embedding {} texts with {}", texts.len(), self.model);

        let request = self
            .http
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                RagweedError::ExternalService(format!(
                    "embedding call timed out after {:?}",
                    self.timeout
                ))
            })??;

        if !response.status().is_success() {
            return Err(RagweedError::ExternalService(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let mut body: EmbeddingResponse = response.json().await.map_err(|e| {
            RagweedError::ExternalService(format!("malformed embedding response: {e}"))
        })?;

        if body.data.len() != texts.len() {
            return Err(RagweedError::ExternalService(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }

        body.data.sort_by_key(|row| row.index);
        let mut vectors = Vec::with_capacity(body.data.len());
        for row in body.data {
            if row.embedding.len() != self.dimensions {
                return Err(RagweedError::ExternalService(format!(
                    "embedding dimension {} does not match configured {}",
                    row.embedding.len(),
                    self.dimensions
                )));
            }
            vectors.push(row.embedding);
        }
        Ok(vectors)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| RagweedError::ExternalService("empty embedding response".into()))
    }
}

/// Access to the remote text-generation model.
pub struct GenerationGateway {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl GenerationGateway {
    /// Create a gateway from configuration.
    pub fn new(config: &RagweedConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base.clone());
        Self {
            client: Client::with_config(openai_config),
            model: config.chat_model.clone(),
            timeout: Duration::from_secs(config.gateway_timeout_secs),
        }
    }

    /// Run one chat completion and return the assistant's text.
    ///
    /// # Errors
    /// [`RagweedError::ExternalService`] on timeout, transport failure, or an
    /// empty completion.
    pub async fn generate(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
    ) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(messages)
            .build()?;
        debug!("sending completion request to {}", self.model);

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                RagweedError::ExternalService(format!(
                    "generation call timed out after {:?}",
                    self.timeout
                ))
            })??;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(RagweedError::ExternalService(
                "generation endpoint returned an empty completion".into(),
            ));
        }
        Ok(text)
    }
}
