//! # Background extraction queue
//!
//! The bridge between "a user message was created" and the extraction engine.
//! Triggers are enqueued on a **bounded** channel and processed by one worker
//! task, detached from every request path: the caller never awaits a run and
//! never sees its failures.
//!
//! Each job is attempted up to a configured number of times with exponential
//! backoff; a job that keeps failing lands in a bounded dead-letter buffer
//! (and the log) instead of vanishing. The worker reads the already-committed
//! message row directly; there is no delay-and-hope between the insert and
//! the run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::establish_connection;
use crate::extraction::AttributeExtractionEngine;

/// Maximum dead letters kept in memory; older entries fall off the front.
const DEAD_LETTER_CAPACITY: usize = 64;

/// One extraction trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    /// The user whose attributes should be refreshed.
    pub user_id: String,
    /// The just-created `user`-role message that triggered the run.
    pub message_id: i32,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The failed job.
    pub job: ExtractionJob,
    /// The final attempt's error text.
    pub reason: String,
}

/// Bounded queue plus its worker task.
pub struct ExtractionQueue {
    sender: Mutex<Option<mpsc::Sender<ExtractionJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl ExtractionQueue {
    /// Start the worker and return the queue handle.
    ///
    /// # Parameters
    /// - `engine`: The extraction engine jobs are run against.
    /// - `database_url`: Worker connections are opened per attempt from this.
    /// - `depth`: Channel bound; a full channel dead-letters new triggers.
    /// - `max_attempts`: Attempts per job before dead-lettering.
    /// - `backoff_ms`: Base delay between attempts, doubled each retry.
    pub fn spawn(
        engine: Arc<AttributeExtractionEngine>,
        database_url: String,
        depth: usize,
        max_attempts: u32,
        backoff_ms: u64,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<ExtractionJob>(depth.max(1));
        let dead_letters = Arc::new(Mutex::new(VecDeque::new()));
        let worker_letters = Arc::clone(&dead_letters);

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                debug!(
                    "extraction job for user {} message {}",
                    job.user_id, job.message_id
                );
                let mut last_error = String::new();
                let mut done = false;

                for attempt in 1..=max_attempts.max(1) {
                    let run = async {
                        let mut conn = establish_connection(&database_url)?;
                        engine
                            .run_for_message(&mut conn, &job.user_id, job.message_id)
                            .await
                    };
                    match run.await {
                        Ok(outcome) => {
                            if outcome.changed {
                                info!(
                                    "extraction updated attributes for user {}",
                                    job.user_id
                                );
                            }
                            done = true;
                            break;
                        }
                        Err(e) => {
                            last_error = e.to_string();
                            warn!(
                                "extraction attempt {attempt}/{max_attempts} failed for user {}: {last_error}",
                                job.user_id
                            );
                            if attempt < max_attempts {
                                let delay = backoff_ms.saturating_mul(1 << (attempt - 1));
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                            }
                        }
                    }
                }

                if !done {
                    error!(
                        "extraction job for user {} message {} dead-lettered: {last_error}",
                        job.user_id, job.message_id
                    );
                    push_dead_letter(
                        &worker_letters,
                        DeadLetter {
                            job,
                            reason: last_error,
                        },
                    );
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dead_letters,
        }
    }

    /// Enqueue a trigger. Never blocks and never fails the caller: a full or
    /// closed queue dead-letters the job instead.
    pub fn dispatch(&self, user_id: &str, message_id: i32) {
        let job = ExtractionJob {
            user_id: user_id.to_string(),
            message_id,
        };
        let sender = self.sender.lock().expect("queue sender lock poisoned");
        let Some(sender) = sender.as_ref() else {
            push_dead_letter(
                &self.dead_letters,
                DeadLetter {
                    job,
                    reason: "queue is shut down".into(),
                },
            );
            return;
        };
        if let Err(e) = sender.try_send(job) {
            let (job, reason) = match e {
                mpsc::error::TrySendError::Full(job) => (job, "queue is full".to_string()),
                mpsc::error::TrySendError::Closed(job) => (job, "queue is closed".to_string()),
            };
            warn!(
                "dropping extraction trigger for user {} message {}: {reason}",
                job.user_id, job.message_id
            );
            push_dead_letter(&self.dead_letters, DeadLetter { job, reason });
        }
    }

    /// Snapshot of the dead-letter buffer.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .expect("dead letter lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Stop accepting jobs and wait for the worker to drain the channel.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .expect("queue sender lock poisoned")
            .take();
        let worker = self.worker.lock().expect("queue worker lock poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

fn push_dead_letter(letters: &Arc<Mutex<VecDeque<DeadLetter>>>, letter: DeadLetter) {
    let mut letters = letters.lock().expect("dead letter lock poisoned");
    if letters.len() == DEAD_LETTER_CAPACITY {
        letters.pop_front();
    }
    letters.push_back(letter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceMetric, RagweedConfig, initialize_database};
    use crate::gateway::GenerationGateway;
    use crate::models::MessageRole;
    use crate::store::{create_conversation, get_user, insert_message, set_required_attributes};
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

    fn seed_user_with_message(database_url: &str) -> i32 {
        let mut conn = establish_connection(database_url).unwrap();
        initialize_database(&mut conn).unwrap();
        let conversation = create_conversation(&mut conn, "u1", None).unwrap();
        set_required_attributes(&mut conn, "u1", &["name".to_string()]).unwrap();
        let message = insert_message(
            &mut conn,
            conversation.id.unwrap(),
            MessageRole::User,
            "my name is Alice",
        )
        .unwrap();
        message.id.unwrap()
    }

    #[tokio::test]
    async fn dispatched_jobs_update_the_user_in_the_background() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "id": "cmpl-1",
                    "object": "chat.completion",
                    "created": 1,
                    "model": "chat",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "{\"name\": \"Alice\"}"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let database_url = dir.path().join("queue.db").to_str().unwrap().to_string();
        let message_id = seed_user_with_message(&database_url);

        let config = test_config(&server.url("/v1"), &database_url);
        let engine = Arc::new(AttributeExtractionEngine::new(Arc::new(
            GenerationGateway::new(&config),
        )));
        let queue = ExtractionQueue::spawn(
            engine,
            database_url.clone(),
            config.extraction_queue_depth,
            config.extraction_max_attempts,
            config.extraction_backoff_ms,
        );

        queue.dispatch("u1", message_id);
        queue.shutdown().await;

        let mut conn = establish_connection(&database_url).unwrap();
        let user = get_user(&mut conn, "u1").unwrap();
        assert_eq!(user.attribute_map().get("name").unwrap(), "Alice");
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn failing_jobs_are_retried_then_dead_lettered() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let database_url = dir.path().join("queue.db").to_str().unwrap().to_string();
        let message_id = seed_user_with_message(&database_url);

        let config = test_config(&server.url("/v1"), &database_url);
        let engine = Arc::new(AttributeExtractionEngine::new(Arc::new(
            GenerationGateway::new(&config),
        )));
        let queue = ExtractionQueue::spawn(
            engine,
            database_url.clone(),
            config.extraction_queue_depth,
            config.extraction_max_attempts,
            config.extraction_backoff_ms,
        );

        queue.dispatch("u1", message_id);
        queue.shutdown().await;

        let letters = queue.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job.user_id, "u1");
        // One call per attempt.
        assert_eq!(mock.hits_async().await as u32, config.extraction_max_attempts);

        // The user's attributes were never corrupted.
        let mut conn = establish_connection(&database_url).unwrap();
        let user = get_user(&mut conn, "u1").unwrap();
        assert!(user.attribute_map().is_empty());
        assert!(user.last_extraction_date.is_none());
    }
}
