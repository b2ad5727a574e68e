//! # Session memory
//!
//! Per-conversation ordered turn log, held in process memory for fast prompt
//! assembly. This is a **derived cache**, not the system of record: the
//! message table is authoritative, and a miss (cold start, eviction) is
//! answered by rehydrating from it in `(created_at, id)` order. Restarting the
//! process therefore loses no history.
//!
//! The cache is bounded: once more than `capacity` conversations are warm, the
//! least-recently-used one is dropped. Appends for the *same* conversation are
//! serialized by the caller (the service holds a per-conversation lock around
//! every turn); different conversations touch disjoint entries and proceed in
//! parallel.

use diesel::SqliteConnection;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::models::MessageRole;
use crate::store;

/// One remembered turn: who spoke and what they said.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Speaker role.
    pub role: MessageRole,
    /// Turn text.
    pub content: String,
}

impl Turn {
    /// Construct a new [`Turn`].
    pub fn new(role: MessageRole, content: String) -> Self {
        Self { role, content }
    }
}

struct SessionEntry {
    turns: Vec<Turn>,
    last_access: u64,
}

struct Inner {
    sessions: HashMap<i32, SessionEntry>,
    clock: u64,
}

/// Bounded, rehydrating cache of conversation turn logs.
pub struct SessionMemory {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl SessionMemory {
    /// Create a cache that keeps at most `capacity` conversations warm.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// The ordered turns of a conversation.
    ///
    /// On a cache miss the log is rebuilt from the message store, so the
    /// result is complete even right after process start.
    pub fn turns(&self, conn: &mut SqliteConnection, conversation_id: i32) -> Result<Vec<Turn>> {
        {
            let mut inner = self.inner.lock().expect("session memory lock poisoned");
            inner.clock += 1;
            let clock = inner.clock;
            if let Some(entry) = inner.sessions.get_mut(&conversation_id) {
                entry.last_access = clock;
                return Ok(entry.turns.clone());
            }
        }

        debug!("session memory miss for conversation {conversation_id}, rehydrating");
        let messages = store::conversation_messages(conn, conversation_id)?;
        let mut turns = Vec::with_capacity(messages.len());
        for message in &messages {
            turns.push(Turn::new(message.message_role()?, message.content.clone()));
        }

        let mut inner = self.inner.lock().expect("session memory lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        inner.sessions.insert(
            conversation_id,
            SessionEntry {
                turns: turns.clone(),
                last_access: clock,
            },
        );
        Self::enforce_capacity(&mut inner, self.capacity);
        Ok(turns)
    }

    /// Append a turn to a warm conversation.
    ///
    /// A cold conversation is left alone: appending a lone turn would cache a
    /// partial log, and the next [`turns`](Self::turns) call rebuilds the full
    /// one from the store anyway.
    pub fn append(&self, conversation_id: i32, role: MessageRole, content: &str) {
        let mut inner = self.inner.lock().expect("session memory lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(entry) = inner.sessions.get_mut(&conversation_id) {
            entry.turns.push(Turn::new(role, content.to_string()));
            entry.last_access = clock;
        }
    }

    /// Drop a conversation from the cache (used when it is deleted).
    pub fn evict(&self, conversation_id: i32) {
        let mut inner = self.inner.lock().expect("session memory lock poisoned");
        inner.sessions.remove(&conversation_id);
    }

    fn enforce_capacity(inner: &mut Inner, capacity: usize) {
        while inner.sessions.len() > capacity {
            let coldest = inner
                .sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| *id);
            match coldest {
                Some(id) => {
                    debug!("evicting conversation {id} from session memory");
                    inner.sessions.remove(&id);
                }
                None => break,
            }
        }
    }
}
