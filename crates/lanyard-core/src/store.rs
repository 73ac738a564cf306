use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use lanyard_models::message::ChatMessage;
use lanyard_models::user::User;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// User lookup collaborator. The real account database lives behind the
/// REST/auth service; the gateway only ever resolves and enumerates users.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn find_all(&self) -> Result<Vec<User>, StoreError>;
}

/// Message persistence collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, author_id: i64, content: &str) -> Result<ChatMessage, StoreError>;
    /// Page of messages strictly older than `before` (newest first).
    async fn history(
        &self,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

// ── In-memory implementations ────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<i64, User>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id, user);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_all(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }
}

/// Ring-buffer message store: keeps the newest `capacity` messages.
pub struct MemoryMessageStore {
    messages: RwLock<VecDeque<ChatMessage>>,
    next_id: AtomicI64,
    capacity: usize,
}

impl MemoryMessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicI64::new(1),
            capacity,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, author_id: i64, content: &str) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            author_id,
            content: content.to_string(),
            created_at: Utc::now(),
            nonce: None,
        };
        let mut messages = self.messages.write().await;
        if messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(message.clone());
        Ok(message)
    }

    async fn history(
        &self,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .filter(|m| before.is_none_or(|b| m.id < b))
            .take(limit)
            .cloned()
            .collect())
    }
}
