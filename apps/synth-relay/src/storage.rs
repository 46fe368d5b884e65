use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{Config, StoreBackend};
use crate::signaling::ServerMessage;

const ACTIVE_CONTROLLER_KEY: &str = "synth:controller:active";

/// Compare-and-swap on the active controller record. An empty string stands for "absent"
/// in both the expected and the next value.
const SWAP_CONTROLLER_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current then return 0 end
elseif current ~= ARGV[1] then
  return 0
end
if ARGV[2] == '' then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// A handshake envelope waiting for its recipient to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub recipient_id: String,
    pub message_id: String,
    pub payload: ServerMessage,
    /// Milliseconds since the unix epoch
    pub enqueued_at: i64,
}

impl QueuedMessage {
    pub fn new(recipient_id: &str, payload: ServerMessage) -> Self {
        Self {
            recipient_id: recipient_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub type SharedStore = Arc<dyn QueueStore>;

/// Shared TTL-capable key/value store. It is the only source of truth for the controller
/// lock and queued messages when several relay instances run side by side.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn active_controller(&self) -> Result<Option<String>, StoreError>;

    /// Atomically replace the active controller record if it still equals `expected`.
    /// Returns `false` without writing when it does not.
    async fn swap_active_controller(
        &self,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn push_message(&self, message: &QueuedMessage, ttl: Duration)
        -> Result<(), StoreError>;

    /// Unexpired messages for `recipient` in enqueue order.
    async fn pending_messages(&self, recipient: &str) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Delete one message. Only the caller that actually removed it gets `true`.
    async fn claim_message(&self, recipient: &str, message_id: &str) -> Result<bool, StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub async fn build_store(config: &Config) -> anyhow::Result<SharedStore> {
    match config.store_backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("SYNTH_RELAY_STORE=redis but REDIS_URL missing"))?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
    }
}

struct StoredMessage {
    message: QueuedMessage,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryInner {
    controller: Option<String>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
}

/// Single-process store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn active_controller(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.controller.clone())
    }

    async fn swap_active_controller(
        &self,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.controller.as_deref() != expected {
            return Ok(false);
        }
        guard.controller = next.map(str::to_string);
        Ok(true)
    }

    async fn push_message(
        &self,
        message: &QueuedMessage,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        guard
            .queues
            .entry(message.recipient_id.clone())
            .or_default()
            .push_back(StoredMessage {
                message: message.clone(),
                expires_at: Instant::now() + ttl,
            });
        Ok(())
    }

    async fn pending_messages(&self, recipient: &str) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let Some(queue) = guard.queues.get_mut(recipient) else {
            return Ok(Vec::new());
        };
        queue.retain(|stored| stored.expires_at > now);
        let pending = queue.iter().map(|stored| stored.message.clone()).collect();
        if queue.is_empty() {
            guard.queues.remove(recipient);
        }
        Ok(pending)
    }

    async fn claim_message(&self, recipient: &str, message_id: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        let Some(queue) = guard.queues.get_mut(recipient) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|stored| stored.message.message_id != message_id);
        let claimed = queue.len() != before;
        if queue.is_empty() {
            guard.queues.remove(recipient);
        }
        Ok(claimed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    swap_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            swap_script: redis::Script::new(SWAP_CONTROLLER_SCRIPT),
        })
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn active_controller(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(ACTIVE_CONTROLLER_KEY).await?;
        Ok(value)
    }

    async fn swap_active_controller(
        &self,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .swap_script
            .key(ACTIVE_CONTROLLER_KEY)
            .arg(expected.unwrap_or(""))
            .arg(next.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn push_message(
        &self,
        message: &QueuedMessage,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let ttl_seconds = ttl.as_secs().max(1);
        let queue_key = queue_key(&message.recipient_id);
        let payload_key = payload_key(&message.recipient_id, &message.message_id);
        let serialized = serde_json::to_string(message)?;
        // Payload carries the TTL; the id list only needs to outlive its newest entry.
        redis::pipe()
            .atomic()
            .cmd("SETEX")
            .arg(&payload_key)
            .arg(ttl_seconds)
            .arg(&serialized)
            .ignore()
            .cmd("RPUSH")
            .arg(&queue_key)
            .arg(&message.message_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&queue_key)
            .arg(ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_messages(&self, recipient: &str) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut conn = self.redis.clone();
        let queue_key = queue_key(recipient);
        let ids: Vec<String> = conn.lrange(&queue_key, 0, -1).await?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let serialized: Option<String> = conn.get(payload_key(recipient, &id)).await?;
            match serialized {
                Some(json) => match serde_json::from_str::<QueuedMessage>(&json) {
                    Ok(message) => results.push(message),
                    Err(err) => {
                        tracing::warn!(%recipient, message_id = %id, error = %err, "dropping undecodable queued message");
                        let _: () = conn.lrem(&queue_key, 0, &id).await?;
                    }
                },
                None => {
                    // Payload expired; prune the dangling id.
                    let _: () = conn.lrem(&queue_key, 0, &id).await?;
                }
            }
        }
        Ok(results)
    }

    async fn claim_message(&self, recipient: &str, message_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let (deleted, _removed): (i64, i64) = redis::pipe()
            .cmd("DEL")
            .arg(payload_key(recipient, message_id))
            .cmd("LREM")
            .arg(queue_key(recipient))
            .arg(0)
            .arg(message_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn queue_key(recipient: &str) -> String {
    format!("synth:queue:{}", recipient)
}

fn payload_key(recipient: &str, message_id: &str) -> String {
    format!("synth:queue:{}:msg:{}", recipient, message_id)
}
