//! Short-lived processing stage per emote, for pollers.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Cache key holding the latest stage tag of an emote
pub fn status_key(emote_id: &str) -> String {
    format!("emote-processing:{}:status", emote_id)
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Record `stage` for `emote_id`, visible for `ttl`
    async fn set(&self, emote_id: &str, stage: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Latest unexpired stage for `emote_id`
    async fn get(&self, emote_id: &str) -> Result<Option<String>, CacheError>;
}

/// Status cache backed by redis
#[derive(Clone)]
pub struct RedisStatusCache {
    connection: ConnectionManager,
}

impl RedisStatusCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn set(&self, emote_id: &str, stage: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(status_key(emote_id), stage, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, emote_id: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        let stage = connection
            .get::<_, Option<String>>(status_key(emote_id))
            .await?;
        Ok(stage)
    }
}

/// Status cache kept in process memory
#[derive(Default)]
pub struct MemoryStatusCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included until the next write
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn set(&self, emote_id: &str, stage: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        // Sweep expired entries; nothing else removes unread keys
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        self.entries
            .insert(status_key(emote_id), (stage.to_string(), now + ttl));
        Ok(())
    }

    async fn get(&self, emote_id: &str) -> Result<Option<String>, CacheError> {
        let key = status_key(emote_id);
        let live = self
            .entries
            .get(&key)
            .map(|entry| (entry.0.clone(), entry.1 > Instant::now()));

        match live {
            Some((stage, true)) => Ok(Some(stage)),
            Some((_, false)) => {
                self.entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
