//! Emote record persistence.
//!
//! `PgEmoteStore` is the production store. `MemoryEmoteStore` backs tests and
//! deployments without a database section.

use crate::config::DatabaseConfig;
use crate::model::{Emote, EmoteFlags, EmoteFormat, EmoteStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by emote record storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Emote {0} already exists")]
    Duplicate(String),

    #[error("Stored emote {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence for emote lifecycle records
#[async_trait]
pub trait EmoteStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, emote: &Emote) -> Result<(), StoreError>;

    /// Look up a record by id
    async fn find_by_id(&self, id: &str) -> Result<Option<Emote>, StoreError>;

    /// Set only the status. Returns whether a record matched.
    async fn update_status(&self, id: &str, status: EmoteStatus) -> Result<bool, StoreError>;

    /// Replace the whole formats list and set the status in one write.
    /// Returns whether a record matched.
    async fn replace_formats(
        &self,
        id: &str,
        formats: &[EmoteFormat],
        status: EmoteStatus,
    ) -> Result<bool, StoreError>;

    /// Check the backing store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct EmoteRow {
    id: String,
    owner_id: String,
    name: String,
    tags: Vec<String>,
    frame_count: i32,
    flags: i32,
    status: String,
    formats: Json<Vec<EmoteFormat>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EmoteRow> for Emote {
    type Error = StoreError;

    fn try_from(row: EmoteRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(|message| StoreError::Corrupt {
            id: row.id.clone(),
            message,
        })?;

        Ok(Emote {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            tags: row.tags,
            frame_count: row.frame_count,
            flags: EmoteFlags(row.flags),
            status,
            formats: row.formats.0,
            created_at: row.created_at,
        })
    }
}

/// Emote store backed by PostgreSQL
pub struct PgEmoteStore {
    pool: PgPool,
}

impl PgEmoteStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

}

#[async_trait]
impl EmoteStore for PgEmoteStore {
    #[instrument(skip(self, emote), fields(emote_id = %emote.id))]
    async fn insert(&self, emote: &Emote) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO emotes (
                id, owner_id, name, tags, frame_count,
                flags, status, formats, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9
            )
            "#,
        )
        .bind(&emote.id)
        .bind(&emote.owner_id)
        .bind(&emote.name)
        .bind(&emote.tags)
        .bind(emote.frame_count)
        .bind(emote.flags.bits())
        .bind(emote.status.as_str())
        .bind(Json(&emote.formats))
        .bind(emote.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Emote record inserted");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(emote.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Emote>, StoreError> {
        let row = sqlx::query_as::<_, EmoteRow>(
            r#"
            SELECT id, owner_id, name, tags, frame_count,
                   flags, status, formats, created_at
            FROM emotes
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Emote::try_from).transpose()
    }

    #[instrument(skip(self), fields(status = %status))]
    async fn update_status(&self, id: &str, status: EmoteStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE emotes SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, formats), fields(format_count = formats.len(), status = %status))]
    async fn replace_formats(
        &self,
        id: &str,
        formats: &[EmoteFormat],
        status: EmoteStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE emotes SET formats = $2, status = $3 WHERE id = $1")
            .bind(id)
            .bind(Json(formats))
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Emote store kept in process memory
#[derive(Default)]
pub struct MemoryEmoteStore {
    emotes: RwLock<HashMap<String, Emote>>,
}

impl MemoryEmoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.emotes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.emotes.read().is_empty()
    }

    /// Snapshot of every stored record
    pub fn all(&self) -> Vec<Emote> {
        self.emotes.read().values().cloned().collect()
    }
}

#[async_trait]
impl EmoteStore for MemoryEmoteStore {
    async fn insert(&self, emote: &Emote) -> Result<(), StoreError> {
        let mut emotes = self.emotes.write();
        if emotes.contains_key(&emote.id) {
            return Err(StoreError::Duplicate(emote.id.clone()));
        }
        emotes.insert(emote.id.clone(), emote.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Emote>, StoreError> {
        Ok(self.emotes.read().get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: EmoteStatus) -> Result<bool, StoreError> {
        Ok(self
            .emotes
            .write()
            .get_mut(id)
            .map(|emote| emote.status = status)
            .is_some())
    }

    async fn replace_formats(
        &self,
        id: &str,
        formats: &[EmoteFormat],
        status: EmoteStatus,
    ) -> Result<bool, StoreError> {
        Ok(self
            .emotes
            .write()
            .get_mut(id)
            .map(|emote| {
                emote.formats = formats.to_vec();
                emote.status = status;
            })
            .is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
