//! Emote record and its lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an emote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmoteStatus {
    /// Staged and dispatched, worker has not reported yet
    Pending,
    /// Worker picked up the job
    Processing,
    /// Outputs are available
    Live,
    /// Worker gave up on the job
    Failed,
}

impl EmoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmoteStatus::Pending => "PENDING",
            EmoteStatus::Processing => "PROCESSING",
            EmoteStatus::Live => "LIVE",
            EmoteStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EmoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EmoteStatus::Pending),
            "PROCESSING" => Ok(EmoteStatus::Processing),
            "LIVE" => Ok(EmoteStatus::Live),
            "FAILED" => Ok(EmoteStatus::Failed),
            other => Err(format!("unknown emote status '{}'", other)),
        }
    }
}

/// Emote flag bits accepted from uploaders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmoteFlags(pub i32);

impl EmoteFlags {
    pub const PRIVATE: i32 = 1 << 0;
    pub const ZERO_WIDTH: i32 = 1 << 8;

    const KNOWN: i32 = Self::PRIVATE | Self::ZERO_WIDTH;

    /// Drop any bit that is not a known flag
    pub fn masked(raw: i32) -> Self {
        Self(raw & Self::KNOWN)
    }

    pub fn bits(self) -> i32 {
        self.0
    }
}

/// One rendition of an emote at a given scale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSize {
    /// Scale label, e.g. `1x`
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub animated: bool,
    /// Worker time spent on this rendition
    pub processing_time: i64,
    /// Byte length
    pub length: i64,
}

/// All renditions sharing a content type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteFormat {
    /// Content type, e.g. `image/webp`
    pub name: String,
    pub sizes: Vec<EmoteSize>,
}

/// Persisted emote record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emote {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub frame_count: i32,
    pub flags: EmoteFlags,
    pub status: EmoteStatus,
    pub formats: Vec<EmoteFormat>,
    pub created_at: DateTime<Utc>,
}

impl Emote {
    /// New record as written at upload time
    pub fn pending(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        tags: Vec<String>,
        frame_count: i32,
        flags: EmoteFlags,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            tags,
            frame_count,
            flags,
            status: EmoteStatus::Pending,
            formats: Vec::new(),
            created_at: Utc::now(),
        }
    }
}
