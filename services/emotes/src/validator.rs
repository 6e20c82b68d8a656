//! Upload validation.
//!
//! Cheap checks (size, name, tags, flags) run before anything touches the
//! disk. The payload is then sniffed, written to a scoped temp file and
//! probed for its dimensions and frame count.

use crate::config::UploadConfig;
use crate::model::EmoteFlags;
use crate::probe::{Container, MediaProbe, ProbeError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

static EMOTE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-_A-Za-z():0-9]{2,100}$").expect("name pattern is valid"));
static EMOTE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-z]{3,30}$").expect("tag pattern is valid"));

/// User-fixable problems with an upload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Upload Too Large (got {got}, but the maximum is {max})")]
    TooLarge { got: usize, max: usize },

    #[error("Bad Emote Name")]
    BadName,

    #[error("Bad Emote Tag '{0}'")]
    BadTag(String),

    #[error("Unknown Upload Format")]
    UnsupportedFormat,

    #[error("Too Many Frames (got {got}, but the maximum is {max})")]
    TooManyFrames { got: i64, max: u32 },

    #[error("Bad Input Width (got {got}, but the maximum is {max})")]
    BadWidth { got: i64, max: u32 },

    #[error("Bad Input Height (got {got}, but the maximum is {max})")]
    BadHeight { got: i64, max: u32 },
}

/// Why an upload could not be validated
#[derive(Error, Debug)]
pub enum ValidateError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Temp file error: {0}")]
    TempFile(#[from] std::io::Error),
}

/// Metadata declared by the uploader alongside the file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmoteData {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: i32,
}

/// A payload that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub name: String,
    pub tags: Vec<String>,
    pub flags: EmoteFlags,
    pub width: i64,
    pub height: i64,
    pub frame_count: i64,
    pub container: Container,
}

/// Validates raw uploads against the configured limits
pub struct UploadValidator {
    limits: UploadConfig,
    probe: Arc<dyn MediaProbe>,
}

impl UploadValidator {
    pub fn new(limits: UploadConfig, probe: Arc<dyn MediaProbe>) -> Self {
        Self { limits, probe }
    }

    pub fn limits(&self) -> &UploadConfig {
        &self.limits
    }

    /// Validate `bytes` uploaded as emote `id`
    #[instrument(skip(self, bytes, data), fields(emote_id = %id, size_bytes = bytes.len()))]
    pub async fn validate(
        &self,
        id: &str,
        bytes: &[u8],
        data: &EmoteData,
    ) -> Result<ValidatedUpload, ValidateError> {
        if bytes.len() > self.limits.max_upload_size {
            return Err(ValidationError::TooLarge {
                got: bytes.len(),
                max: self.limits.max_upload_size,
            }
            .into());
        }

        if !EMOTE_NAME.is_match(&data.name) {
            return Err(ValidationError::BadName.into());
        }
        let flags = EmoteFlags::masked(data.flags);
        let tags = normalize_tags(&data.tags, self.limits.max_tags)?;

        let container = Container::sniff(bytes).ok_or(ValidationError::UnsupportedFormat)?;

        // Removed when dropped, on every return path below
        let temp_file = self.write_temp_file(id, container, bytes)?;
        let info = self.probe.probe(temp_file.path(), container).await?;
        drop(temp_file);

        debug!(
            container = %container,
            width = info.width,
            height = info.height,
            frame_count = info.frame_count,
            "Upload probed"
        );

        let limits = &self.limits;
        if info.frame_count > i64::from(limits.max_frames) {
            return Err(ValidationError::TooManyFrames {
                got: info.frame_count,
                max: limits.max_frames,
            }
            .into());
        }
        if info.width <= 0 || info.width > i64::from(limits.max_width) {
            return Err(ValidationError::BadWidth {
                got: info.width,
                max: limits.max_width,
            }
            .into());
        }
        if info.height <= 0 || info.height > i64::from(limits.max_height) {
            return Err(ValidationError::BadHeight {
                got: info.height,
                max: limits.max_height,
            }
            .into());
        }

        Ok(ValidatedUpload {
            name: data.name.clone(),
            tags,
            flags,
            width: info.width,
            height: info.height,
            frame_count: info.frame_count,
            container,
        })
    }

    fn write_temp_file(
        &self,
        id: &str,
        container: Container,
        bytes: &[u8],
    ) -> std::io::Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.limits.temp_folder)?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}.", id))
            .suffix(&format!(".{}", container.extension()))
            .tempfile_in(&self.limits.temp_folder)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file)
    }
}

/// Keep the first `max_tags` entries, then check each one, skip blanks and
/// de-duplicate keeping first-seen order. Entries past the cap are dropped
/// without being checked.
pub fn normalize_tags(raw: &[String], max_tags: usize) -> Result<Vec<String>, ValidationError> {
    if raw.len() > max_tags {
        debug!(got = raw.len(), max = max_tags, "Dropping tags past the cap");
    }

    let mut tags: Vec<String> = Vec::with_capacity(raw.len().min(max_tags));
    for tag in raw.iter().take(max_tags).filter(|t| !t.is_empty()) {
        if !EMOTE_TAG.is_match(tag) {
            return Err(ValidationError::BadTag(tag.clone()));
        }
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    Ok(tags)
}
