//! Media container detection and dimension/frame probing.
//!
//! Containers are recognised from their byte signature. Width, height and
//! frame count come from `ffprobe`, except for WEBP which ffprobe cannot
//! count frames for reliably, so `webpmux -info` is used instead.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

static WEBPMUX_INFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Canvas size: (\d+) x (\d+)(?:\n?.*\n){0,2}(?:Number of frames: (\d+))?")
        .expect("webpmux pattern is valid")
});

/// Errors from running or parsing a probe tool
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}")]
    Exit { tool: &'static str, status: String },

    #[error("{tool} returned bad results: {output}")]
    Parse { tool: &'static str, output: String },
}

/// Upload container formats the pipeline accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Avi,
    Avif,
    Flv,
    Mp4,
    Webm,
    Gif,
    Jpeg,
    Png,
    Tiff,
    Webp,
}

impl Container {
    /// Detect the container from its content signature
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        let kind = infer::get(bytes)?;
        match kind.extension() {
            "avi" => Some(Container::Avi),
            "avif" => Some(Container::Avif),
            "flv" => Some(Container::Flv),
            "mp4" => Some(Container::Mp4),
            "webm" => Some(Container::Webm),
            "gif" => Some(Container::Gif),
            "jpg" => Some(Container::Jpeg),
            "png" => Some(Container::Png),
            "tif" => Some(Container::Tiff),
            "webp" => Some(Container::Webp),
            _ => None,
        }
    }

    /// File extension used for temp files and object keys
    pub fn extension(self) -> &'static str {
        match self {
            Container::Avi => "avi",
            Container::Avif => "avif",
            Container::Flv => "flv",
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
            Container::Gif => "gif",
            Container::Jpeg => "jpeg",
            Container::Png => "png",
            Container::Tiff => "tiff",
            Container::Webp => "webp",
        }
    }

    /// MIME type for the extension
    pub fn content_type(self) -> &'static str {
        match self {
            Container::Avi => "video/x-msvideo",
            Container::Avif => "image/avif",
            Container::Flv => "video/x-flv",
            Container::Mp4 => "video/mp4",
            Container::Webm => "video/webm",
            Container::Gif => "image/gif",
            Container::Jpeg => "image/jpeg",
            Container::Png => "image/png",
            Container::Tiff => "image/tiff",
            Container::Webp => "image/webp",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Dimensions and frame count reported by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    pub width: i64,
    pub height: i64,
    pub frame_count: i64,
}

/// Reads dimensions and frame count of a file on disk
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path, container: Container) -> Result<MediaInfo, ProbeError>;
}

/// Probe that shells out to `ffprobe` and `webpmux`
#[derive(Debug, Clone)]
pub struct CommandProbe {
    ffprobe_path: String,
    webpmux_path: String,
}

impl CommandProbe {
    pub fn new(ffprobe_path: impl Into<String>, webpmux_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            webpmux_path: webpmux_path.into(),
        }
    }

    async fn run(&self, tool: &'static str, program: &str, args: &[&str], path: &Path) -> Result<String, ProbeError> {
        let output = Command::new(program)
            .args(args)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn { tool, source })?;

        if !output.status.success() {
            return Err(ProbeError::Exit {
                tool,
                status: output.status.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self::new("ffprobe", "webpmux")
    }
}

#[async_trait]
impl MediaProbe for CommandProbe {
    #[instrument(skip(self), fields(container = %container))]
    async fn probe(&self, path: &Path, container: Container) -> Result<MediaInfo, ProbeError> {
        let info = match container {
            Container::Webp => {
                let output = self.run("webpmux", &self.webpmux_path, &["-info"], path).await?;
                parse_webpmux(&output)?
            }
            _ => {
                let output = self
                    .run(
                        "ffprobe",
                        &self.ffprobe_path,
                        &[
                            "-v",
                            "fatal",
                            "-select_streams",
                            "v:0",
                            "-count_frames",
                            "-show_entries",
                            "stream=nb_read_frames,width,height",
                            "-of",
                            "csv=p=0",
                        ],
                        path,
                    )
                    .await?;
                parse_ffprobe(&output)?
            }
        };

        debug!(
            width = info.width,
            height = info.height,
            frame_count = info.frame_count,
            "Probed upload"
        );
        Ok(info)
    }
}

/// Parse `width,height,frames` from ffprobe csv output
pub fn parse_ffprobe(output: &str) -> Result<MediaInfo, ProbeError> {
    let bad = || ProbeError::Parse {
        tool: "ffprobe",
        output: output.to_string(),
    };

    let fields: Vec<&str> = output.trim().split(',').collect();
    let [width, height, frames] = fields.as_slice() else {
        return Err(bad());
    };

    Ok(MediaInfo {
        width: width.parse().map_err(|_| bad())?,
        height: height.parse().map_err(|_| bad())?,
        frame_count: frames.parse().map_err(|_| bad())?,
    })
}

/// Parse canvas size and frame count from `webpmux -info` output.
/// A still image reports no frame count and counts as one frame.
pub fn parse_webpmux(output: &str) -> Result<MediaInfo, ProbeError> {
    let bad = || ProbeError::Parse {
        tool: "webpmux",
        output: output.to_string(),
    };

    let captures = WEBPMUX_INFO.captures(output).ok_or_else(bad)?;
    let number = |index: usize| -> Result<Option<i64>, ProbeError> {
        captures
            .get(index)
            .map(|m| m.as_str().parse().map_err(|_| bad()))
            .transpose()
    };

    Ok(MediaInfo {
        width: number(1)?.ok_or_else(bad)?,
        height: number(2)?.ok_or_else(bad)?,
        frame_count: number(3)?.unwrap_or(1),
    })
}
