use emote_pipeline::AmqpConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the emote service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upload validation limits and tooling
    #[serde(default)]
    pub upload: UploadConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// AMQP broker configuration. Without it uploads are refused as locked.
    pub amqp: Option<AmqpConfig>,
    /// Database configuration. Without it records live in memory.
    pub database: Option<DatabaseConfig>,
    /// Redis configuration for transient processing status
    pub redis: Option<RedisConfig>,
    /// Authentication configuration
    pub auth: AuthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Upload limits and external probing tools
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
    /// Most frames an animated upload may have
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    /// Widest accepted input in pixels
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    /// Tallest accepted input in pixels
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    /// Most distinct tags per emote
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    /// Folder for scoped temporary upload files
    #[serde(default = "default_temp_folder")]
    pub temp_folder: PathBuf,
    /// ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// webpmux binary
    #[serde(default = "default_webpmux_path")]
    pub webpmux_path: String,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket receiving raw uploads (private ACL)
    pub private_bucket: String,
    /// Bucket the processing worker writes outputs to
    pub public_bucket: String,
    /// Prefix for staged upload keys, e.g. `internal/emote/`
    #[serde(default)]
    pub internal_prefix: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// How long a processing stage stays visible to pollers
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,
}

// Default value functions
fn default_service_name() -> String {
    "emote-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_upload_size() -> usize {
    2_621_440 // 2.5MB
}

fn default_max_frames() -> u32 {
    750
}

fn default_max_dimension() -> u32 {
    1000
}

fn default_max_tags() -> usize {
    6
}

fn default_temp_folder() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_webpmux_path() -> String {
    "webpmux".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_status_ttl_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/emotes").required(false))
            .add_source(config::File::with_name("/etc/emotes/emotes").required(false))
            // Override with environment variables
            // EMOTES__AMQP__URI -> amqp.uri
            .add_source(
                config::Environment::with_prefix("EMOTES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get status TTL as Duration
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(
            self.redis
                .as_ref()
                .map_or_else(default_status_ttl_secs, |r| r.status_ttl_secs),
        )
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            max_frames: default_max_frames(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            max_tags: default_max_tags(),
            temp_folder: default_temp_folder(),
            ffprobe_path: default_ffprobe_path(),
            webpmux_path: default_webpmux_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_upload_limits() {
        let upload = UploadConfig::default();
        assert_eq!(upload.max_upload_size, 2_621_440);
        assert_eq!(upload.max_frames, 750);
        assert_eq!(upload.max_width, 1000);
        assert_eq!(upload.max_height, 1000);
        assert_eq!(upload.max_tags, 6);
        assert_eq!(upload.temp_folder, PathBuf::from("tmp"));
    }

    #[test]
    fn test_optional_sections() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "s3": {"private_bucket": "raw", "public_bucket": "cdn"},
            "auth": {"jwt_secret": "secret"}
        }))
        .unwrap();

        assert!(config.amqp.is_none());
        assert!(config.database.is_none());
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.status_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_redis_ttl_override() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "s3": {"private_bucket": "raw", "public_bucket": "cdn"},
            "redis": {"url": "redis://localhost", "status_ttl_secs": 5},
            "auth": {"jwt_secret": "secret"}
        }))
        .unwrap();

        assert_eq!(config.status_ttl(), Duration::from_secs(5));
    }
}
