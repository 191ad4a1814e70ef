use crate::files::Bucket;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the uploads service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Capability token and internal RPC secrets
    pub auth: AuthConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object store regions, primary first
    pub regions: Vec<RegionConfig>,
    /// Object placement and preview configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-bucket upload limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Garbage collection configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Event bus configuration
    pub events: EventsConfig,
    /// CDN cache purge configuration
    #[serde(default)]
    pub cache_purge: Option<CachePurgeConfig>,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
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

/// Secrets for token verification. Both are required and never defaulted.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC-SHA256 key used to sign capability tokens
    pub token_secret: String,
    /// Bearer secret for the internal service-to-service API
    pub internal_token: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &"<redacted>")
            .field("internal_token", &"<redacted>")
            .finish()
    }
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

/// One S3-compatible backend
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    /// Region identifier recorded as a file's upload region
    pub name: String,
    /// AWS region passed to the SDK
    #[serde(default = "default_aws_region")]
    pub aws_region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key, falls back to the default credential chain
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Object placement, timeouts and preview settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Deadline for a single object store call in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Deadline for a single transcode in seconds
    #[serde(default = "default_transcode_timeout_secs")]
    pub transcode_timeout_secs: u64,
    /// Bucket holding cached previews
    #[serde(default = "default_previews_bucket")]
    pub previews_bucket: String,
    /// Bucket holding user data exports
    #[serde(default = "default_data_exports_bucket")]
    pub data_exports_bucket: String,
    /// Longest edge of a preview in pixels
    #[serde(default = "default_preview_max_dimension")]
    pub preview_max_dimension: u32,
    /// Sources larger than this are served without a preview
    #[serde(default = "default_preview_max_source_bytes")]
    pub preview_max_source_bytes: u64,
}

/// Per-bucket upload size caps
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_icon_mib")]
    pub max_icon_size_mib: u64,
    #[serde(default = "default_emoji_mib")]
    pub max_emoji_size_mib: u64,
    #[serde(default = "default_sticker_mib")]
    pub max_sticker_size_mib: u64,
    #[serde(default = "default_attachment_mib")]
    pub max_attachment_size_mib: u64,
}

/// Garbage collection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// How long an unclaimed upload survives, clamped to 10..=30 minutes
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Interval between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Rows examined per sweep
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: i64,
}

/// Kafka configuration for claim events and moderation notifications
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying claim/unclaim/run_background_tasks events
    #[serde(default = "default_uploads_topic")]
    pub uploads_topic: String,
    /// Topic receiving ban_user notifications
    #[serde(default = "default_admin_topic")]
    pub admin_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

/// CDN purge API credentials
#[derive(Debug, Clone, Deserialize)]
pub struct CachePurgeConfig {
    /// Bearer token for the purge API
    pub api_token: String,
    /// Zone whose cache is purged
    pub zone_id: String,
    /// Public base URL files are served under
    pub public_url: String,
    /// Purge API base
    #[serde(default = "default_purge_api_base")]
    pub api_base: String,
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
    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "uploads-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
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

fn default_true() -> bool {
    true
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_transcode_timeout_secs() -> u64 {
    20
}

fn default_previews_bucket() -> String {
    "attachment-previews".to_string()
}

fn default_data_exports_bucket() -> String {
    "data-exports".to_string()
}

fn default_preview_max_dimension() -> u32 {
    720
}

fn default_preview_max_source_bytes() -> u64 {
    10 << 20
}

fn default_icon_mib() -> u64 {
    5
}

fn default_emoji_mib() -> u64 {
    5
}

fn default_sticker_mib() -> u64 {
    5
}

fn default_attachment_mib() -> u64 {
    25
}

fn default_grace_period_secs() -> u64 {
    900 // 15 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_sweep_batch_size() -> i64 {
    500
}

fn default_consumer_group() -> String {
    "uploads-service".to_string()
}

fn default_uploads_topic() -> String {
    "uploads".to_string()
}

fn default_admin_topic() -> String {
    "admin".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

fn default_purge_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_max_body_bytes() -> usize {
    32 << 20
}

const MIN_GRACE_PERIOD_SECS: u64 = 10 * 60;
const MAX_GRACE_PERIOD_SECS: u64 = 30 * 60;

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "uploads-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/uploads").required(false))
            .add_source(config::File::with_name("/etc/uploads/uploads").required(false))
            // Override with environment variables
            // UPLOADS__AUTH__TOKEN_SECRET -> auth.token_secret
            .add_source(
                config::Environment::with_prefix("UPLOADS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.regions.is_empty() {
            anyhow::bail!("at least one region must be configured");
        }
        if self.auth.token_secret.is_empty() {
            anyhow::bail!("auth.token_secret must not be empty");
        }
        if self.auth.internal_token.is_empty() {
            anyhow::bail!("auth.internal_token must not be empty");
        }
        self.storage.validate()?;
        self.lifecycle.validate()?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.preview_max_dimension == 0 {
            anyhow::bail!("storage.preview_max_dimension must be at least 1");
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

impl LimitsConfig {
    /// Largest upload accepted into a bucket, in bytes
    pub fn max_bytes(&self, bucket: Bucket) -> u64 {
        let mib = match bucket {
            Bucket::Icons => self.max_icon_size_mib,
            Bucket::Emojis => self.max_emoji_size_mib,
            Bucket::Stickers => self.max_sticker_size_mib,
            Bucket::Attachments => self.max_attachment_size_mib,
        };
        mib << 20
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_batch_size < 1 {
            anyhow::bail!("lifecycle.sweep_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Grace period clamped to the supported window
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(
            self.grace_period_secs
                .clamp(MIN_GRACE_PERIOD_SECS, MAX_GRACE_PERIOD_SECS),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
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

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout_secs(),
            transcode_timeout_secs: default_transcode_timeout_secs(),
            previews_bucket: default_previews_bucket(),
            data_exports_bucket: default_data_exports_bucket(),
            preview_max_dimension: default_preview_max_dimension(),
            preview_max_source_bytes: default_preview_max_source_bytes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_icon_size_mib: default_icon_mib(),
            max_emoji_size_mib: default_emoji_mib(),
            max_sticker_size_mib: default_sticker_mib(),
            max_attachment_size_mib: default_attachment_mib(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch_size: default_sweep_batch_size(),
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
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
