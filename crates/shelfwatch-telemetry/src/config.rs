//! Telemetry configuration and management

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

/// Main telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Hourly metrics configuration
    pub metrics: MetricsConfig,

    /// Trace lifecycle configuration
    pub tracing: TracingConfig,

    /// Latency alerting
    pub alerts: AlertConfig,

    /// Rotated archive retention
    pub retention: RetentionConfig,

    /// Privacy and security settings
    pub privacy: PrivacyConfig,

    /// Background task intervals
    pub schedule: ScheduleConfig,
}

/// Logging-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level that reaches any sink
    pub level: LogLevel,

    /// Console output format
    pub format: LogFormat,

    /// Enable console logging
    pub console_enabled: bool,

    /// Enable JSON-Lines file logging
    pub file_enabled: bool,

    /// Directory for log files and reports
    pub log_dir: PathBuf,

    /// Size above which a log file is rotated before the next append
    pub max_file_size_bytes: u64,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Days of hourly buckets kept in memory
    pub retention_days: u32,

    /// Rolling duration samples kept per operation per hour
    pub sample_window: usize,

    /// Prefix for exported metric names
    pub namespace: String,

    /// Mirror counts into the `metrics` crate facade
    pub facade_enabled: bool,
}

/// Trace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Enable trace recording
    pub enabled: bool,

    /// Hours a trace stays inspectable after it started
    pub trace_retention_hours: u32,

    /// Buffered completions per subscriber before it starts lagging
    pub completion_channel_capacity: usize,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enable threshold evaluation
    pub enabled: bool,

    /// Threshold for operations missing from `thresholds`
    pub default_threshold_ms: u64,

    /// Per-operation latency thresholds
    pub thresholds: HashMap<String, u64>,

    /// Most recent alerts retained
    pub max_alerts: usize,
}

/// Rotated archive retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum archives kept per log file
    pub max_archives: u32,

    /// Maximum age of archives (in days)
    pub max_age_days: u32,

    /// Gzip archives older than a day
    pub compress_archives: bool,
}

/// Privacy and security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Enable automatic sanitization of sensitive data
    pub sanitize_enabled: bool,

    /// Patterns to redact from logs (regex patterns)
    pub redaction_patterns: Vec<String>,

    /// Fields to always redact
    pub redacted_fields: Vec<String>,
}

/// Background task intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Metric bucket and trace eviction
    pub cleanup_interval_secs: u64,

    /// Rotation check and archive retention
    pub rotation_interval_secs: u64,

    /// Full performance report
    pub report_interval_secs: u64,
}

/// Log level configuration, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Whether an entry at `self` passes a `threshold` level
    pub fn passes(&self, threshold: LogLevel) -> bool {
        *self <= threshold
    }

    /// File that receives entries of this level
    pub fn file_name(&self) -> &'static str {
        match self {
            LogLevel::Error => "errors.log",
            LogLevel::Debug | LogLevel::Trace => "performance.log",
            LogLevel::Warn | LogLevel::Info => "application.log",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(Error::Config {
                message: format!("Unknown log level '{}'", other),
            }),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON format
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Config {
                message: format!("Unknown log format '{}'", other),
            }),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            console_enabled: true,
            file_enabled: true,
            log_dir: TelemetryConfig::default_log_dir().unwrap_or_else(|_| PathBuf::from("./logs")),
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
            sample_window: 100,
            namespace: "shelfwatch".to_string(),
            facade_enabled: true,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_retention_hours: 24,
            completion_channel_capacity: 256,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        let thresholds = [
            ("batchUpsert", 30_000),
            ("uploadImage", 10_000),
            ("generateSeoContent", 30_000),
            ("categorizeProducts", 15_000),
            ("search", 5_000),
        ]
        .into_iter()
        .map(|(op, ms)| (op.to_string(), ms))
        .collect();

        Self {
            enabled: true,
            default_threshold_ms: 10_000,
            thresholds,
            max_alerts: 100,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_archives: 10,
            max_age_days: 30,
            compress_archives: true,
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            sanitize_enabled: true,
            redaction_patterns: vec![
                // API keys and tokens
                r"(?i)(api_?key|token|secret|password)\s*[:=]\s*['\x22]?([a-zA-Z0-9_\-\.]+)['\x22]?".to_string(),
                // Bearer credentials in captured request headers
                r"(?i)(bearer)\s+([a-zA-Z0-9_\-\.=]+)".to_string(),
                // Credit card numbers
                r"\b\d{4}[\s\-]?\d{4}[\s\-]?\d{4}[\s\-]?\d{4}\b".to_string(),
            ],
            redacted_fields: vec![
                "password".to_string(),
                "api_key".to_string(),
                "apikey".to_string(),
                "secret".to_string(),
                "token".to_string(),
                "authorization".to_string(),
            ],
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 3600,
            rotation_interval_secs: 24 * 3600,
            report_interval_secs: 6 * 3600,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            tracing: TracingConfig::default(),
            alerts: AlertConfig::default(),
            retention: RetentionConfig::default(),
            privacy: PrivacyConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Configuration writing into `log_dir`, everything else default
    pub fn with_log_dir(log_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.logging.log_dir = log_dir.into();
        config
    }

    /// Load configuration from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse telemetry config: {}", e),
            })?
        } else {
            Self::default()
        };

        config.load_env_overrides();
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&config_file, self.to_toml()?).await?;
        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize telemetry config: {}", e),
        })
    }

    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELFWATCH_LOG_LEVEL") {
            self.logging.level = level.parse().unwrap_or(self.logging.level);
        }

        if let Ok(format) = std::env::var("SHELFWATCH_LOG_FORMAT") {
            self.logging.format = format.parse().unwrap_or(self.logging.format);
        }

        if let Ok(enabled) = std::env::var("SHELFWATCH_FILE_LOGGING") {
            self.logging.file_enabled = enabled.parse().unwrap_or(self.logging.file_enabled);
        }

        if let Ok(dir) = std::env::var("SHELFWATCH_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }

        if let Ok(bytes) = std::env::var("SHELFWATCH_MAX_LOG_BYTES") {
            self.logging.max_file_size_bytes =
                bytes.parse().unwrap_or(self.logging.max_file_size_bytes);
        }

        if let Ok(enabled) = std::env::var("SHELFWATCH_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        if let Ok(days) = std::env::var("SHELFWATCH_RETENTION_DAYS") {
            self.metrics.retention_days = days.parse().unwrap_or(self.metrics.retention_days);
        }

        if let Ok(enabled) = std::env::var("SHELFWATCH_TRACING_ENABLED") {
            self.tracing.enabled = enabled.parse().unwrap_or(self.tracing.enabled);
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "shelfwatch", "shelfwatch").ok_or_else(|| Error::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("telemetry.toml"))
    }

    /// Get default log directory
    fn default_log_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "shelfwatch", "shelfwatch").ok_or_else(|| Error::Config {
                message: "Could not determine log directory".to_string(),
            })?;

        Ok(project_dirs.data_dir().join("logs"))
    }

    /// Get the log file path for a given log level
    pub fn log_file_path(&self, level: LogLevel) -> PathBuf {
        self.logging.log_dir.join(level.file_name())
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logging.log_dir.join("audit.log")
    }

    /// Latency threshold for an operation, falling back to the default
    pub fn threshold_for(&self, operation: &str) -> u64 {
        self.alerts
            .thresholds
            .get(operation)
            .copied()
            .unwrap_or(self.alerts.default_threshold_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate log directory is writable
        if self.logging.file_enabled {
            if !self.logging.log_dir.exists() {
                std::fs::create_dir_all(&self.logging.log_dir)?;
            }

            let write_check = self.logging.log_dir.join(".shelfwatch_write_check");
            std::fs::write(&write_check, "write_check")?;
            std::fs::remove_file(&write_check)?;
        }

        if self.logging.max_file_size_bytes == 0 {
            return Err(Error::Config {
                message: "max_file_size_bytes must be greater than 0".to_string(),
            });
        }

        if self.metrics.sample_window == 0 {
            return Err(Error::Config {
                message: "sample_window must be greater than 0".to_string(),
            });
        }

        if self.metrics.retention_days == 0 {
            return Err(Error::Config {
                message: "retention_days must be greater than 0".to_string(),
            });
        }

        if self.alerts.max_alerts == 0 {
            return Err(Error::Config {
                message: "max_alerts must be greater than 0".to_string(),
            });
        }

        if self.retention.max_archives == 0 {
            return Err(Error::Config {
                message: "max_archives must be greater than 0".to_string(),
            });
        }

        // Validate regex patterns
        for pattern in &self.privacy.redaction_patterns {
            regex::Regex::new(pattern).map_err(|e| Error::Config {
                message: format!("Invalid redaction pattern '{}': {}", pattern, e),
            })?;
        }

        Ok(())
    }
}
