use crate::comms::retry::{BackoffStrategy, RetryPolicy};
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "SWARMLINK_CONFIG_DIR";

// ── Top-level config ─────────────────────────────────────────────

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path of the file this config was loaded from. Computed, never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Communication layer settings (`[comms]`).
    #[serde(default)]
    pub comms: CommsConfig,

    /// Delivery trace settings (`[observability]`).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE_NAME),
            comms: CommsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

// ── Comms ────────────────────────────────────────────────────────

/// How deliveries reach recipients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// Push: subscribed handlers are invoked as messages arrive.
    #[default]
    EventDriven,
    /// Pull: deliveries land in per-agent inboxes drained with `poll_messages`.
    Polling,
}

impl DeliveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventDriven => "event_driven",
            Self::Polling => "polling",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "event_driven" | "push" => Some(Self::EventDriven),
            "polling" | "pull" => Some(Self::Polling),
            _ => None,
        }
    }
}

/// Message broker configuration (`[comms]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommsConfig {
    /// Delivery strategy: "event_driven" (push) or "polling" (pull).
    #[serde(default)]
    pub strategy: DeliveryStrategy,

    /// Track acknowledgments and retain admitted messages.
    #[serde(default = "default_true")]
    pub enable_persistence: bool,

    /// Redeliver unacknowledged or faulted deliveries. Requires persistence.
    #[serde(default = "default_true")]
    pub enable_reliability: bool,

    /// Deliver sequentially per (recipient, channel/queue/direct) lane.
    #[serde(default = "default_true")]
    pub enable_ordering: bool,

    /// Topic channels deliver only to participants subscribed to the message type.
    #[serde(default = "default_true")]
    pub enable_filtering: bool,

    /// Maximum serialized payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Default queue capacity; also caps each agent inbox.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long admitted messages stay readable through `get_message`.
    #[serde(default = "default_message_retention_ms")]
    pub message_retention_ms: u64,

    /// Deadline for acknowledging a delivery before it is retried.
    #[serde(default = "default_acknowledgment_timeout_ms")]
    pub acknowledgment_timeout_ms: u64,

    /// Redeliveries allowed after the first attempt.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Growth factor for exponential backoff. Must be >= 1.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Dead-letter entries kept before the oldest are dropped.
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,

    /// Buffer of the delivery event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long `shutdown` waits for in-flight deliveries.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            strategy: DeliveryStrategy::default(),
            enable_persistence: true,
            enable_reliability: true,
            enable_ordering: true,
            enable_filtering: true,
            max_message_size: default_max_message_size(),
            max_queue_size: default_max_queue_size(),
            message_retention_ms: default_message_retention_ms(),
            acknowledgment_timeout_ms: default_acknowledgment_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            backoff_strategy: BackoffStrategy::default(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            metrics_enabled: true,
            max_dead_letters: default_max_dead_letters(),
            event_capacity: default_event_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl CommsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            strategy: self.backoff_strategy,
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    pub fn acknowledgment_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledgment_timeout_ms)
    }

    pub fn message_retention(&self) -> Duration {
        Duration::from_millis(self.message_retention_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Retries only run when deliveries are tracked.
    pub fn retries_enabled(&self) -> bool {
        self.enable_persistence && self.enable_reliability
    }

    fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            anyhow::bail!("comms.max_message_size must be greater than 0");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("comms.max_queue_size must be greater than 0");
        }
        if self.acknowledgment_timeout_ms == 0 {
            anyhow::bail!("comms.acknowledgment_timeout_ms must be greater than 0");
        }
        if self.message_retention_ms == 0 {
            anyhow::bail!("comms.message_retention_ms must be greater than 0");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "comms.backoff_multiplier must be a finite number >= 1.0 (got {})",
                self.backoff_multiplier
            );
        }
        if self.retry_base_delay_ms > self.max_retry_delay_ms {
            anyhow::bail!(
                "comms.retry_base_delay_ms ({}) must not exceed comms.max_retry_delay_ms ({})",
                self.retry_base_delay_ms,
                self.max_retry_delay_ms
            );
        }
        if self.max_dead_letters == 0 {
            anyhow::bail!("comms.max_dead_letters must be greater than 0");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("comms.event_capacity must be greater than 0");
        }
        if self.enable_reliability && !self.enable_persistence {
            tracing::warn!(
                "comms.enable_reliability has no effect while comms.enable_persistence is false"
            );
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    1_048_576
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_message_retention_ms() -> u64 {
    86_400_000
}

fn default_acknowledgment_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_max_dead_letters() -> usize {
    256
}

fn default_event_capacity() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

// ── Observability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// Delivery trace storage mode: "none" | "rolling" | "full".
    #[serde(default = "default_delivery_trace_mode")]
    pub delivery_trace_mode: String,

    /// Delivery trace file path. Relative paths are resolved under the config directory.
    #[serde(default = "default_delivery_trace_path")]
    pub delivery_trace_path: String,

    /// Maximum entries retained when delivery_trace_mode = "rolling".
    #[serde(default = "default_delivery_trace_max_entries")]
    pub delivery_trace_max_entries: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            delivery_trace_mode: default_delivery_trace_mode(),
            delivery_trace_path: default_delivery_trace_path(),
            delivery_trace_max_entries: default_delivery_trace_max_entries(),
        }
    }
}

fn default_delivery_trace_mode() -> String {
    "none".to_string()
}

fn default_delivery_trace_path() -> String {
    "state/delivery-trace.jsonl".to_string()
}

fn default_delivery_trace_max_entries() -> usize {
    200
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".swarmlink"))
}

/// `SWARMLINK_CONFIG_DIR` when set, otherwise `~/.swarmlink`.
pub fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
        _ => default_config_dir(),
    }
}

impl Config {
    /// Load `config.toml` from the resolved config directory, writing the
    /// defaults on first run.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        Self::load_or_init_in(&config_dir).await
    }

    pub async fn load_or_init_in(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        fs::create_dir_all(config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            strategy = config.comms.strategy.as_str(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Directory holding `config.toml`; relative trace paths resolve here.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        self.comms.validate()?;

        let mode = self.observability.delivery_trace_mode.trim();
        if !matches!(mode, "none" | "rolling" | "full") {
            anyhow::bail!(
                "observability.delivery_trace_mode must be one of none, rolling, full (got {mode:?})"
            );
        }
        if mode != "none" && self.observability.delivery_trace_path.trim().is_empty() {
            anyhow::bail!("observability.delivery_trace_path must not be empty");
        }
        if mode == "rolling" && self.observability.delivery_trace_max_entries == 0 {
            anyhow::bail!("observability.delivery_trace_max_entries must be greater than 0");
        }
        Ok(())
    }

    /// Apply `SWARMLINK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("SWARMLINK_STRATEGY") {
            match DeliveryStrategy::parse(&raw) {
                Some(strategy) => self.comms.strategy = strategy,
                None => tracing::warn!(
                    value = %raw,
                    "Ignoring invalid SWARMLINK_STRATEGY (valid: event_driven|polling)"
                ),
            }
        }

        override_parsed("SWARMLINK_MAX_MESSAGE_SIZE", &mut self.comms.max_message_size);
        override_parsed("SWARMLINK_MAX_QUEUE_SIZE", &mut self.comms.max_queue_size);
        override_parsed(
            "SWARMLINK_ACK_TIMEOUT_MS",
            &mut self.comms.acknowledgment_timeout_ms,
        );
        override_parsed("SWARMLINK_RETRY_ATTEMPTS", &mut self.comms.retry_attempts);
        override_bool("SWARMLINK_PERSISTENCE", &mut self.comms.enable_persistence);
        override_bool("SWARMLINK_RELIABILITY", &mut self.comms.enable_reliability);
        override_bool("SWARMLINK_ORDERING", &mut self.comms.enable_ordering);
        override_bool("SWARMLINK_METRICS", &mut self.comms.metrics_enabled);

        if let Ok(mode) = std::env::var("SWARMLINK_DELIVERY_TRACE_MODE") {
            if !mode.trim().is_empty() {
                self.observability.delivery_trace_mode = mode.trim().to_ascii_lowercase();
            }
        }
    }

    /// Write the config atomically: temp file, then rename over the target.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config file")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(error) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error).with_context(|| {
                format!(
                    "Failed to replace config file: {}",
                    self.config_path.display()
                )
            });
        }
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(name: &str, target: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "Ignoring unparsable override"),
    }
}

fn override_bool(name: &str, target: &mut bool) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        _ => tracing::warn!(variable = name, value = %raw, "Ignoring non-boolean override"),
    }
}
