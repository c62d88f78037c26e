use crate::broker::{InMemoryBrokerOptions, UNLIMITED_RECONSUME_TIMES};
use crate::protocol::CommandKind;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level courier configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` flag → `~/.courier/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Group name of this process. Names the producer, the private response
    /// topic and every consumer group. Overridden by `COURIER_GROUP_NAME`.
    #[serde(default = "default_group_name")]
    pub group_name: String,
    /// Broker name server address. Overridden by `COURIER_NAME_SERVER`.
    #[serde(default = "default_name_server")]
    pub name_server: Option<String>,
    /// Timeout used by `invoke` when the caller passes none.
    /// Overridden by `COURIER_INVOKE_TIMEOUT_MS`.
    #[serde(default = "default_invoke_timeout_ms")]
    pub default_invoke_timeout_ms: u64,
    /// Queue count for topics created at client startup.
    #[serde(default = "default_topic_queue_count")]
    pub topic_queue_count: usize,
    /// Worker count of the private response consumer.
    #[serde(default = "default_response_threads")]
    pub response_threads: usize,

    #[serde(default)]
    pub invoke: ConsumerConfig,
    #[serde(default)]
    pub notice: ConsumerConfig,
    #[serde(default)]
    pub delayed_notice: ConsumerConfig,
    #[serde(default)]
    pub ordered_notice: ConsumerConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_group_name() -> String {
    "courier".into()
}

#[allow(clippy::unnecessary_wraps)]
fn default_name_server() -> Option<String> {
    Some("127.0.0.1:9876".into())
}

fn default_invoke_timeout_ms() -> u64 {
    30_000
}

fn default_topic_queue_count() -> usize {
    4
}

fn default_response_threads() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            group_name: default_group_name(),
            name_server: default_name_server(),
            default_invoke_timeout_ms: default_invoke_timeout_ms(),
            topic_queue_count: default_topic_queue_count(),
            response_threads: default_response_threads(),
            invoke: ConsumerConfig::default(),
            notice: ConsumerConfig::default(),
            delayed_notice: ConsumerConfig::default(),
            ordered_notice: ConsumerConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

// ── Consumer groups ───────────────────────────────────────────────

/// Per-kind consumer group tuning. Unset fields fall back to the kind's
/// defaults (see [`Config::consumer`]).
///
/// ```toml
/// [ordered_notice]
/// threads = 8
/// begin_executable_time = "2026-01-01T00:00:00Z"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsumerConfig {
    /// Start this consumer group at all.
    #[serde(default = "default_executable")]
    pub executable: bool,
    /// Worker count. Default: invoke 10, notice 15, delayed notice 15, ordered notice 5.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Redelivery limit. Default: invoke 0, notice kinds unlimited.
    #[serde(default)]
    pub max_reconsume_times: Option<u32>,
    /// Longest a single delivery may take before it counts as failed.
    #[serde(default = "default_consume_timeout_ms")]
    pub consume_timeout_ms: u64,
    /// Skip messages submitted before this instant.
    #[serde(default)]
    pub begin_executable_time: Option<DateTime<Utc>>,
}

fn default_executable() -> bool {
    true
}

fn default_consume_timeout_ms() -> u64 {
    15 * 60 * 1000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            threads: None,
            max_reconsume_times: None,
            consume_timeout_ms: default_consume_timeout_ms(),
            begin_executable_time: None,
        }
    }
}

/// Resolved consumer group settings for one command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub executable: bool,
    pub threads: usize,
    pub max_reconsume_times: u32,
    pub consume_timeout: Duration,
    /// Epoch millis; messages born earlier are skipped.
    pub begin_executable_time: Option<i64>,
}

impl ConsumerSettings {
    pub fn defaults_for(kind: CommandKind) -> Self {
        ConsumerConfig::default().resolve(kind)
    }
}

impl ConsumerConfig {
    pub fn resolve(&self, kind: CommandKind) -> ConsumerSettings {
        let (threads, max_reconsume_times) = match kind {
            CommandKind::Invoke => (10, 0),
            CommandKind::Notice | CommandKind::DelayedNotice => (15, UNLIMITED_RECONSUME_TIMES),
            CommandKind::OrderedNotice => (5, UNLIMITED_RECONSUME_TIMES),
        };
        ConsumerSettings {
            executable: self.executable,
            threads: self.threads.unwrap_or(threads),
            max_reconsume_times: self.max_reconsume_times.unwrap_or(max_reconsume_times),
            consume_timeout: Duration::from_millis(self.consume_timeout_ms),
            begin_executable_time: self.begin_executable_time.map(|at| at.timestamp_millis()),
        }
    }
}

// ── In-memory broker ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Queues per auto-created topic.
    #[serde(default = "default_broker_queue_count")]
    pub queue_count: usize,
    /// Redelivery `n` waits `n` times this long.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Create unknown topics on first use instead of failing with "no route info".
    #[serde(default = "default_auto_create_topics")]
    pub auto_create_topics: bool,
    /// Dead letters retained for inspection.
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,
}

fn default_broker_queue_count() -> usize {
    4
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_auto_create_topics() -> bool {
    true
}

fn default_max_dead_letters() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_count: default_broker_queue_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            auto_create_topics: default_auto_create_topics(),
            max_dead_letters: default_max_dead_letters(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".courier"))
}

impl Config {
    /// Load `~/.courier/config.toml`, writing defaults first if it is missing.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = default_config_dir()?;
        fs::create_dir_all(&config_dir)
            .await
            .with_context(|| {
                format!("Failed to create config directory {}", config_dir.display())
            })?;
        let config_path = config_dir.join("config.toml");

        if !config_path.exists() {
            let mut config = Self {
                config_path: config_path.clone(),
                ..Self::default()
            };
            config.save().await?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(path = %config_path.display(), "Config initialized with defaults");
            return Ok(config);
        }

        Self::load_from(&config_path).await
    }

    /// Load an explicit config file. Missing sections take their defaults.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(path = %path.display(), group = %config.group_name, "Config loaded");
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let contents = self.to_toml()?;
        fs::write(&self.config_path, contents)
            .await
            .with_context(|| format!("Failed to write config file {}", self.config_path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        // Identity
        let group = self.group_name.trim();
        if group.is_empty() {
            anyhow::bail!("group_name must not be empty");
        }
        if !group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$' | '%' | '|'))
        {
            anyhow::bail!(
                "group_name contains unsupported characters ({group}); expected [A-Za-z0-9_.$%|-]"
            );
        }
        if self.default_invoke_timeout_ms == 0 {
            anyhow::bail!("default_invoke_timeout_ms must be greater than 0");
        }
        if self.topic_queue_count == 0 {
            anyhow::bail!("topic_queue_count must be greater than 0");
        }
        if self.response_threads == 0 {
            anyhow::bail!("response_threads must be greater than 0");
        }

        // Consumer groups
        for kind in CommandKind::ALL {
            let section = self.consumer_section(kind);
            if section.threads == Some(0) {
                anyhow::bail!("{kind}.threads must be greater than 0");
            }
            if section.consume_timeout_ms == 0 {
                anyhow::bail!("{kind}.consume_timeout_ms must be greater than 0");
            }
        }

        // Broker
        if self.broker.queue_count == 0 {
            anyhow::bail!("broker.queue_count must be greater than 0");
        }

        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(group) = std::env::var("COURIER_GROUP_NAME") {
            if !group.trim().is_empty() {
                self.group_name = group.trim().to_string();
            }
        }
        if let Ok(address) = std::env::var("COURIER_NAME_SERVER") {
            if !address.trim().is_empty() {
                self.name_server = Some(address.trim().to_string());
            }
        }
        if let Ok(timeout) = std::env::var("COURIER_INVOKE_TIMEOUT_MS") {
            match timeout.trim().parse::<u64>() {
                Ok(timeout) if timeout > 0 => self.default_invoke_timeout_ms = timeout,
                _ => tracing::warn!(
                    value = %timeout,
                    "Ignoring invalid COURIER_INVOKE_TIMEOUT_MS"
                ),
            }
        }
    }

    fn consumer_section(&self, kind: CommandKind) -> &ConsumerConfig {
        match kind {
            CommandKind::Invoke => &self.invoke,
            CommandKind::Notice => &self.notice,
            CommandKind::DelayedNotice => &self.delayed_notice,
            CommandKind::OrderedNotice => &self.ordered_notice,
        }
    }

    /// Resolved settings for the consumer group of `kind`.
    pub fn consumer(&self, kind: CommandKind) -> ConsumerSettings {
        self.consumer_section(kind).resolve(kind)
    }

    pub fn default_invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.default_invoke_timeout_ms)
    }

    pub fn broker_options(&self) -> InMemoryBrokerOptions {
        InMemoryBrokerOptions {
            name_server: self.name_server.clone(),
            default_queue_count: self.broker.queue_count,
            retry_backoff: Duration::from_millis(self.broker.retry_backoff_ms),
            auto_create_topics: self.broker.auto_create_topics,
            max_dead_letters: self.broker.max_dead_letters,
        }
    }
}
