//! Runtime configuration.
//!
//! Sources, later ones win:
//! 1. built-in defaults;
//! 2. `config/conveyor.toml` (or the path given to `load`);
//! 3. environment variables `CONVEYOR__<SECTION>__<KEY>`, e.g.
//!    `CONVEYOR__DISPATCHER__BATCH_SIZE=50`.

use std::collections::BTreeMap;
use std::time::Duration;

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::app::{DispatcherSettings, OutboxPublishPolicy, WorkerSettings};
use crate::policy::{OutboxBackoff, PolicyConfig, PolicyError, RetryPolicyTable};

pub const DEFAULT_CONFIG_PATH: &str = "config/conveyor";

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub stale_lock_secs: u64,
    pub poll_interval_ms: u64,
    pub store_timeout_ms: u64,
    pub queue_timeout_ms: u64,
}

impl DispatcherConfig {
    pub fn settings(&self, publish: &OutboxPublishConfig) -> DispatcherSettings {
        DispatcherSettings {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            backoff: OutboxBackoff {
                base: Duration::from_secs(self.base_delay_secs),
                max: Duration::from_secs(self.max_delay_secs),
            },
            stale_lock: Duration::from_secs(self.stale_lock_secs),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            publish: publish.policy(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry options attached to messages published from the outbox.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxPublishConfig {
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: bool,
}

impl OutboxPublishConfig {
    pub fn policy(&self) -> OutboxPublishPolicy {
        OutboxPublishPolicy {
            retry_limit: self.retry_limit,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            retry_backoff: self.retry_backoff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub handler_timeout_secs: u64,
    pub queue_timeout_ms: u64,
    pub lease_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.concurrency,
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
        }
    }

    /// How long a fetched message stays invisible. Never shorter than the handler timeout.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs.max(self.handler_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. Unset means the in-memory store.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,conveyor_core=debug`.
    pub filter: String,
    pub json: bool,
}

/// A recurring run: `queue` is seeded with `payload` on every `cron` fire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub queue: String,
    pub cron: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConveyorConfig {
    pub dispatcher: DispatcherConfig,
    pub outbox_publish: OutboxPublishConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// Job type -> retry policy.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl ConveyorConfig {
    /// Load defaults, then the config file, then the environment.
    ///
    /// Without `path` the default file is optional; an explicit path must exist.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };
        defaults()?
            .add_source(file)
            .add_source(
                Environment::with_prefix("CONVEYOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        self.dispatcher.settings(&self.outbox_publish)
    }

    pub fn policy_table(&self) -> Result<RetryPolicyTable, PolicyError> {
        RetryPolicyTable::from_config(&self.policies)
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("dispatcher.batch_size", 20_i64)?
        .set_default("dispatcher.max_attempts", 5_i64)?
        .set_default("dispatcher.base_delay_secs", 5_i64)?
        .set_default("dispatcher.max_delay_secs", 60_i64)?
        .set_default("dispatcher.stale_lock_secs", 300_i64)?
        .set_default("dispatcher.poll_interval_ms", 1000_i64)?
        .set_default("dispatcher.store_timeout_ms", 10_000_i64)?
        .set_default("dispatcher.queue_timeout_ms", 10_000_i64)?
        .set_default("outbox_publish.retry_limit", 3_i64)?
        .set_default("outbox_publish.retry_delay_secs", 5_i64)?
        .set_default("outbox_publish.retry_backoff", true)?
        .set_default("worker.concurrency", 2_i64)?
        .set_default("worker.batch_size", 5_i64)?
        .set_default("worker.poll_interval_ms", 500_i64)?
        .set_default("worker.handler_timeout_secs", 60_i64)?
        .set_default("worker.queue_timeout_ms", 10_000_i64)?
        .set_default("worker.lease_timeout_secs", 300_i64)?
        .set_default("database.max_connections", 5_i64)?
        .set_default("logging.filter", "info")?
        .set_default("logging.json", false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobType;

    #[test]
    fn defaults_match_dispatcher_and_worker_defaults() {
        let config = ConveyorConfig::from_toml("").unwrap();

        let dispatcher = config.dispatcher_settings();
        let expected = DispatcherSettings::default();
        assert_eq!(dispatcher.batch_size, expected.batch_size);
        assert_eq!(dispatcher.max_attempts, expected.max_attempts);
        assert_eq!(dispatcher.backoff, expected.backoff);
        assert_eq!(dispatcher.stale_lock, expected.stale_lock);
        assert_eq!(dispatcher.publish, expected.publish);
        assert_eq!(config.dispatcher.poll_interval(), Duration::from_secs(1));

        let worker = config.worker.settings();
        assert_eq!(worker.concurrency, WorkerSettings::default().concurrency);
        assert_eq!(worker.handler_timeout, WorkerSettings::default().handler_timeout);
        assert_eq!(config.worker.lease_timeout(), Duration::from_secs(300));

        assert_eq!(config.database.url, None);
        assert_eq!(config.logging.filter, "info");
        assert!(config.policies.is_empty());
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn file_overrides_defaults_and_carries_policies_and_schedules() {
        let config = ConveyorConfig::from_toml(
            r#"
            [dispatcher]
            batch_size = 50
            max_attempts = 7

            [logging]
            json = true

            [policies."enrichment.run"]
            retry_limit = 4
            retry_delay_secs = 60
            retry_backoff = true
            dead_letter = "enrichment.run.dlq"

            [[schedules]]
            name = "daily-discovery"
            queue = "lead.discover"
            cron = "0 9 * * *"
            payload = { region = "emea", limit = 50 }
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.batch_size, 50);
        assert_eq!(config.dispatcher.max_attempts, 7);
        assert_eq!(config.dispatcher.stale_lock_secs, 300);
        assert!(config.logging.json);

        let table = config.policy_table().unwrap();
        let policy = table.get(&JobType::parse("enrichment.run").unwrap()).unwrap();
        assert_eq!(policy.retry_limit, 4);
        assert_eq!(policy.retry_delay, Duration::from_secs(60));
        assert_eq!(policy.dead_letter.as_str(), "enrichment.run.dlq");

        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].cron, "0 9 * * *");
        assert_eq!(config.schedules[0].payload["region"], serde_json::json!("emea"));
    }

    #[test]
    fn incomplete_policy_is_reported_by_field() {
        let config = ConveyorConfig::from_toml(
            r#"
            [policies."score.compute"]
            retry_limit = 2
            retry_backoff = false
            dead_letter = "score.compute.dlq"
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.policy_table(),
            Err(PolicyError::MissingField { field: "retry_delay_secs", .. })
        ));
    }

    #[test]
    fn lease_timeout_never_undercuts_handler_timeout() {
        let config = ConveyorConfig::from_toml(
            r#"
            [worker]
            handler_timeout_secs = 600
            lease_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.lease_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(ConveyorConfig::load(Some("does/not/exist/conveyor")).is_err());
    }
}
