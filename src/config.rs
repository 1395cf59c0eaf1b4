//! Configuration loader and validator for the lifecycle mailer.
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

impl App {
    /// `DATABASE_URL` wins over the file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/mailer.db", self.data_dir.trim_end_matches('/')))
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_interval_secs: u64,
    /// Maximum campaign jobs claimed per cycle.
    pub batch_size: u32,
    /// How long a claim protects a job from other workers.
    pub claim_ttl_secs: u64,
    /// Maximum outbox notifications drained per cycle.
    pub outbox_batch_size: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            batch_size: 25,
            claim_ttl_secs: 900,
            outbox_batch_size: 50,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::seconds(self.claim_ttl_secs as i64)
    }
}

/// Automatic re-attempts of failed dispatches. A job becomes `failed` once it
/// has failed `max_attempts` times; `0` fails it on the first error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 300,
            max_backoff_secs: 6 * 3600,
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has now failed `failures` times gets another try.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Exponential backoff: base * 2^attempt, capped at `max_backoff_secs`
    /// (no cap when zero).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = (self.base_delay_secs as i64).saturating_mul(1_i64 << attempt.min(20));
        let secs = if self.max_backoff_secs == 0 {
            secs
        } else {
            secs.min(self.max_backoff_secs as i64)
        };
        Duration::seconds(secs)
    }
}

/// Email API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub endpoint: String,
    pub api_key: String,
    pub from: String,
    /// Log messages instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.worker.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("worker.poll_interval_secs must be > 0"));
    }
    if cfg.worker.batch_size == 0 {
        return Err(ConfigError::Invalid("worker.batch_size must be > 0"));
    }
    if cfg.worker.outbox_batch_size == 0 {
        return Err(ConfigError::Invalid("worker.outbox_batch_size must be > 0"));
    }
    if cfg.worker.claim_ttl_secs == 0 {
        return Err(ConfigError::Invalid("worker.claim_ttl_secs must be > 0"));
    }
    if cfg.retry.max_attempts > 0 && cfg.retry.base_delay_secs == 0 {
        return Err(ConfigError::Invalid(
            "retry.base_delay_secs must be > 0 when retries are enabled",
        ));
    }
    if cfg.transport.from.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.from must be non-empty"));
    }
    if !cfg.transport.dry_run {
        if cfg.transport.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("transport.endpoint must be non-empty"));
        }
        if cfg.transport.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("transport.api_key must be non-empty"));
        }
    }
    Ok(())
}

/// Example configuration with every option spelled out.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

worker:
  poll_interval_secs: 300
  batch_size: 25
  claim_ttl_secs: 900
  outbox_batch_size: 50

# Failed sends are rescheduled with exponential backoff up to max_attempts.
# Set max_attempts: 0 to mark a job failed on its first error instead.
retry:
  max_attempts: 5
  base_delay_secs: 300
  max_backoff_secs: 21600

transport:
  endpoint: "https://api.mail.example.com/v1/send"
  api_key: "YOUR_EMAIL_API_KEY"
  from: "Coach <coach@example.com>"
  dry_run: false
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.worker, WorkerSettings::default());
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn optional_sections_use_defaults() {
        let yaml = r#"app:
  data_dir: "./data"
transport:
  endpoint: ""
  api_key: ""
  from: "noreply@example.com"
  dry_run: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.worker.batch_size, 25);
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn invalid_worker_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.poll_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_secs")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn live_transport_needs_credentials() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transport.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("api_key")),
            _ => panic!("wrong error"),
        }
        cfg.transport.dry_run = true;
        validate(&cfg).unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_secs: 60,
            max_backoff_secs: 300,
        };
        assert_eq!(policy.backoff(0), Duration::seconds(60));
        assert_eq!(policy.backoff(1), Duration::seconds(120));
        assert_eq!(policy.backoff(2), Duration::seconds(240));
        assert_eq!(policy.backoff(3), Duration::seconds(300));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        let never = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!never.should_retry(1));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.transport.from, "Coach <coach@example.com>");
    }

    #[test]
    fn retries_can_be_switched_off() {
        assert!(example().contains("max_attempts: 0"));
        let yaml = example().replace("  max_attempts: 5", "  max_attempts: 0");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        validate(&cfg).unwrap();
        assert!(!cfg.retry.should_retry(1));
        assert!(RetryPolicy::default().should_retry(1));
    }
}
