//! Configuration loaded once at start-up from `transcriber.toml`.
//!
//! [`AppConfig`] groups every tunable of the orchestration core. Each section is
//! handed by reference to the constructor that needs it. Values absent from the
//! file fall back to the defaults below. The `TRANSCRIBER_*` environment
//! variables take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::router::{ModelTier, SelectionStrategy};

pub const CONFIG_FILE: &str = "transcriber.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub model_selection: ModelSelectionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub timeouts: TimeoutConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Job creation, dispatch mode and stale sweep knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_file_size_bytes: u64,
    /// Audio at or below this estimated duration is processed synchronously
    /// unless the caller chose a mode.
    pub sync_threshold_seconds: u64,
    /// Caller-visible deadline for synchronous requests.
    pub sync_timeout_secs: u64,
    pub max_processing_time_minutes: u64,
    pub sweep_interval_secs: u64,
    pub callback_base_url: String,
    /// JSONL journal backing the ledger. In-memory only when unset.
    pub journal_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 100 * 1024 * 1024,
            sync_threshold_seconds: 60,
            sync_timeout_secs: 120,
            max_processing_time_minutes: 30,
            sweep_interval_secs: 60,
            callback_base_url: "http://localhost:8080".to_string(),
            journal_path: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_secs(self.max_processing_time_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSelectionConfig {
    pub strategy: SelectionStrategy,
    pub enable_dynamic: bool,
    pub fallback_model: ModelTier,
    /// Time budget the estimate-based branch scales by the preference multiplier.
    pub max_processing_time_minutes: u32,
    /// Language code prefixes that get a one-step tier boost.
    pub complex_languages: Vec<String>,
}

impl Default for ModelSelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::Default,
            enable_dynamic: true,
            fallback_model: ModelTier::Base,
            max_processing_time_minutes: 30,
            complex_languages: ["zh", "ja", "ko", "ar", "th", "hi", "ru"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Circuit breaker thresholds for one dependency.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Percentage (0-100) of failed calls in the window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Percentage (0-100) of slow calls in the window that opens the breaker.
    pub slow_call_rate_threshold: f64,
    pub slow_call_duration_ms: u64,
    pub sliding_window_size: usize,
    pub minimum_number_of_calls: usize,
    pub wait_duration_in_open_state_ms: u64,
    pub permitted_number_of_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_ms: 10_000,
            sliding_window_size: 10,
            minimum_number_of_calls: 5,
            wait_duration_in_open_state_ms: 30_000,
            permitted_number_of_calls_in_half_open_state: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn slow_call_duration(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_ms)
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::Invalid {
                key: "circuit_breaker.sliding_window_size",
                message: "must be at least 1".into(),
            });
        }
        if self.minimum_number_of_calls > self.sliding_window_size {
            return Err(ConfigError::Invalid {
                key: "circuit_breaker.minimum_number_of_calls",
                message: format!(
                    "{} exceeds sliding_window_size {}",
                    self.minimum_number_of_calls, self.sliding_window_size
                ),
            });
        }
        for (key, value) in [
            ("circuit_breaker.failure_rate_threshold", self.failure_rate_threshold),
            ("circuit_breaker.slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) || value == 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("{value} is not a percentage in (0, 100]"),
                });
            }
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::Invalid {
                key: "circuit_breaker.permitted_number_of_calls_in_half_open_state",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Deadlines applied by the resilient invoker, independent of the breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on a synchronous transcription call at the transport level.
    pub transport_ms: u64,
    /// Bound on an asynchronous dispatch waiting for its acknowledgement.
    pub async_ack_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transport_ms: 120_000,
            async_ack_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn transport(&self) -> Duration {
        Duration::from_millis(self.transport_ms)
    }

    pub fn async_ack(&self) -> Duration {
        Duration::from_millis(self.async_ack_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Dependency name; keys the circuit breaker and its audit events.
    pub name: String,
    pub base_url: String,
    pub connect_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "transcription-worker".to_string(),
            base_url: "http://localhost:8081".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("uploads"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Loads `transcriber.toml` from the working directory, or defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    // Environment wins over the file.
    fn apply_env(&mut self) {
        if let Some(url) = non_empty_env("TRANSCRIBER_WORKER_URL") {
            self.worker.base_url = url;
        }
        if let Some(url) = non_empty_env("TRANSCRIBER_CALLBACK_URL") {
            self.orchestrator.callback_base_url = url;
        }
        if let Some(path) = non_empty_env("TRANSCRIBER_JOURNAL") {
            self.orchestrator.journal_path = Some(PathBuf::from(path));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        if self.orchestrator.max_file_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "orchestrator.max_file_size_bytes",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const ENV_KEYS: [&str; 3] = [
        "TRANSCRIBER_WORKER_URL",
        "TRANSCRIBER_CALLBACK_URL",
        "TRANSCRIBER_JOURNAL",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.circuit_breaker.failure_rate_threshold, 50.0);
        assert_eq!(config.circuit_breaker.sliding_window_size, 10);
        assert_eq!(config.circuit_breaker.minimum_number_of_calls, 5);
        assert_eq!(config.circuit_breaker.permitted_number_of_calls_in_half_open_state, 3);
        assert_eq!(
            config.circuit_breaker.wait_duration_in_open_state(),
            Duration::from_secs(30)
        );
        assert_eq!(config.timeouts.transport(), Duration::from_secs(120));
        assert_eq!(config.orchestrator.max_processing_time(), Duration::from_secs(1800));
        assert_eq!(config.model_selection.fallback_model, ModelTier::Base);
        assert!(config.orchestrator.journal_path.is_none());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [orchestrator]
            sync_timeout_secs = 30
            journal_path = "/tmp/ledger.jsonl"

            [circuit_breaker]
            sliding_window_size = 20

            [model_selection]
            strategy = "performance"
            fallback_model = "small"
        "#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.orchestrator.sync_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.orchestrator.journal_path.as_deref(),
            Some(Path::new("/tmp/ledger.jsonl"))
        );
        assert_eq!(config.circuit_breaker.sliding_window_size, 20);
        assert_eq!(config.circuit_breaker.minimum_number_of_calls, 5);
        assert_eq!(config.model_selection.strategy, SelectionStrategy::Performance);
        assert_eq!(config.model_selection.fallback_model, ModelTier::Small);
        assert_eq!(config.worker.name, "transcription-worker");
    }

    #[test]
    fn rejects_minimum_calls_above_window() {
        let toml_str = r#"
            [circuit_breaker]
            sliding_window_size = 4
            minimum_number_of_calls = 5
        "#;
        let err = AppConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "circuit_breaker.minimum_number_of_calls", .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let toml_str = r#"
            [circuit_breaker]
            failure_rate_threshold = 150.0
        "#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    #[serial]
    fn load_from_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.orchestrator.sync_threshold_seconds, 60);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[worker]\nbase_url = \"http://file-worker:1\"\n\n\
             [orchestrator]\ncallback_base_url = \"http://file-api:2\"\n",
        )
        .unwrap();

        unsafe {
            std::env::set_var("TRANSCRIBER_WORKER_URL", "http://env-worker:9000");
            std::env::set_var("TRANSCRIBER_CALLBACK_URL", "http://env-api:8080");
            std::env::set_var("TRANSCRIBER_JOURNAL", "/var/lib/orchestrator/ledger.jsonl");
        }
        let config = AppConfig::load_from(&path);
        clear_env();
        let config = config.unwrap();
        assert_eq!(config.worker.base_url, "http://env-worker:9000");
        assert_eq!(config.orchestrator.callback_base_url, "http://env-api:8080");
        assert_eq!(
            config.orchestrator.journal_path.as_deref(),
            Some(Path::new("/var/lib/orchestrator/ledger.jsonl"))
        );

        // Empty values do not override.
        unsafe { std::env::set_var("TRANSCRIBER_WORKER_URL", "") };
        let config = AppConfig::load_from(&path);
        clear_env();
        let config = config.unwrap();
        assert_eq!(config.worker.base_url, "http://file-worker:1");
        assert_eq!(config.orchestrator.callback_base_url, "http://file-api:2");
        assert!(config.orchestrator.journal_path.is_none());
    }

    #[test]
    #[serial]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[orchestrator]\nmax_processing_time_minutes = 5\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.orchestrator.max_processing_time(), Duration::from_secs(300));
    }
}
