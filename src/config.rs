//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::agents::BuiltinAgent;
use crate::error::ConfigError;
use crate::task::RetryPolicy;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// HTTP API port.
    pub port: u16,
    /// Directory for rolling log files (None disables file logging).
    pub log_dir: Option<PathBuf>,
    pub dispatcher: DispatcherConfig,
    /// How long a stored result stays retrievable.
    pub result_ttl: Duration,
    /// Active tasks without a heartbeat for this long are considered interrupted.
    pub liveness_timeout: Duration,
    /// Interval of the maintenance sweep (recovery, result purge, pruning).
    pub sweep_interval: Duration,
    /// Terminal task records older than this are pruned.
    pub task_retention: Duration,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker routines.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Upper bound on how long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
    /// How often an executing worker refreshes its task's heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Periodic maintenance sweep configuration.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub liveness_timeout: Duration,
    pub task_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/orchestrator.db"),
            port: 8080,
            log_dir: Some(PathBuf::from("./logs")),
            dispatcher: DispatcherConfig::default(),
            result_ttl: Duration::from_secs(3600), // 1 hour
            liveness_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            task_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: self.sweep_interval,
            liveness_timeout: self.liveness_timeout,
            task_retention: self.task_retention,
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("MCP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let log_dir = match lookup("MCP_LOG_DIR") {
            Some(dir) if dir.is_empty() || dir == "none" => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => defaults.log_dir,
        };

        let workers = nonzero(
            "MCP_WORKERS",
            parse_or(&lookup, "MCP_WORKERS", defaults.dispatcher.workers)?,
        )?;
        let poll_interval = nonzero(
            "MCP_POLL_INTERVAL_MS",
            Duration::from_millis(parse_or(
                &lookup,
                "MCP_POLL_INTERVAL_MS",
                defaults.dispatcher.poll_interval.as_millis() as u64,
            )?),
        )?;
        let heartbeat_interval = nonzero_secs(
            &lookup,
            "MCP_HEARTBEAT_SECS",
            defaults.dispatcher.heartbeat_interval,
        )?;
        let liveness_timeout =
            nonzero_secs(&lookup, "MCP_LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout)?;
        if heartbeat_interval >= liveness_timeout {
            return Err(ConfigError::InvalidValue {
                key: "MCP_HEARTBEAT_SECS".into(),
                message: format!(
                    "heartbeat every {}s must be shorter than the {}s liveness timeout",
                    heartbeat_interval.as_secs(),
                    liveness_timeout.as_secs()
                ),
            });
        }

        let retry = RetryPolicy::new(
            parse_or(&lookup, "MCP_MAX_ATTEMPTS", defaults.dispatcher.retry.max_attempts)?,
            Duration::from_millis(parse_or(
                &lookup,
                "MCP_BACKOFF_BASE_MS",
                defaults.dispatcher.retry.base_delay.as_millis() as u64,
            )?),
        );

        Ok(Self {
            db_path,
            port: parse_or(&lookup, "ORCHESTRATOR_PORT", defaults.port)?,
            log_dir,
            dispatcher: DispatcherConfig {
                workers,
                retry,
                poll_interval,
                heartbeat_interval,
            },
            result_ttl: nonzero_secs(&lookup, "MCP_RESULT_TTL_SECS", defaults.result_ttl)?,
            liveness_timeout,
            sweep_interval: nonzero_secs(&lookup, "MCP_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            task_retention: Duration::from_secs(
                parse_or(&lookup, "MCP_TASK_RETENTION_DAYS", 7u64)? * 24 * 3600,
            ),
        })
    }
}

/// Per-agent settings, read from `<PREFIX>_*` variables.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub enabled: bool,
    pub max_concurrent: usize,
    /// Remote endpoint; the agent runs locally when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: 2,
            endpoint: None,
            api_key: None,
        }
    }
}

impl AgentSettings {
    pub fn from_env(agent: BuiltinAgent) -> Result<Self, ConfigError> {
        Self::from_lookup(agent, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        agent: BuiltinAgent,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let prefix = agent.env_prefix();
        let defaults = Self::default();
        let non_empty = |key: String| lookup(&key).filter(|v| !v.trim().is_empty());
        let max_concurrent_key = format!("{prefix}_MAX_CONCURRENT");

        Ok(Self {
            enabled: non_empty(format!("{prefix}_ENABLED"))
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(defaults.enabled),
            max_concurrent: nonzero(
                &max_concurrent_key,
                parse_or(&lookup, &max_concurrent_key, defaults.max_concurrent)?,
            )?,
            endpoint: non_empty(format!("{prefix}_URL")),
            api_key: non_empty(format!("{prefix}_API_KEY")).map(SecretString::from),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn nonzero_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let value = parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)?;
    nonzero(key, value)
}

/// Reject the zero value of a count or period.
fn nonzero<T: Default + PartialEq>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.dispatcher.retry, RetryPolicy::default());
        assert_eq!(config.result_ttl, Duration::from_secs(3600));
        assert_eq!(config.task_retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn overrides_from_env() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("ORCHESTRATOR_PORT", "9090"),
            ("MCP_WORKERS", "8"),
            ("MCP_BACKOFF_BASE_MS", "250"),
            ("MCP_RESULT_TTL_SECS", "60"),
            ("MCP_LOG_DIR", "none"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.result_ttl, Duration::from_secs(60));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn invalid_value_names_key() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("ORCHESTRATOR_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCHESTRATOR_PORT"));
    }

    fn rejected_key(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidValue { key, .. } => key,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_counts_and_periods_rejected() {
        for key in [
            "MCP_WORKERS",
            "MCP_POLL_INTERVAL_MS",
            "MCP_HEARTBEAT_SECS",
            "MCP_LIVENESS_TIMEOUT_SECS",
            "MCP_SWEEP_INTERVAL_SECS",
            "MCP_RESULT_TTL_SECS",
        ] {
            let err = OrchestratorConfig::from_lookup(lookup(&[(key, "0")])).unwrap_err();
            assert_eq!(rejected_key(err), key);
        }
    }

    #[test]
    fn heartbeat_must_beat_liveness_timeout() {
        let err = OrchestratorConfig::from_lookup(lookup(&[
            ("MCP_HEARTBEAT_SECS", "30"),
            ("MCP_LIVENESS_TIMEOUT_SECS", "30"),
        ]))
        .unwrap_err();
        assert_eq!(rejected_key(err), "MCP_HEARTBEAT_SECS");

        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("MCP_HEARTBEAT_SECS", "5"),
            ("MCP_LIVENESS_TIMEOUT_SECS", "20"),
        ]))
        .unwrap();
        assert_eq!(config.dispatcher.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.liveness_timeout, Duration::from_secs(20));
    }

    #[test]
    fn zero_agent_concurrency_rejected() {
        let err = AgentSettings::from_lookup(
            BuiltinAgent::Codex,
            lookup(&[("CODEX_ENABLED", "true"), ("CODEX_MAX_CONCURRENT", "0")]),
        )
        .unwrap_err();
        assert_eq!(rejected_key(err), "CODEX_MAX_CONCURRENT");
    }

    #[test]
    fn agent_settings_from_prefix() {
        let settings = AgentSettings::from_lookup(
            BuiltinAgent::Codex,
            lookup(&[
                ("CODEX_ENABLED", "true"),
                ("CODEX_MAX_CONCURRENT", "5"),
                ("CODEX_URL", "http://codex.local/run"),
                ("CODEX_API_KEY", "secret"),
            ]),
        )
        .unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.max_concurrent, 5);
        assert_eq!(settings.endpoint.as_deref(), Some("http://codex.local/run"));
        assert!(settings.api_key.is_some());
    }

    #[test]
    fn agents_disabled_unless_opted_in() {
        let settings =
            AgentSettings::from_lookup(BuiltinAgent::Gemini, lookup(&[("GEMINI_ENABLED", "yes")]))
                .unwrap();
        assert!(!settings.enabled);
        assert!(settings.endpoint.is_none());
    }
}
