use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CmdRunnerError, Result};
use crate::transport::DEFAULT_QUEUE;

/// Settings shared by the server and worker binaries.
///
/// Every field has a default, so an empty (or absent) file is valid.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Run a worker loop inside the server process.
    pub embedded_worker: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub queue: String,
    /// Upper bound for one long-poll receive over HTTP.
    pub poll_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub server_url: String,
    pub job_timeout_secs: u64,
    /// How long to keep draining output after a forced kill.
    pub kill_grace_ms: u64,
    /// 0 means unbounded.
    pub max_concurrent_jobs: usize,
    pub retry_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            embedded_worker: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            poll_wait_ms: 30_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            job_timeout_secs: 3600,
            kill_grace_ms: 2000,
            max_concurrent_jobs: 0,
            retry_backoff_ms: 1000,
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    CmdRunnerError::InvalidConfiguration(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| CmdRunnerError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.job_timeout_secs == 0 {
            return Err(CmdRunnerError::InvalidConfiguration(
                "worker.job_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.broker.poll_wait_ms == 0 {
            return Err(CmdRunnerError::InvalidConfiguration(
                "broker.poll_wait_ms must be greater than zero".to_string(),
            ));
        }
        if self.broker.queue.trim().is_empty() {
            return Err(CmdRunnerError::InvalidConfiguration(
                "broker.queue must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent_jobs > 0).then_some(self.max_concurrent_jobs)
    }
}

impl BrokerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.broker.queue, "cmd");
        assert_eq!(config.worker.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.worker.concurrency_limit(), None);
        assert!(!config.server.embedded_worker);
    }

    #[test]
    fn test_config_empty_file_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_config_partial_override() {
        let config = Config::from_toml(
            r#"
[broker]
queue = "jobs"

[worker]
max_concurrent_jobs = 4
"#,
        )
        .unwrap();

        assert_eq!(config.broker.queue, "jobs");
        assert_eq!(config.broker.poll_wait_ms, 30_000);
        assert_eq!(config.worker.concurrency_limit(), Some(4));
        assert_eq!(config.server.listen_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let err = Config::from_toml("[worker]\njob_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, CmdRunnerError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_config_rejects_zero_poll_wait() {
        let err = Config::from_toml("[broker]\npoll_wait_ms = 0\n").unwrap_err();
        assert!(matches!(err, CmdRunnerError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        assert!(Config::from_toml("[worker]\ntimeout = 5\n").is_err());
    }

    #[test]
    fn test_config_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/cmdrunner.toml"))).unwrap_err();
        assert!(matches!(err, CmdRunnerError::InvalidConfiguration(_)));
    }
}
