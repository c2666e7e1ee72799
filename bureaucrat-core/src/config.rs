use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("can't parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Which wire shape `elaborate` uses for participant work messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskQueueType {
    /// `{header, fields}` published to `worker_<participant>`.
    #[default]
    Native,
    /// Task-queue framework emulation published to its exchange.
    Foreign,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BureaucratConfig {
    pub message_queue: String,
    pub event_queue: String,
    pub storage_dir: PathBuf,
    pub taskqueue_type: TaskQueueType,
    pub lock_file: PathBuf,
}

impl Default for BureaucratConfig {
    fn default() -> Self {
        Self {
            message_queue: "bureaucrat_msgs".to_string(),
            event_queue: "bureaucrat_events".to_string(),
            storage_dir: PathBuf::from("/tmp/processes"),
            taskqueue_type: TaskQueueType::Native,
            lock_file: PathBuf::from("/tmp/bureaucrat-schedule.lock"),
        }
    }
}

/// Connection parameters for an external AMQP bus implementation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub user: String,
    pub passwd: String,
    pub vhost: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "guest".to_string(),
            passwd: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

/// Daemon configuration, YAML with full defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bureaucrat: BureaucratConfig,
    pub amqp: AmqpConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
