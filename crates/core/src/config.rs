use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load the configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Config file path, taken from `CONFIG` or defaulting to `config.yml`.
    pub fn path_from_env() -> String {
        std::env::var("CONFIG").unwrap_or_else(|_| "config.yml".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Upper bound on a single enqueue from the webhook handler. Kept well below
    /// GitHub's own 10 second delivery timeout.
    pub enqueue_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self { Self { port: 8080, enqueue_timeout_secs: 5 } }
}

impl ServerConfig {
    pub fn enqueue_timeout(&self) -> Duration { Duration::from_secs(self.enqueue_timeout_secs) }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Shared webhook secret. When absent, signatures are not checked.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// `sqlite://path/to/queue.db` or `memory:`.
    pub url: String,
    #[serde(default = "default_queue_name")]
    pub name: String,
}

fn default_queue_name() -> String { "github-webhook-events".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run the poll loop inside the web process.
    pub embedded: bool,
    pub poll_interval_secs: u64,
    pub max_messages_per_batch: usize,
    pub visibility_timeout_secs: u64,
    /// Messages dequeued more often than this are dead-lettered.
    pub max_dequeue_count: u32,
    /// Messages processed concurrently within one batch.
    pub concurrency: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            poll_interval_secs: 5,
            max_messages_per_batch: 32,
            visibility_timeout_secs: 300,
            max_dequeue_count: 5,
            concurrency: 8,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs) }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration { Duration::from_secs(self.shutdown_timeout_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Application Insights connection string. Records are only logged when absent.
    pub connection_string: Option<String>,
    /// Runner label prefixes that carry a pool name, checked in order.
    pub pool_label_prefixes: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            pool_label_prefixes: vec!["ManagedDevOps.Pool=".to_string()],
            request_timeout_secs: 10,
        }
    }
}

impl TelemetryConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}
