use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for ledger state and the task queue
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub verify_email: VerifyEmailConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    /// Deadline for a single unit of work; unset means none
    pub tx_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 5000,
            tx_timeout_ms: None,
        }
    }
}

/// Task processor settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Queue name -> relative weight
    pub queues: BTreeMap<String, u32>,
    /// Drain higher classes first instead of weighted selection
    pub strict_priority: bool,
    pub poll_interval_ms: u64,
    pub task_timeout_secs: u64,
    pub lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: BTreeMap::from([
                ("critical".to_string(), 6),
                ("default".to_string(), 3),
                ("low".to_string(), 1),
            ]),
            strict_priority: false,
            poll_interval_ms: 1000,
            task_timeout_secs: 1800,
            lease_secs: 1830,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VerifyEmailConfig {
    pub url_base: String,
    pub from_name: String,
    pub from_address: String,
}

impl Default for VerifyEmailConfig {
    fn default() -> Self {
        Self {
            url_base: "http://localhost:8080/v1/verify_email".to_string(),
            from_name: "Simple Bank".to_string(),
            from_address: "no-reply@simplebank.local".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
