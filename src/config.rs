//! Engine configuration
//!
//! A [`Config`] is built once at startup (defaults, a JSON document, or both
//! plus environment overrides), validated, and then shared read-only as
//! `Arc<Config>` by the router, the worker pool and the dispatcher.

use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::router::Router;
use crate::scheduler::BeatEntry;
use crate::topology::{ExchangeType, QueueTopology};

/// Environment variable overriding [`Config::broker_url`]
pub const BROKER_URL_ENV: &str = "CELERY_BROKER_URL";
/// Environment variable overriding [`Config::result_backend`]
pub const RESULT_BACKEND_ENV: &str = "CELERY_RESULT_BACKEND";

/// The only serializer the engine speaks
pub const JSON_SERIALIZER: &str = "json";

/// A queue declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub routing_key: String,
    /// Share of dispatch turns under weighted round-robin
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl QueueConfig {
    pub fn new<S: Into<String>>(name: S, routing_key: S, weight: u32) -> Self {
        Self {
            name: name.into(),
            routing_key: routing_key.into(),
            weight,
        }
    }
}

/// Route override for a single task name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRoute {
    pub queue: String,
}

/// How the dispatcher chooses among non-empty queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueSelection {
    /// Smooth weighted round-robin over queue weights
    #[default]
    WeightedRoundRobin,
    /// Always drain the heaviest non-empty queue first
    StrictPriority,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    pub level: String,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
            ansi: true,
        }
    }
}

/// Startup configuration of the dispatch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection string
    pub broker_url: String,
    /// Result backend connection string
    pub result_backend: String,
    pub task_serializer: String,
    pub result_serializer: String,
    pub accept_content: Vec<String>,
    /// Result TTL in seconds
    pub result_expires: u64,
    /// Hard time limit in seconds
    pub task_time_limit: u64,
    /// Soft time limit in seconds, strictly below the hard limit
    pub task_soft_time_limit: u64,
    pub worker_prefetch_multiplier: u32,
    pub worker_max_tasks_per_child: u32,
    /// Number of concurrent worker slots
    pub worker_pool_size: usize,
    pub worker_acquire_timeout_ms: u64,
    pub task_queues: Vec<QueueConfig>,
    pub task_default_queue: String,
    pub task_default_exchange_type: ExchangeType,
    pub task_default_routing_key: String,
    pub task_routes: HashMap<String, TaskRoute>,
    pub queue_selection: QueueSelection,
    pub dispatch_poll_interval_ms: u64,
    pub result_sweep_interval_secs: u64,
    pub beat_schedule: Vec<BeatEntry>,
    /// IANA zone for daily and weekly beat times
    pub timezone: String,
    /// Timestamps are kept in UTC; `false` is accepted but has no effect
    pub enable_utc: bool,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let task_routes = [
            (
                "app.tasks.document_tasks.task_generate_embeddings",
                "high_priority",
            ),
            ("app.tasks.atlas_tasks.task_generate_kb_summary", "high_priority"),
            (
                "app.tasks.atlas_tasks.task_generate_collection_summary",
                "default",
            ),
        ]
        .into_iter()
        .map(|(task, queue)| {
            (
                task.to_string(),
                TaskRoute {
                    queue: queue.to_string(),
                },
            )
        })
        .collect();

        Self {
            broker_url: "redis://localhost:6379/1".to_string(),
            result_backend: "redis://localhost:6379/2".to_string(),
            task_serializer: JSON_SERIALIZER.to_string(),
            result_serializer: JSON_SERIALIZER.to_string(),
            accept_content: vec![JSON_SERIALIZER.to_string()],
            result_expires: 86400,       // 24 hours
            task_time_limit: 3600,       // 1 hour
            task_soft_time_limit: 3300,  // 55 minutes
            worker_prefetch_multiplier: 1,
            worker_max_tasks_per_child: 100,
            worker_pool_size: 4,
            worker_acquire_timeout_ms: 30_000,
            task_queues: vec![
                QueueConfig::new("default", "task.default", 3),
                QueueConfig::new("high_priority", "task.high", 6),
                QueueConfig::new("low_priority", "task.low", 1),
            ],
            task_default_queue: "default".to_string(),
            task_default_exchange_type: ExchangeType::Direct,
            task_default_routing_key: "task.default".to_string(),
            task_routes,
            queue_selection: QueueSelection::default(),
            dispatch_poll_interval_ms: 200,
            result_sweep_interval_secs: 3600,
            beat_schedule: Vec::new(),
            timezone: "Asia/Tokyo".to_string(),
            enable_utc: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Parse a JSON document; absent fields take their defaults
    pub fn from_json_str(json: &str) -> DispatchResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> DispatchResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        debug!("Loaded config from {}", path.as_ref().display());
        Self::from_json_str(&contents)
    }

    /// Apply `CELERY_BROKER_URL` / `CELERY_RESULT_BACKEND` when set
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(BROKER_URL_ENV) {
            self.broker_url = url;
        }
        if let Ok(url) = std::env::var(RESULT_BACKEND_ENV) {
            self.result_backend = url;
        }
        self
    }

    /// Check every startup invariant, failing fast on the first violation
    pub fn validate(&self) -> DispatchResult<()> {
        if self.broker_url.trim().is_empty() {
            return Err(DispatchError::config("broker_url must not be empty"));
        }
        if self.result_backend.trim().is_empty() {
            return Err(DispatchError::config("result_backend must not be empty"));
        }

        for (field, value) in [
            ("task_serializer", &self.task_serializer),
            ("result_serializer", &self.result_serializer),
        ] {
            if value != JSON_SERIALIZER {
                return Err(DispatchError::config(format!(
                    "{} must be \"json\", got \"{}\"",
                    field, value
                )));
            }
        }
        if self.accept_content != [JSON_SERIALIZER] {
            return Err(DispatchError::config(format!(
                "accept_content must be [\"json\"], got {:?}",
                self.accept_content
            )));
        }

        if self.task_time_limit == 0 {
            return Err(DispatchError::config("task_time_limit must be positive"));
        }
        if self.task_soft_time_limit >= self.task_time_limit {
            return Err(DispatchError::config(format!(
                "task_soft_time_limit ({}) must be below task_time_limit ({})",
                self.task_soft_time_limit, self.task_time_limit
            )));
        }
        if self.worker_prefetch_multiplier == 0 {
            return Err(DispatchError::config(
                "worker_prefetch_multiplier must be at least 1",
            ));
        }
        if self.worker_prefetch_multiplier > 1 {
            warn!(
                "worker_prefetch_multiplier={} ignored, workers always prefetch one task",
                self.worker_prefetch_multiplier
            );
        }
        if self.worker_max_tasks_per_child == 0 {
            return Err(DispatchError::config(
                "worker_max_tasks_per_child must be at least 1",
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(DispatchError::config("worker_pool_size must be at least 1"));
        }
        if self.dispatch_poll_interval_ms == 0 {
            return Err(DispatchError::config(
                "dispatch_poll_interval_ms must be positive",
            ));
        }
        let expiry = chrono::Duration::from_std(Duration::from_secs(self.result_expires))
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        if expiry.is_none() {
            return Err(DispatchError::config(format!(
                "result_expires ({}) is out of range",
                self.result_expires
            )));
        }
        if self.result_sweep_interval_secs == 0 {
            return Err(DispatchError::config(
                "result_sweep_interval_secs must be positive",
            ));
        }

        self.schedule_timezone()?;
        if !self.enable_utc {
            warn!("enable_utc=false ignored, timestamps are always stored in UTC");
        }

        // Topology and routes carry their own checks
        let topology = QueueTopology::from_config(self)?;
        Router::new(&topology, &self.task_routes)?;

        for entry in &self.beat_schedule {
            entry.validate(&topology)?;
        }

        Ok(())
    }

    /// Parsed [`Config::timezone`]
    pub fn schedule_timezone(&self) -> DispatchResult<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            DispatchError::config(format!("invalid timezone {}: {}", self.timezone, e))
        })
    }

    /// Default hard limit
    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_time_limit)
    }

    /// Default soft limit
    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.task_soft_time_limit)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.result_sweep_interval_secs)
    }
}
