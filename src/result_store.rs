//! Task outcome storage with expiry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::task::TaskId;

/// Default result TTL (24 hours)
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(86400);

/// Final status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
}

/// Outcome handed to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Vec<u8>),
    Failure(String),
    Timeout(String),
}

impl TaskOutcome {
    pub fn status(&self) -> ResultStatus {
        match self {
            TaskOutcome::Success(_) => ResultStatus::Success,
            TaskOutcome::Failure(_) => ResultStatus::Failure,
            TaskOutcome::Timeout(_) => ResultStatus::Timeout,
        }
    }
}

/// A stored outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub status: ResultStatus,
    /// Body return value, set on success
    pub value: Option<Vec<u8>>,
    /// Error payload, set on failure or timeout
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(task_id: TaskId, outcome: TaskOutcome, ttl: Duration) -> DispatchResult<Self> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| DispatchError::config(format!("result ttl out of range: {}", e)))?;
        let expires_at = created_at
            .checked_add_signed(ttl)
            .ok_or_else(|| DispatchError::config("result ttl out of range"))?;

        let status = outcome.status();
        let (value, error) = match outcome {
            TaskOutcome::Success(value) => (Some(value), None),
            TaskOutcome::Failure(error) | TaskOutcome::Timeout(error) => (None, Some(error)),
        };

        Ok(Self {
            task_id,
            status,
            value,
            error,
            created_at,
            expires_at,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Key-value result backend with per-entry expiry.
///
/// Expired records must read as absent.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Store `outcome` for `task_id`, replacing any previous record
    async fn put(&self, task_id: TaskId, outcome: TaskOutcome, ttl: Duration) -> DispatchResult<()>;

    /// Fetch a live record
    async fn get(&self, task_id: TaskId) -> DispatchResult<Option<ResultRecord>>;

    /// Drop expired records, returning how many were removed
    async fn purge_expired(&self) -> DispatchResult<u64>;
}

/// Stored entry: JSON body plus its expiry for cheap checks
#[derive(Debug, Clone)]
struct StoredResult {
    expires_at: DateTime<Utc>,
    body: String,
}

/// In-process result backend holding JSON-serialized records
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    entries: RwLock<HashMap<TaskId, StoredResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired or not
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultStore {
    async fn put(&self, task_id: TaskId, outcome: TaskOutcome, ttl: Duration) -> DispatchResult<()> {
        let record = ResultRecord::new(task_id, outcome, ttl)?;
        let stored = StoredResult {
            expires_at: record.expires_at,
            body: serde_json::to_string(&record)?,
        };

        self.entries.write().await.insert(task_id, stored);
        debug!("Stored {:?} result for task {}", record.status, task_id);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> DispatchResult<Option<ResultRecord>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(&task_id) {
                None => return Ok(None),
                Some(stored) if now < stored.expires_at => {
                    let record: ResultRecord = serde_json::from_str(&stored.body)?;
                    return Ok(Some(record));
                }
                Some(_) => {}
            }
        }

        // Expired: remove lazily, unless a fresh put raced in
        let mut entries = self.entries.write().await;
        if entries
            .get(&task_id)
            .is_some_and(|stored| now >= stored.expires_at)
        {
            entries.remove(&task_id);
            debug!("Result for task {} expired", task_id);
        }
        Ok(None)
    }

    async fn purge_expired(&self) -> DispatchResult<u64> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| now < stored.expires_at);
        let removed = (before - entries.len()) as u64;

        if removed > 0 {
            info!("Purged {} expired results", removed);
        }
        Ok(removed)
    }
}
