//! Task definitions and handlers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::time_limit::SoftLimitSignal;
use crate::worker::WorkerId;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Where a task currently is, as seen by the dispatcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in its queue
    Queued,
    /// Held by a worker
    Running,
}

/// Soft and hard deadlines, both measured from dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimeLimits {
    pub soft: Option<Duration>,
    pub hard: Option<Duration>,
}

impl TimeLimits {
    pub fn new(soft: Option<Duration>, hard: Option<Duration>) -> Self {
        Self { soft, hard }
    }

    /// Fill unset limits from `defaults`
    pub fn or(self, defaults: TimeLimits) -> Self {
        Self {
            soft: self.soft.or(defaults.soft),
            hard: self.hard.or(defaults.hard),
        }
    }

    /// The soft limit must fall strictly before the hard limit
    pub fn is_consistent(&self) -> bool {
        match (self.soft, self.hard) {
            (Some(soft), Some(hard)) => soft < hard,
            _ => true,
        }
    }
}

/// Per-call enqueue options
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit target queue, bypassing the router
    pub queue: Option<String>,
    pub soft_limit: Option<Duration>,
    pub hard_limit: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn soft_limit(mut self, limit: Duration) -> Self {
        self.soft_limit = Some(limit);
        self
    }

    pub fn hard_limit(mut self, limit: Duration) -> Self {
        self.hard_limit = Some(limit);
        self
    }

    pub fn limits(&self) -> TimeLimits {
        TimeLimits::new(self.soft_limit, self.hard_limit)
    }
}

/// A unit of work. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name used for routing and handler lookup
    pub name: String,
    /// Opaque payload handed to the handler
    pub payload: Vec<u8>,
    /// Queue chosen at enqueue time
    pub queue: String,
    pub enqueue_time: DateTime<Utc>,
    /// Effective limits, defaults already applied
    pub limits: TimeLimits,
}

impl Task {
    /// Build a task, rejecting inconsistent limits
    pub fn new(
        name: String,
        payload: Vec<u8>,
        queue: String,
        limits: TimeLimits,
    ) -> DispatchResult<Self> {
        if name.is_empty() {
            return Err(DispatchError::invalid_task(name, "task name must not be empty".to_string()));
        }
        if !limits.is_consistent() {
            return Err(DispatchError::invalid_task(
                name,
                format!(
                    "soft limit {:?} must be below hard limit {:?}",
                    limits.soft, limits.hard
                ),
            ));
        }
        if limits.hard == Some(Duration::ZERO) {
            return Err(DispatchError::invalid_task(name, "hard limit must be positive".to_string()));
        }

        Ok(Self {
            id: TaskId::new_v4(),
            name,
            payload,
            queue,
            enqueue_time: Utc::now(),
            limits,
        })
    }
}

/// What a handler sees while running one task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub payload: Arc<[u8]>,
    pub worker_id: WorkerId,
    /// Raised when the soft limit elapses; bodies should wind down
    pub soft_limit: SoftLimitSignal,
}

/// Executes task bodies for one or more task names
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Vec<u8>>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Vec<u8>> {
        (self.0)(ctx).await
    }
}

/// Registry binding task names to handlers (exact match only)
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    /// Register a handler for a task name, replacing any previous one
    pub async fn register<H>(&self, task_name: String, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(task_name, Arc::new(handler));
    }

    pub async fn find(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn limits_fill_from_defaults() {
        let defaults = TimeLimits::new(Some(Duration::from_secs(55)), Some(Duration::from_secs(60)));
        let limits = TimeLimits::new(None, Some(Duration::from_secs(120))).or(defaults);
        assert_eq!(limits.soft, Some(Duration::from_secs(55)));
        assert_eq!(limits.hard, Some(Duration::from_secs(120)));
        assert!(limits.is_consistent());
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let limits = TimeLimits::new(Some(Duration::from_secs(10)), Some(Duration::from_secs(10)));
        let err = assert_err!(Task::new(
            "app.tasks.slow".to_string(),
            Vec::new(),
            "default".to_string(),
            limits,
        ));
        assert!(matches!(err, DispatchError::InvalidTask { .. }));
    }

    #[test]
    fn new_task_gets_fresh_id() {
        let a = assert_ok!(Task::new("t".into(), b"{}".to_vec(), "default".into(), TimeLimits::default()));
        let b = assert_ok!(Task::new("t".into(), b"{}".to_vec(), "default".into(), TimeLimits::default()));
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn registry_matches_exact_names() {
        let registry = TaskHandlerRegistry::default();
        registry
            .register(
                "app.tasks.echo".to_string(),
                handler_fn(|ctx: TaskContext| async move { Ok(ctx.payload.to_vec()) }),
            )
            .await;

        assert!(registry.find("app.tasks.echo").await.is_some());
        assert!(registry.find("app.tasks").await.is_none());
        assert!(registry.find("app.tasks.echo2").await.is_none());
    }
}
