//! # Task Dispatch
//!
//! Priority-aware task dispatch and worker lifecycle engine for a
//! Celery-style task queue.
//!
//! ## Features
//!
//! - Static queue topology on a direct exchange with per-task route overrides
//! - Weighted round-robin (or strict priority) selection across queues, FIFO within a queue
//! - One task per worker at a time, workers recycled after a task budget
//! - Soft (cooperative) and hard (forced) time limits
//! - Result storage with expiry
//! - Optional periodic trigger for scheduled tasks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_dispatch::{handler_fn, Config, Dispatcher, EnqueueOptions, TaskContext};
//!
//! # async fn demo() -> task_dispatch::DispatchResult<()> {
//! let dispatcher = Arc::new(Dispatcher::in_memory(Config::default())?);
//! dispatcher
//!     .register_handler(
//!         "app.tasks.echo",
//!         handler_fn(|ctx: TaskContext| async move { Ok(ctx.payload.to_vec()) }),
//!     )
//!     .await;
//!
//! let id = dispatcher
//!     .enqueue("app.tasks.echo", b"hi".to_vec(), EnqueueOptions::new())
//!     .await?;
//! dispatcher.run_once().await?;
//! println!("{:?}", dispatcher.get_result(id).await?);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod result_store;
pub mod router;
pub mod scheduler;
pub mod task;
pub mod time_limit;
pub mod topology;
pub mod worker;

// Re-export commonly used types
pub use client::TaskClient;
pub use config::{Config, LoggingConfig, QueueConfig, QueueSelection, TaskRoute};
pub use dispatcher::{DispatchStats, Dispatcher, ResultQuery, TaskReport};
pub use error::{DispatchError, DispatchResult};
pub use result_store::{InMemoryResultStore, ResultBackend, ResultRecord, ResultStatus, TaskOutcome};
pub use router::Router;
pub use scheduler::{BeatEntry, BeatScheduler, ScheduleExpression, TaskProducer};
pub use task::{handler_fn, EnqueueOptions, Task, TaskContext, TaskHandler, TaskId, TimeLimits};
pub use time_limit::{LimitState, SoftLimitSignal, TimeLimitEnforcer};
pub use topology::{ExchangeType, Queue, QueueTopology};
pub use worker::{SlotFate, WorkerId, WorkerLifecycleManager};

/// Version of the dispatch engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
