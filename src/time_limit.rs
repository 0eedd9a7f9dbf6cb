//! Soft and hard time limit enforcement
//!
//! Each execution moves through
//! `Running -> SoftLimitReached -> Terminated` or ends in `Completed`.
//! Both deadlines are armed when the body is spawned (dispatch time, not
//! enqueue time) and are tokio timers raced against the body, so nothing
//! polls on the dispatch path and nothing outlives the execution.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::task::{TaskId, TimeLimits};

/// Cooperative cancellation signal raised at the soft limit
#[derive(Debug, Clone)]
pub struct SoftLimitSignal {
    rx: watch::Receiver<bool>,
}

impl SoftLimitSignal {
    fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that is never raised, for bodies run without limits
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // the receiver keeps the last value after the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the soft limit is reached
    pub async fn raised(&mut self) {
        if self.rx.wait_for(|raised| *raised).await.is_err() {
            // Sender dropped without raising: the limit never fires
            std::future::pending::<()>().await;
        }
    }
}

/// Lifecycle of one enforced execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    Running,
    SoftLimitReached,
    /// Hard limit hit, body aborted
    Terminated,
    Completed,
}

/// How the body ended
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded(Vec<u8>),
    Failed(String),
    TimedOut { limit: Duration },
}

/// Result of [`TimeLimitEnforcer::execute`]
#[derive(Debug)]
pub struct Enforcement {
    pub outcome: ExecutionOutcome,
    pub final_state: LimitState,
    /// Whether the soft signal was raised before the end
    pub soft_limit_hit: bool,
    pub elapsed: Duration,
}

impl Enforcement {
    pub fn timed_out(&self) -> bool {
        self.final_state == LimitState::Terminated
    }
}

/// Runs task bodies under soft/hard deadlines
#[derive(Debug, Clone, Default)]
pub struct TimeLimitEnforcer {
    defaults: TimeLimits,
}

impl TimeLimitEnforcer {
    pub fn new(defaults: TimeLimits) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> TimeLimits {
        self.defaults
    }

    /// Spawn the body produced by `make_body` and supervise it.
    ///
    /// On the soft deadline the body's [`SoftLimitSignal`] is raised and the
    /// body keeps running. On the hard deadline the body is aborted and the
    /// outcome is `TimedOut`, whatever cleanup the body was doing. Errors and
    /// panics from the body become `Failed`.
    pub async fn execute<F, Fut>(
        &self,
        task_id: TaskId,
        limits: TimeLimits,
        make_body: F,
    ) -> Enforcement
    where
        F: FnOnce(SoftLimitSignal) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        let limits = limits.or(self.defaults);
        let started = Instant::now();
        // A limit past the timer range never fires
        let soft_deadline = limits.soft.and_then(|soft| started.checked_add(soft));
        let hard_deadline = limits.hard.and_then(|hard| started.checked_add(hard));

        let (soft_tx, soft_rx) = watch::channel(false);
        let mut body = tokio::spawn(make_body(SoftLimitSignal::new(soft_rx)));
        let mut state = LimitState::Running;

        let outcome = loop {
            tokio::select! {
                joined = &mut body => {
                    state = LimitState::Completed;
                    break Self::outcome_of(task_id, joined);
                }
                _ = sleep_until_opt(soft_deadline), if state == LimitState::Running => {
                    state = LimitState::SoftLimitReached;
                    warn!("Task {} reached soft time limit {:?}", task_id, limits.soft);
                    soft_tx.send_replace(true);
                }
                _ = sleep_until_opt(hard_deadline) => {
                    state = LimitState::Terminated;
                    body.abort();
                    let limit = limits.hard.unwrap_or_default();
                    error!("Task {} exceeded hard time limit {:?}, terminating", task_id, limit);
                    break ExecutionOutcome::TimedOut { limit };
                }
            }
        };

        let elapsed = started.elapsed();
        debug!("Task {} finished in state {:?} after {:?}", task_id, state, elapsed);

        let soft_limit_hit = *soft_tx.borrow();
        Enforcement {
            outcome,
            final_state: state,
            soft_limit_hit,
            elapsed,
        }
    }

    fn outcome_of(
        task_id: TaskId,
        joined: Result<anyhow::Result<Vec<u8>>, JoinError>,
    ) -> ExecutionOutcome {
        match joined {
            Ok(Ok(value)) => ExecutionOutcome::Succeeded(value),
            Ok(Err(e)) => ExecutionOutcome::Failed(format!("{:#}", e)),
            Err(e) if e.is_panic() => {
                error!("Task {} panicked", task_id);
                ExecutionOutcome::Failed("task panicked".to_string())
            }
            Err(e) => ExecutionOutcome::Failed(format!("task aborted: {}", e)),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
