//! Queue dispatch: routing on enqueue, fair selection on dequeue, and
//! supervised execution on leased workers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, QueueSelection};
use crate::error::{DispatchError, DispatchResult};
use crate::result_store::{
    InMemoryResultStore, ResultBackend, ResultRecord, ResultStatus, TaskOutcome,
    DEFAULT_RESULT_TTL,
};
use crate::router::Router;
use crate::task::{
    EnqueueOptions, Task, TaskContext, TaskHandler, TaskHandlerRegistry, TaskId, TaskState,
    TimeLimits,
};
use crate::time_limit::{ExecutionOutcome, TimeLimitEnforcer};
use crate::topology::QueueTopology;
use crate::worker::{SlotFate, WorkerId, WorkerLease, WorkerLifecycleManager, WorkerStats};

/// Answer of the result API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultQuery {
    Ready(ResultRecord),
    /// Known to the dispatcher, no outcome yet
    Pending,
    NotFound,
}

/// Summary of one dispatched task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub task_name: String,
    pub queue: String,
    pub worker_id: WorkerId,
    pub status: ResultStatus,
    pub soft_limit_hit: bool,
    pub elapsed: Duration,
    pub slot_fate: SlotFate,
    /// Set when the outcome could not be written to the result store
    pub result_error: Option<String>,
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub queue_depths: HashMap<String, usize>,
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub workers: WorkerStats,
}

#[derive(Debug)]
struct Lane {
    name: String,
    weight: i64,
    current: i64,
    tasks: VecDeque<Task>,
}

/// All queues behind one lock so selection and pop are a single step
#[derive(Debug)]
struct QueueSet {
    lanes: Vec<Lane>,
    index: HashMap<String, usize>,
    policy: QueueSelection,
}

impl QueueSet {
    fn new(topology: &QueueTopology, policy: QueueSelection) -> Self {
        let lanes: Vec<Lane> = topology
            .queues()
            .iter()
            .map(|queue| Lane {
                name: queue.name.clone(),
                weight: i64::from(queue.weight),
                current: 0,
                tasks: VecDeque::new(),
            })
            .collect();
        let index = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| (lane.name.clone(), i))
            .collect();

        Self {
            lanes,
            index,
            policy,
        }
    }

    fn lane_mut(&mut self, queue: &str) -> DispatchResult<&mut Lane> {
        let i = *self
            .index
            .get(queue)
            .ok_or_else(|| DispatchError::UnknownQueue {
                queue: queue.to_string(),
            })?;
        Ok(&mut self.lanes[i])
    }

    fn push_back(&mut self, task: Task) -> DispatchResult<()> {
        self.lane_mut(&task.queue)?.tasks.push_back(task);
        Ok(())
    }

    fn push_front(&mut self, task: Task) -> DispatchResult<()> {
        self.lane_mut(&task.queue)?.tasks.push_front(task);
        Ok(())
    }

    /// Select a non-empty queue and pop its head
    fn pop_next(&mut self) -> Option<Task> {
        let selected = match self.policy {
            QueueSelection::StrictPriority => self.select_strict(),
            QueueSelection::WeightedRoundRobin => self.select_weighted(),
        }?;
        self.lanes[selected].tasks.pop_front()
    }

    /// Heaviest non-empty queue; ties go to the earlier declaration
    fn select_strict(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, lane) in self.lanes.iter().enumerate() {
            if lane.tasks.is_empty() {
                continue;
            }
            match best {
                Some(b) if self.lanes[b].weight >= lane.weight => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Smooth weighted round-robin: every non-empty queue gains its weight,
    /// the leader is picked and pays back the total. Over any window each
    /// queue gets turns in proportion to its weight, so none starves.
    fn select_weighted(&mut self) -> Option<usize> {
        let mut total = 0;
        for lane in &mut self.lanes {
            if lane.tasks.is_empty() {
                lane.current = 0;
            } else {
                lane.current += lane.weight;
                total += lane.weight;
            }
        }

        let mut best: Option<usize> = None;
        for (i, lane) in self.lanes.iter().enumerate() {
            if lane.tasks.is_empty() {
                continue;
            }
            match best {
                Some(b) if self.lanes[b].current >= lane.current => {}
                _ => best = Some(i),
            }
        }

        if let Some(b) = best {
            self.lanes[b].current -= total;
        }
        best
    }

    fn depths(&self) -> HashMap<String, usize> {
        self.lanes
            .iter()
            .map(|lane| (lane.name.clone(), lane.tasks.len()))
            .collect()
    }
}

/// Priority-aware dispatcher.
///
/// Each worker holds at most one task: a task is only popped when a dispatch
/// loop is ready to run it, and the worker lease is held until the outcome is
/// recorded.
pub struct Dispatcher {
    config: Arc<Config>,
    topology: QueueTopology,
    router: Router,
    queues: Mutex<QueueSet>,
    workers: WorkerLifecycleManager,
    enforcer: TimeLimitEnforcer,
    results: Arc<dyn ResultBackend>,
    handlers: TaskHandlerRegistry,
    tracked: RwLock<HashMap<TaskId, TaskState>>,
    work_available: Notify,
    shutdown_tx: watch::Sender<bool>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Validate `config` and assemble the engine around `results`
    pub fn new(config: Config, results: Arc<dyn ResultBackend>) -> DispatchResult<Self> {
        config.validate()?;

        let topology = QueueTopology::from_config(&config)?;
        let router = Router::new(&topology, &config.task_routes)?;
        let queues = QueueSet::new(&topology, config.queue_selection);
        let workers = WorkerLifecycleManager::new(
            config.worker_pool_size,
            config.worker_max_tasks_per_child,
            config.acquire_timeout(),
        )?;
        let enforcer = TimeLimitEnforcer::new(TimeLimits::new(
            Some(config.soft_time_limit()),
            Some(config.hard_time_limit()),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Dispatcher configured: broker={} backend={} queues={} pool={} max_tasks_per_child={}",
            config.broker_url,
            config.result_backend,
            topology.queues().len(),
            config.worker_pool_size,
            config.worker_max_tasks_per_child
        );

        Ok(Self {
            config: Arc::new(config),
            topology,
            router,
            queues: Mutex::new(queues),
            workers,
            enforcer,
            results,
            handlers: TaskHandlerRegistry::default(),
            tracked: RwLock::new(HashMap::new()),
            work_available: Notify::new(),
            shutdown_tx,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    /// Dispatcher backed by an in-process result store
    pub fn in_memory(config: Config) -> DispatchResult<Self> {
        Self::new(config, Arc::new(InMemoryResultStore::new()))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Bind a handler to a task name
    pub async fn register_handler<H>(&self, task_name: &str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.register(task_name.to_string(), handler).await;
        debug!("Registered handler for {}", task_name);
    }

    /// Route and append a task to its queue tail
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> DispatchResult<TaskId> {
        let queue = match options.queue.as_deref() {
            Some(queue) if self.topology.contains(queue) => queue.to_string(),
            Some(queue) => {
                return Err(DispatchError::UnknownQueue {
                    queue: queue.to_string(),
                })
            }
            None => self.router.route(task_name).to_string(),
        };

        let limits = self.effective_limits(&options);
        let task = Task::new(task_name.to_string(), payload, queue, limits)?;
        let task_id = task.id;

        // Track before the task becomes visible to dispatch loops
        self.tracked.write().await.insert(task_id, TaskState::Queued);
        let pushed = {
            let queue_name = task.queue.clone();
            self.queues.lock().await.push_back(task).map(|_| queue_name)
        };
        let queue_name = match pushed {
            Ok(queue_name) => queue_name,
            Err(e) => {
                self.tracked.write().await.remove(&task_id);
                return Err(e);
            }
        };
        self.work_available.notify_one();

        debug!("Enqueued task {} ({}) on queue {}", task_id, task_name, queue_name);
        Ok(task_id)
    }

    /// Task limits over config defaults.
    ///
    /// An explicit hard limit below the default soft limit drops the soft
    /// limit instead of rejecting the task.
    fn effective_limits(&self, options: &EnqueueOptions) -> TimeLimits {
        let defaults = self.enforcer.defaults();
        let mut limits = options.limits().or(defaults);
        if options.soft_limit.is_none() && !limits.is_consistent() {
            limits.soft = None;
        }
        limits
    }

    /// Pull and run one task; `None` when every queue is empty.
    ///
    /// If no worker frees up within the acquire timeout the task goes back to
    /// the head of its queue and `WorkerPoolExhausted` is returned.
    pub async fn run_once(&self) -> DispatchResult<Option<TaskReport>> {
        let task = match self.queues.lock().await.pop_next() {
            Some(task) => task,
            None => return Ok(None),
        };

        let lease = match self.workers.acquire(&task.queue).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("No worker for task {} on {}: {}", task.id, task.queue, e);
                self.queues.lock().await.push_front(task)?;
                self.work_available.notify_one();
                return Err(e);
            }
        };

        let span = info_span!(
            "task",
            task_name = %task.name,
            task_id = %task.id,
            worker_id = %lease.worker_id()
        );
        let report = self.execute(task, lease).instrument(span).await;
        Ok(Some(report))
    }

    /// Run tasks one at a time until every queue is empty
    pub async fn run_until_idle(&self) -> DispatchResult<Vec<TaskReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_once().await? {
            reports.push(report);
        }
        Ok(reports)
    }

    async fn execute(&self, task: Task, lease: WorkerLease) -> TaskReport {
        self.tracked
            .write()
            .await
            .insert(task.id, TaskState::Running);
        debug!("Task {} started on queue {}", task.id, lease.queue());

        let worker_id = lease.worker_id();
        let (outcome, soft_limit_hit, elapsed) = match self.handlers.find(&task.name).await {
            Some(handler) => {
                let ctx_base = (
                    task.id,
                    task.name.clone(),
                    Arc::<[u8]>::from(task.payload.as_slice()),
                );
                let enforcement = self
                    .enforcer
                    .execute(task.id, task.limits, move |soft_limit| {
                        let (task_id, task_name, payload) = ctx_base;
                        let ctx = TaskContext {
                            task_id,
                            task_name,
                            payload,
                            worker_id,
                            soft_limit,
                        };
                        async move { handler.handle(ctx).await }
                    })
                    .await;

                let outcome = match enforcement.outcome {
                    ExecutionOutcome::Succeeded(value) => TaskOutcome::Success(value),
                    ExecutionOutcome::Failed(message) => TaskOutcome::Failure(message),
                    ExecutionOutcome::TimedOut { limit } => TaskOutcome::Timeout(format!(
                        "hard time limit of {:?} exceeded",
                        limit
                    )),
                };
                (outcome, enforcement.soft_limit_hit, enforcement.elapsed)
            }
            None => {
                error!("No handler registered for task type: {}", task.name);
                let outcome =
                    TaskOutcome::Failure(format!("no handler registered for {}", task.name));
                (outcome, false, Duration::ZERO)
            }
        };

        let status = outcome.status();
        match status {
            ResultStatus::Success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("Task {} succeeded in {:?}", task.id, elapsed);
            }
            ResultStatus::Failure => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Task {} failed after {:?}", task.id, elapsed);
            }
            ResultStatus::Timeout => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                error!("Task {} timed out after {:?}", task.id, elapsed);
            }
        }

        let result_error = self.store_outcome(task.id, outcome).await;
        self.tracked.write().await.remove(&task.id);

        let slot_fate = self.workers.release(lease, status).await;

        TaskReport {
            task_id: task.id,
            task_name: task.name,
            queue: task.queue,
            worker_id,
            status,
            soft_limit_hit,
            elapsed,
            slot_fate,
            result_error,
        }
    }

    /// Persist an outcome. If the store rejects it, a failure record naming
    /// the store error is written in its place so the task never reads as
    /// unknown. Returns the store error, if any.
    async fn store_outcome(&self, task_id: TaskId, outcome: TaskOutcome) -> Option<String> {
        let ttl = Duration::from_secs(self.config.result_expires);
        let err = match self.results.put(task_id, outcome, ttl).await {
            Ok(()) => return None,
            Err(e) => e.to_string(),
        };
        error!("Failed to store result for task {}: {}", task_id, err);

        let fallback = TaskOutcome::Failure(format!("result could not be stored: {}", err));
        if let Err(e) = self.results.put(task_id, fallback, DEFAULT_RESULT_TTL).await {
            error!("Failed to store fallback result for task {}: {}", task_id, e);
        }
        Some(err)
    }

    /// Look up a task's outcome
    pub async fn get_result(&self, task_id: TaskId) -> DispatchResult<ResultQuery> {
        // Tracking is checked first: a task leaves it only after its result is stored
        let known = self.tracked.read().await.contains_key(&task_id);
        if let Some(record) = self.results.get(task_id).await? {
            return Ok(ResultQuery::Ready(record));
        }
        Ok(if known {
            ResultQuery::Pending
        } else {
            ResultQuery::NotFound
        })
    }

    /// Queued or running state of a task that has no outcome yet
    pub async fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tracked.read().await.get(&task_id).copied()
    }

    pub async fn stats(&self) -> DispatchStats {
        let queue_depths = self.queues.lock().await.depths();
        let in_flight = self
            .tracked
            .read()
            .await
            .values()
            .filter(|state| **state == TaskState::Running)
            .count();

        DispatchStats {
            queue_depths,
            in_flight,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            workers: self.workers.stats().await,
        }
    }

    /// Run one dispatch loop per worker slot plus the result sweeper until
    /// [`Dispatcher::shutdown`] is called. Loops finish their current task
    /// before exiting.
    pub async fn run(self: Arc<Self>) -> DispatchResult<()> {
        info!(
            "Starting dispatcher with {} dispatch loops over queues: {:?}",
            self.workers.pool_size(),
            self.topology
                .queues()
                .iter()
                .map(|q| q.name.as_str())
                .collect::<Vec<_>>()
        );

        let mut handles = Vec::with_capacity(self.workers.pool_size() + 1);
        for index in 0..self.workers.pool_size() {
            handles.push(self.clone().spawn_dispatch_loop(index));
        }
        handles.push(self.clone().spawn_sweep_loop());

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Dispatcher loop ended abnormally: {}", e);
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    fn spawn_dispatch_loop(self: Arc<Self>, index: usize) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            debug!("Dispatch loop {} started", index);
            let poll = self.config.poll_interval();

            loop {
                let stopping = *shutdown.borrow();
                if stopping {
                    break;
                }

                match self.run_once().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        debug!("Dispatch loop {} backing off: {}", index, e);
                    }
                    Err(e) => {
                        error!("Dispatch loop {} error: {}", index, e);
                    }
                }

                tokio::select! {
                    _ = self.work_available.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }

            debug!("Dispatch loop {} shutting down", index);
        })
    }

    fn spawn_sweep_loop(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval());
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.results.purge_expired().await {
                            error!("Failed to purge expired results: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                let stopping = *shutdown.borrow();
                if stopping {
                    break;
                }
            }
        })
    }

    /// Signal every loop started by [`Dispatcher::run`] to stop
    pub fn shutdown(&self) {
        info!("Shutting down dispatcher");
        self.shutdown_tx.send_replace(true);
        self.work_available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
