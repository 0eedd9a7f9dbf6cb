//! Worker slot pool with per-child task budgets

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::result_store::ResultStatus;

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// One execution unit. Destroyed and replaced once its budget is spent.
#[derive(Debug)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    tasks_completed: AtomicU32,
    pub max_tasks_per_child: u32,
}

impl WorkerSlot {
    fn new(max_tasks_per_child: u32) -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            tasks_completed: AtomicU32::new(0),
            max_tasks_per_child,
        }
    }

    pub fn tasks_completed(&self) -> u32 {
        self.tasks_completed.load(Ordering::Acquire)
    }

    /// Whether the slot may take another task
    pub fn is_eligible(&self) -> bool {
        self.tasks_completed() < self.max_tasks_per_child
    }
}

/// Exclusive hold on a slot for exactly one task.
///
/// The lease owns its pool permit, so a slot can never be handed out twice.
#[derive(Debug)]
pub struct WorkerLease {
    slot: WorkerSlot,
    queue: String,
    permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn worker_id(&self) -> WorkerId {
        self.slot.worker_id
    }

    pub fn slot(&self) -> &WorkerSlot {
        &self.slot
    }

    /// Queue the lease was acquired for
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// What happened to a slot on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFate {
    /// Back in the idle pool
    Returned,
    /// Budget spent; retired and replaced
    Recycled,
    /// Killed at the hard limit and replaced
    Terminated,
}

/// Pool counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerStats {
    pub pool_size: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    pub spawned: u64,
    pub recycled: u64,
    pub terminated: u64,
}

/// Idle slots plus the count of slots out on lease
#[derive(Debug, Default)]
struct SlotPool {
    idle: Vec<WorkerSlot>,
    leased: usize,
}

/// Hands out worker slots and recycles them after `max_tasks_per_child` tasks
#[derive(Debug)]
pub struct WorkerLifecycleManager {
    pool_size: usize,
    max_tasks_per_child: u32,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    slots: Mutex<SlotPool>,
    spawned: AtomicU64,
    recycled: AtomicU64,
    terminated: AtomicU64,
}

impl WorkerLifecycleManager {
    pub fn new(
        pool_size: usize,
        max_tasks_per_child: u32,
        acquire_timeout: Duration,
    ) -> DispatchResult<Self> {
        if pool_size == 0 {
            return Err(DispatchError::config("worker pool size must be at least 1"));
        }
        if max_tasks_per_child == 0 {
            return Err(DispatchError::config("max_tasks_per_child must be at least 1"));
        }

        Ok(Self {
            pool_size,
            max_tasks_per_child,
            acquire_timeout,
            permits: Arc::new(Semaphore::new(pool_size)),
            slots: Mutex::new(SlotPool::default()),
            spawned: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            terminated: AtomicU64::new(0),
        })
    }

    /// Lease an eligible slot, waiting up to the acquire timeout.
    ///
    /// Slots are spawned lazily until the pool is full.
    pub async fn acquire(&self, queue: &str) -> DispatchResult<WorkerLease> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| DispatchError::WorkerPoolExhausted {
            queue: queue.to_string(),
            waited_ms: self.acquire_timeout.as_millis() as u64,
        })?
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!("worker pool closed: {}", e)))?;

        let slot = {
            let mut pool = self.slots.lock().await;
            pool.leased += 1;
            match pool.idle.pop() {
                Some(slot) => slot,
                None => self.spawn_slot(),
            }
        };
        debug_assert!(slot.is_eligible());

        debug!(
            "Worker {} acquired for queue {} ({} tasks done)",
            slot.worker_id,
            queue,
            slot.tasks_completed()
        );

        Ok(WorkerLease {
            slot,
            queue: queue.to_string(),
            permit,
        })
    }

    /// Return a lease after its task ended with `status`.
    ///
    /// The completed-task counter is bumped; a slot reaching its budget is
    /// retired and a replacement spawned. A timed-out slot was force-killed
    /// and is always replaced.
    pub async fn release(&self, lease: WorkerLease, status: ResultStatus) -> SlotFate {
        let WorkerLease {
            slot,
            queue,
            permit,
        } = lease;
        let completed = slot.tasks_completed.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "Worker {} released from queue {} with status {:?}",
            slot.worker_id, queue, status
        );

        let fate = if status == ResultStatus::Timeout {
            SlotFate::Terminated
        } else if completed >= slot.max_tasks_per_child {
            SlotFate::Recycled
        } else {
            SlotFate::Returned
        };

        let mut pool = self.slots.lock().await;
        pool.leased -= 1;
        match fate {
            SlotFate::Returned => pool.idle.push(slot),
            SlotFate::Recycled => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Recycling worker {} after {} tasks",
                    slot.worker_id, completed
                );
                pool.idle.push(self.spawn_slot());
            }
            SlotFate::Terminated => {
                self.terminated.fetch_add(1, Ordering::Relaxed);
                warn!("Worker {} terminated at hard time limit", slot.worker_id);
                pool.idle.push(self.spawn_slot());
            }
        }
        drop(pool);
        // waiters wake only once a slot is back in the pool
        drop(permit);
        fate
    }

    fn spawn_slot(&self) -> WorkerSlot {
        let slot = WorkerSlot::new(self.max_tasks_per_child);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        debug!("Spawned worker {}", slot.worker_id);
        slot
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub async fn stats(&self) -> WorkerStats {
        let pool = self.slots.lock().await;
        WorkerStats {
            pool_size: self.pool_size,
            live_workers: pool.idle.len() + pool.leased,
            idle_workers: pool.idle.len(),
            spawned: self.spawned.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
        }
    }
}
