//! Producer and result API for submitting tasks to the dispatcher

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::{DispatchStats, Dispatcher, ResultQuery};
use crate::error::{DispatchError, DispatchResult};
use crate::result_store::ResultStatus;
use crate::scheduler::TaskProducer;
use crate::task::{EnqueueOptions, TaskId};

/// How often `wait_for_result` re-checks the result store
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Client for submitting tasks and reading their outcomes
#[derive(Clone)]
pub struct TaskClient {
    dispatcher: Arc<Dispatcher>,
}

impl TaskClient {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Submit a raw payload; the router picks the queue unless `options` names one
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> DispatchResult<TaskId> {
        self.dispatcher.enqueue(task_name, payload, options).await
    }

    /// Submit `args` serialized as JSON
    pub async fn submit<T>(&self, task_name: &str, args: &T) -> DispatchResult<TaskId>
    where
        T: Serialize + ?Sized,
    {
        self.submit_with_options(task_name, args, EnqueueOptions::default())
            .await
    }

    /// Submit `args` as JSON to a specific queue
    pub async fn submit_to_queue<T>(
        &self,
        task_name: &str,
        args: &T,
        queue_name: &str,
    ) -> DispatchResult<TaskId>
    where
        T: Serialize + ?Sized,
    {
        self.submit_with_options(task_name, args, EnqueueOptions::new().queue(queue_name))
            .await
    }

    pub async fn submit_with_options<T>(
        &self,
        task_name: &str,
        args: &T,
        options: EnqueueOptions,
    ) -> DispatchResult<TaskId>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(args)?;
        self.enqueue(task_name, payload, options).await
    }

    /// Submit several tasks of the same name
    pub async fn submit_batch<T>(
        &self,
        task_name: &str,
        batch: &[T],
    ) -> DispatchResult<Vec<TaskId>>
    where
        T: Serialize,
    {
        let mut task_ids = Vec::with_capacity(batch.len());
        for args in batch {
            task_ids.push(self.submit(task_name, args).await?);
        }
        Ok(task_ids)
    }

    /// Current state of a task's outcome
    pub async fn get_result(&self, task_id: TaskId) -> DispatchResult<ResultQuery> {
        self.dispatcher.get_result(task_id).await
    }

    /// Wait for a task to finish and return its raw value.
    ///
    /// Failures and timeouts come back as `TaskFailure` / `TaskTimeout`; an
    /// unknown or expired id as `TaskNotFound`.
    pub async fn wait_for_result(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> DispatchResult<Vec<u8>> {
        let started = tokio::time::Instant::now();

        loop {
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    return Err(DispatchError::timeout("wait_for_result"));
                }
            }

            match self.dispatcher.get_result(task_id).await? {
                ResultQuery::Ready(record) => {
                    let message = record.error.unwrap_or_else(|| "unknown error".to_string());
                    return match record.status {
                        ResultStatus::Success => Ok(record.value.unwrap_or_default()),
                        ResultStatus::Failure => Err(DispatchError::TaskFailure {
                            task_id: task_id.to_string(),
                            message,
                        }),
                        ResultStatus::Timeout => Err(DispatchError::TaskTimeout {
                            task_id: task_id.to_string(),
                            message,
                        }),
                    };
                }
                ResultQuery::Pending => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                ResultQuery::NotFound => {
                    return Err(DispatchError::TaskNotFound {
                        task_id: task_id.to_string(),
                    })
                }
            }
        }
    }

    /// Wait for a task and decode its JSON return value
    pub async fn wait_for_json<R>(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> DispatchResult<R>
    where
        R: DeserializeOwned,
    {
        let value = self.wait_for_result(task_id, timeout).await?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Submit and wait in one call
    pub async fn submit_and_wait<T, R>(
        &self,
        task_name: &str,
        args: &T,
        timeout: Option<Duration>,
    ) -> DispatchResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let task_id = self.submit(task_name, args).await?;
        self.wait_for_json(task_id, timeout).await
    }

    pub async fn stats(&self) -> DispatchStats {
        self.dispatcher.stats().await
    }

    /// Get access to the underlying dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

#[async_trait]
impl TaskProducer for TaskClient {
    async fn enqueue(
        &self,
        task_name: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> DispatchResult<TaskId> {
        TaskClient::enqueue(self, task_name, payload, options).await
    }
}
