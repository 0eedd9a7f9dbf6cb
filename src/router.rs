//! Task name to queue routing

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::TaskRoute;
use crate::error::{DispatchError, DispatchResult};
use crate::topology::QueueTopology;

/// Maps task names to queue names.
///
/// Exact-match overrides win; everything else lands on the default queue.
/// All targets are checked against the topology at construction, so
/// [`Router::route`] cannot fail.
#[derive(Debug, Clone)]
pub struct Router {
    overrides: HashMap<String, Arc<str>>,
    default_queue: Arc<str>,
}

impl Router {
    pub fn new(
        topology: &QueueTopology,
        routes: &HashMap<String, TaskRoute>,
    ) -> DispatchResult<Self> {
        let default_queue: Arc<str> = match topology.default_queue() {
            Ok(queue) => Arc::from(queue.name.as_str()),
            Err(_) => {
                return Err(DispatchError::Routing {
                    task_name: "<default>".to_string(),
                })
            }
        };

        let mut overrides = HashMap::with_capacity(routes.len());
        for (task_name, route) in routes {
            let queue = topology
                .get(&route.queue)
                .ok_or_else(|| DispatchError::UnknownQueue {
                    queue: route.queue.clone(),
                })?;
            overrides.insert(task_name.clone(), Arc::from(queue.name.as_str()));
        }

        debug!(
            "Router ready with {} overrides, default queue {}",
            overrides.len(),
            default_queue
        );

        Ok(Self {
            overrides,
            default_queue,
        })
    }

    /// Queue for `task_name`
    pub fn route(&self, task_name: &str) -> &str {
        self.overrides
            .get(task_name)
            .unwrap_or(&self.default_queue)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn has_override(&self, task_name: &str) -> bool {
        self.overrides.contains_key(task_name)
    }
}
