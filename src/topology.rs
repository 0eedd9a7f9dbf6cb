//! Static queue topology: named queues bound to routing keys on a direct exchange

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;
use crate::error::{DispatchError, DispatchResult};

/// Exchange kinds known to AMQP-style brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
}

/// A declared queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub routing_key: String,
    pub weight: u32,
}

/// The set of queues, fixed at startup
#[derive(Debug, Clone)]
pub struct QueueTopology {
    queues: Vec<Queue>,
    by_name: HashMap<String, usize>,
    by_routing_key: HashMap<String, usize>,
    default_queue: String,
    exchange_type: ExchangeType,
}

impl QueueTopology {
    /// Create an empty direct-exchange topology with the given default queue name
    pub fn new<S: Into<String>>(default_queue: S) -> Self {
        Self {
            queues: Vec::new(),
            by_name: HashMap::new(),
            by_routing_key: HashMap::new(),
            default_queue: default_queue.into(),
            exchange_type: ExchangeType::Direct,
        }
    }

    /// Build and validate the topology described by `config`
    pub fn from_config(config: &Config) -> DispatchResult<Self> {
        if config.task_default_exchange_type != ExchangeType::Direct {
            return Err(DispatchError::config(format!(
                "unsupported exchange type {:?}, only direct is supported",
                config.task_default_exchange_type
            )));
        }
        if config.task_queues.is_empty() {
            return Err(DispatchError::config("task_queues must define at least one queue"));
        }

        let mut topology = Self::new(config.task_default_queue.clone());
        for queue in &config.task_queues {
            topology.define_weighted(&queue.name, &queue.routing_key, queue.weight)?;
        }

        let default = topology.default_queue()?;
        if !config.task_default_routing_key.is_empty()
            && default.routing_key != config.task_default_routing_key
        {
            return Err(DispatchError::config(format!(
                "task_default_routing_key {} does not match routing key {} of default queue {}",
                config.task_default_routing_key, default.routing_key, default.name
            )));
        }

        Ok(topology)
    }

    /// Declare a queue with weight 1
    pub fn define(&mut self, name: &str, routing_key: &str) -> DispatchResult<()> {
        self.define_weighted(name, routing_key, 1)
    }

    /// Declare a queue with an explicit scheduling weight
    pub fn define_weighted(
        &mut self,
        name: &str,
        routing_key: &str,
        weight: u32,
    ) -> DispatchResult<()> {
        if name.is_empty() {
            return Err(DispatchError::config("queue name must not be empty"));
        }
        if self.by_name.contains_key(name) {
            return Err(DispatchError::DuplicateQueue {
                name: name.to_string(),
            });
        }
        if let Some(&existing) = self.by_routing_key.get(routing_key) {
            return Err(DispatchError::config(format!(
                "routing key {} already binds queue {}",
                routing_key, self.queues[existing].name
            )));
        }
        if weight == 0 {
            return Err(DispatchError::config(format!(
                "queue {} must have a positive weight",
                name
            )));
        }

        let index = self.queues.len();
        self.queues.push(Queue {
            name: name.to_string(),
            routing_key: routing_key.to_string(),
            weight,
        });
        self.by_name.insert(name.to_string(), index);
        self.by_routing_key.insert(routing_key.to_string(), index);
        Ok(())
    }

    /// The configured default queue; a dangling default is a config error
    pub fn default_queue(&self) -> DispatchResult<&Queue> {
        self.get(&self.default_queue).ok_or_else(|| {
            DispatchError::config(format!(
                "default queue {} is not among the defined queues",
                self.default_queue
            ))
        })
    }

    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.by_name.get(name).map(|&i| &self.queues[i])
    }

    /// Resolve the queue bound to `routing_key`
    pub fn by_routing_key(&self, routing_key: &str) -> Option<&Queue> {
        self.by_routing_key.get(routing_key).map(|&i| &self.queues[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Queues in declaration order
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn define_rejects_duplicate_names() {
        let mut topology = QueueTopology::new("default");
        assert_ok!(topology.define("default", "task.default"));
        let err = assert_err!(topology.define("default", "task.again"));
        assert!(matches!(err, DispatchError::DuplicateQueue { .. }));
        assert_eq!(topology.queues().len(), 1);
    }

    #[test]
    fn routing_keys_are_unique_on_a_direct_exchange() {
        let mut topology = QueueTopology::new("default");
        assert_ok!(topology.define("default", "task.default"));
        assert_err!(topology.define("other", "task.default"));
    }

    #[test]
    fn default_queue_must_be_defined() {
        let mut topology = QueueTopology::new("default");
        assert_ok!(topology.define("high_priority", "task.high"));
        assert_err!(topology.default_queue());

        assert_ok!(topology.define("default", "task.default"));
        assert_eq!(assert_ok!(topology.default_queue()).routing_key, "task.default");
    }

    #[test]
    fn from_config_keeps_declaration_order_and_keys() {
        let topology = assert_ok!(QueueTopology::from_config(&Config::default()));
        let names: Vec<_> = topology.queues().iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["default", "high_priority", "low_priority"]);
        assert_eq!(
            topology.by_routing_key("task.high").map(|q| q.name.as_str()),
            Some("high_priority")
        );
        assert_eq!(topology.exchange_type(), ExchangeType::Direct);
    }

    #[test]
    fn mismatched_default_routing_key_is_a_config_error() {
        let config = Config {
            task_default_routing_key: "task.high".to_string(),
            ..Config::default()
        };
        assert_err!(QueueTopology::from_config(&config));
    }
}
