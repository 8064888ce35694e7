//! Runtime Configuration

use serde::{Deserialize, Serialize};

/// What `send_event` does when the destination queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for free capacity; nothing is lost, senders feel backpressure
    #[default]
    Block,
    /// Discard the event and log a warning
    Drop,
}

/// Configuration shared by every component of a runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each component's inbound queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub queue_full: QueueFullPolicy,
}

fn default_queue_capacity() -> usize {
    128
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_full: QueueFullPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_queue_full(mut self, policy: QueueFullPolicy) -> Self {
        self.queue_full = policy;
        self
    }
}
