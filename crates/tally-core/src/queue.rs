use std::time::Duration;

use crate::{error::QueueError, task::Task};

/// A task handed to one consumer. Must be resolved with `ack` or `nack`;
/// an unresolved delivery is redelivered once its lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
}

/// At-least-once task channel with competing consumers.
pub trait TaskQueue: Send + Sync {
    /// Returns once the broker has accepted the message.
    fn publish_raw(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Waits up to `wait` for a ready task on `queue`.
    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Removes the task permanently.
    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Rejects the task, returning it to the queue when `requeue` is set and
    /// discarding it otherwise.
    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError>;

    fn publish(&self, queue: &str, task: &Task) -> Result<(), QueueError> {
        self.publish_raw(queue, &task.encode()?)
    }
}
