use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tally_core::{dead_letter_queue, Delivery, QueueError, TaskQueue};

use crate::orchestrator::{Disposition, TaskHandler};

/// When to give up on a task that keeps asking to be requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Deliveries after which a requeue becomes a dead letter. 0 never gives up.
    pub max_deliveries: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self { max_deliveries: 10 }
    }
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self { max_deliveries: 0 }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_deliveries > 0 && attempt >= self.max_deliveries
    }
}

/// What the consumer did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    Dropped,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "ack",
            Outcome::Requeued => "requeue",
            Outcome::Dropped => "drop",
            Outcome::DeadLettered => "dead_letter",
        }
    }
}

/// Pulls deliveries from one queue and resolves them with a handler.
pub struct Consumer {
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    handler: Arc<dyn TaskHandler>,
    policy: RedeliveryPolicy,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(queue: Arc<dyn TaskQueue>, queue_name: &str, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            queue,
            queue_name: queue_name.to_string(),
            handler,
            policy: RedeliveryPolicy::default(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Waits up to the poll interval for one delivery and resolves it.
    /// Returns `None` when nothing arrived.
    pub fn poll_once(&self) -> Result<Option<Outcome>, QueueError> {
        let Some(delivery) = self.queue.receive(&self.queue_name, self.poll_interval)? else {
            return Ok(None);
        };

        let span = tracing::info_span!("task", queue = %self.queue_name, tag = delivery.tag, attempt = delivery.attempt);
        let _enter = span.enter();

        let started = Instant::now();
        let disposition = self.handler.handle(&delivery.body);
        let outcome = self.resolve(&delivery, disposition)?;

        metrics::histogram!(
            "tally_task_duration_seconds",
            started.elapsed().as_secs_f64(),
            "queue" => self.queue_name.clone()
        );
        metrics::increment_counter!(
            "tally_tasks_total",
            "queue" => self.queue_name.clone(),
            "outcome" => outcome.as_str()
        );
        Ok(Some(outcome))
    }

    fn resolve(&self, delivery: &Delivery, disposition: Disposition) -> Result<Outcome, QueueError> {
        match disposition {
            Disposition::Ack => {
                self.queue.ack(delivery)?;
                Ok(Outcome::Acked)
            }
            Disposition::Drop => {
                self.queue.nack(delivery, false)?;
                Ok(Outcome::Dropped)
            }
            Disposition::Requeue if self.policy.exhausted(delivery.attempt) => {
                let dead_letters = dead_letter_queue(&self.queue_name);
                match self.queue.publish_raw(&dead_letters, &delivery.body) {
                    Ok(()) => {
                        tracing::error!(
                            attempt = delivery.attempt,
                            dead_letter_queue = %dead_letters,
                            "Giving up on task after repeated failures"
                        );
                        // A failed ack leaves the task in both queues.
                        if let Err(e) = self.queue.ack(delivery) {
                            tracing::error!(
                                error = %e,
                                dead_letter_queue = %dead_letters,
                                "Dead-lettered task was not acknowledged and will be delivered again"
                            );
                            return Err(e);
                        }
                        Ok(Outcome::DeadLettered)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dead-letter publish failed, requeueing instead");
                        self.queue.nack(delivery, true)?;
                        Ok(Outcome::Requeued)
                    }
                }
            }
            Disposition::Requeue => {
                self.queue.nack(delivery, true)?;
                Ok(Outcome::Requeued)
            }
        }
    }

    /// Consumes until `shutdown` is set. A delivery already received always
    /// runs to its disposition.
    pub fn run(&self, shutdown: &AtomicBool) {
        tracing::info!(queue = %self.queue_name, "Consumer started");
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll_once() {
                match e {
                    // Lease ran out while handling; the task is someone else's now.
                    QueueError::UnknownDelivery { .. } => {
                        tracing::warn!(queue = %self.queue_name, error = %e, "Delivery expired before it was resolved")
                    }
                    _ => {
                        tracing::error!(queue = %self.queue_name, error = %e, "Queue error, retrying");
                        thread::sleep(self.poll_interval);
                    }
                }
            }
        }
        tracing::info!(queue = %self.queue_name, "Consumer stopped");
    }
}

/// Starts `consumers` competing consumers on `queue_name`, each on its own
/// thread.
pub fn subscribe(
    queue: Arc<dyn TaskQueue>,
    queue_name: &str,
    handler: Arc<dyn TaskHandler>,
    policy: RedeliveryPolicy,
    poll_interval: Duration,
    consumers: usize,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..consumers.max(1))
        .map(|n| {
            let consumer = Consumer::new(queue.clone(), queue_name, handler.clone())
                .with_policy(policy)
                .with_poll_interval(poll_interval);
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("{}-{}", queue_name, n))
                .spawn(move || consumer.run(&shutdown))
        })
        .collect()
}
