use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use tally_core::{Delivery, QueueDepth, QueueError, TaskQueue};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

struct Message {
    body: Vec<u8>,
    attempts: u32,
}

struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct Channel {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, InFlight>,
}

impl Channel {
    /// Moves deliveries whose lease ran out back to the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some(flight) = self.in_flight.remove(&tag) {
                tracing::warn!(tag, attempts = flight.message.attempts, "Lease expired, requeueing task");
                self.ready.push_front(flight.message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }
}

#[derive(Default)]
struct QueueState {
    channels: HashMap<String, Channel>,
    next_tag: u64,
}

/// Process-local task queue. Same delivery semantics as the durable
/// backends (leases, redelivery counting) but nothing survives a restart.
pub struct InMemoryTaskQueue {
    inner: Mutex<QueueState>,
    available: Condvar,
    lease: Duration,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            lease,
        }
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn publish_raw(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut state = self.inner.lock().unwrap();
        state
            .channels
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                body: body.to_vec(),
                attempts: 0,
            });
        self.available.notify_all();
        Ok(())
    }

    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;
        let mut state = self.inner.lock().unwrap();
        loop {
            let now = Instant::now();
            let tag = state.next_tag + 1;
            let channel = state.channels.entry(queue.to_string()).or_default();
            channel.reclaim_expired(now);

            if let Some(mut message) = channel.ready.pop_front() {
                message.attempts += 1;
                let delivery = Delivery {
                    queue: queue.to_string(),
                    tag,
                    attempt: message.attempts,
                    body: message.body.clone(),
                };
                channel.in_flight.insert(
                    tag,
                    InFlight {
                        message,
                        deadline: now + self.lease,
                    },
                );
                state.next_tag = tag;
                return Ok(Some(delivery));
            }

            if now >= give_up {
                return Ok(None);
            }
            let wake = channel
                .next_deadline()
                .map_or(give_up, |deadline| deadline.min(give_up));
            let timeout = wake.saturating_duration_since(now).max(Duration::from_millis(1));
            state = self.available.wait_timeout(state, timeout).unwrap().0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.inner.lock().unwrap();
        state
            .channels
            .get_mut(&delivery.queue)
            .and_then(|c| c.in_flight.remove(&delivery.tag))
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.inner.lock().unwrap();
        let channel = state
            .channels
            .get_mut(&delivery.queue)
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })?;
        let flight = channel
            .in_flight
            .remove(&delivery.tag)
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })?;
        if requeue {
            channel.ready.push_front(flight.message);
            self.available.notify_all();
        }
        Ok(())
    }

    fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .channels
            .get(queue)
            .map(|c| QueueDepth {
                ready: c.ready.len() as u64,
                in_flight: c.in_flight.len() as u64,
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    const NO_WAIT: Duration = Duration::ZERO;

    #[test]
    fn test_publish_receive_ack() {
        let queue = InMemoryTaskQueue::new();
        queue.publish_raw("q", b"one").unwrap();
        let delivery = queue.receive("q", NO_WAIT).unwrap().unwrap();
        assert_eq!(delivery.body, b"one");
        assert_eq!(delivery.attempt, 1);
        assert_eq!(queue.depth("q").unwrap(), QueueDepth { ready: 0, in_flight: 1 });

        queue.ack(&delivery).unwrap();
        assert_eq!(queue.depth("q").unwrap(), QueueDepth::default());
        assert!(queue.receive("q", NO_WAIT).unwrap().is_none());
        assert!(matches!(queue.ack(&delivery), Err(QueueError::UnknownDelivery { .. })));
    }

    #[test]
    fn test_nack_requeue_increments_attempt() {
        let queue = InMemoryTaskQueue::new();
        queue.publish_raw("q", b"x").unwrap();
        let first = queue.receive("q", NO_WAIT).unwrap().unwrap();
        queue.nack(&first, true).unwrap();
        let second = queue.receive("q", NO_WAIT).unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_ne!(first.tag, second.tag);
    }

    #[test]
    fn test_nack_without_requeue_discards() {
        let queue = InMemoryTaskQueue::new();
        queue.publish_raw("q", b"x").unwrap();
        let delivery = queue.receive("q", NO_WAIT).unwrap().unwrap();
        queue.nack(&delivery, false).unwrap();
        assert_eq!(queue.depth("q").unwrap(), QueueDepth::default());
    }

    #[test]
    fn test_expired_lease_redelivers() {
        let queue = InMemoryTaskQueue::with_lease(Duration::from_millis(10));
        queue.publish_raw("q", b"x").unwrap();
        let abandoned = queue.receive("q", NO_WAIT).unwrap().unwrap();
        let again = queue.receive("q", Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.body, abandoned.body);
        // the stale consumer can no longer resolve its delivery
        assert!(queue.ack(&abandoned).is_err());
    }

    #[test]
    fn test_receive_wakes_on_publish() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.receive("q", Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        queue.publish_raw("q", b"late").unwrap();
        let delivery = consumer.join().unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[test]
    fn test_queues_are_independent() {
        let queue = InMemoryTaskQueue::new();
        queue.publish_raw("a", b"1").unwrap();
        assert!(queue.receive("b", NO_WAIT).unwrap().is_none());
        assert!(queue.receive("a", NO_WAIT).unwrap().is_some());
    }
}
