use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use tally_core::{Delivery, QueueDepth, QueueError, TaskQueue};

use crate::open;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Durable task queue backed by a single SQLite table.
///
/// A received message stays in the table with a lease; it is deleted on
/// `ack` and becomes visible again when the lease runs out. The row tag
/// doubles as the delivery tag and `attempts` guards against stale
/// consumers resolving a delivery that was already handed to someone else.
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
    lease: Duration,
    poll_interval: Duration,
}

fn unavailable(e: rusqlite::Error) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl SqliteTaskQueue {
    pub fn new(path: &str, busy_timeout: Duration) -> Result<Self, QueueError> {
        Self::with_lease(path, busy_timeout, DEFAULT_LEASE)
    }

    pub fn with_lease(path: &str, busy_timeout: Duration, lease: Duration) -> Result<Self, QueueError> {
        let conn = open(path, busy_timeout).map_err(unavailable)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_messages (
                tag INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body BLOB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                leased_until INTEGER,
                enqueued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages(queue, tag);
            ",
        )
        .map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn try_receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let now = now_millis();

        let next = tx
            .query_row(
                "SELECT tag, attempts, body FROM queue_messages
                 WHERE queue = ?1 AND (leased_until IS NULL OR leased_until <= ?2)
                 ORDER BY tag LIMIT 1",
                params![queue, now],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?, row.get::<_, Vec<u8>>(2)?)),
            )
            .optional()
            .map_err(unavailable)?;

        let Some((tag, attempts, body)) = next else {
            return Ok(None);
        };
        if attempts > 0 {
            tracing::debug!(queue, tag, attempts, "Redelivering task");
        }
        let attempt = attempts + 1;
        tx.execute(
            "UPDATE queue_messages SET attempts = ?1, leased_until = ?2 WHERE tag = ?3",
            params![attempt, now + self.lease.as_millis() as i64, tag],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;

        Ok(Some(Delivery {
            queue: queue.to_string(),
            tag: tag as u64,
            attempt,
            body,
        }))
    }

    /// Runs `sql` against the delivery's row while it is still leased to
    /// this attempt.
    fn resolve(&self, delivery: &Delivery, sql: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                sql,
                params![delivery.tag as i64, delivery.attempt, delivery.queue],
            )
            .map_err(unavailable)?;
        if changed == 0 {
            return Err(QueueError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            });
        }
        Ok(())
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn publish_raw(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue_messages (queue, body, enqueued_at) VALUES (?1, ?2, ?3)",
            params![queue, body, now_millis()],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_receive(queue)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= give_up {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(give_up - now));
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.resolve(
            delivery,
            "DELETE FROM queue_messages
             WHERE tag = ?1 AND attempts = ?2 AND queue = ?3 AND leased_until IS NOT NULL",
        )
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.resolve(
                delivery,
                "UPDATE queue_messages SET leased_until = NULL
                 WHERE tag = ?1 AND attempts = ?2 AND queue = ?3 AND leased_until IS NOT NULL",
            )
        } else {
            self.ack(delivery)
        }
    }

    fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let conn = self.conn.lock().unwrap();
        let (ready, in_flight) = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN leased_until IS NULL OR leased_until <= ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN leased_until > ?2 THEN 1 ELSE 0 END), 0)
                 FROM queue_messages WHERE queue = ?1",
                params![queue, now_millis()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(unavailable)?;
        Ok(QueueDepth {
            ready: ready as u64,
            in_flight: in_flight as u64,
        })
    }
}
