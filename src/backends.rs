use std::{sync::Arc, time::Duration};

use thiserror::Error;

use tally_core::{BalanceStore, LedgerStore, QueueError, StoreError, TaskQueue};
use tally_memory::{InMemoryBalanceStore, InMemoryLedgerStore, InMemoryTaskQueue};
use tally_postgres::{PostgresBalanceStore, PostgresLedgerStore};
use tally_sqlite::{SqliteBalanceStore, SqliteLedgerStore, SqliteTaskQueue};

use crate::config::{Config, Role};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unsupported {what} backend: {url}")]
    UnsupportedBackend { what: &'static str, url: String },
    #[error("{0} backend 'memory' cannot be shared between processes; use role 'all'")]
    MemoryWithSplitRole(&'static str),
    #[error("failed to open {what} backend: {source}")]
    Store { what: &'static str, source: StoreError },
    #[error("failed to open queue: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("failed to start: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

fn store_err(what: &'static str) -> impl Fn(StoreError) -> StartupError {
    move |source| StartupError::Store { what, source }
}

/// A parsed backend URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendUrl {
    Memory,
    Sqlite(String),
    Postgres(String),
}

impl BackendUrl {
    pub fn parse(what: &'static str, url: &str) -> Result<Self, StartupError> {
        let url = url.trim();
        if url == "memory" {
            Ok(BackendUrl::Memory)
        } else if let Some(path) = url.strip_prefix("sqlite:") {
            Ok(BackendUrl::Sqlite(path.to_string()))
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(BackendUrl::Postgres(url.to_string()))
        } else {
            Err(StartupError::UnsupportedBackend {
                what,
                url: url.to_string(),
            })
        }
    }
}

/// The three stores a process works against, opened once at startup and
/// handed to every component that needs them.
#[derive(Clone)]
pub struct Backends {
    pub balances: Arc<dyn BalanceStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            balances: Arc::new(InMemoryBalanceStore::new()),
            ledger: Arc::new(InMemoryLedgerStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
        }
    }

    /// Opens the configured backends. Blocking; call before entering the
    /// async runtime.
    pub fn open(config: &Config) -> Result<Self, StartupError> {
        let storage = &config.storage;
        let worker = &config.worker;
        let balance_url = BackendUrl::parse("balance", &storage.balance)?;
        let ledger_url = BackendUrl::parse("ledger", &storage.ledger)?;
        let queue_url = BackendUrl::parse("queue", &storage.queue)?;

        if config.role != Role::All {
            for (what, url) in [("balance", &balance_url), ("ledger", &ledger_url), ("queue", &queue_url)] {
                if *url == BackendUrl::Memory {
                    return Err(StartupError::MemoryWithSplitRole(what));
                }
            }
        }

        let queue: Arc<dyn TaskQueue> = match queue_url {
            BackendUrl::Memory => Arc::new(InMemoryTaskQueue::with_lease(worker.lease())),
            BackendUrl::Sqlite(path) => Arc::new(
                SqliteTaskQueue::with_lease(&path, Duration::from_secs(5), worker.lease())?
                    .with_poll_interval(worker.poll_interval().min(Duration::from_millis(50))),
            ),
            BackendUrl::Postgres(_) => {
                return Err(StartupError::UnsupportedBackend {
                    what: "queue",
                    url: storage.queue.clone(),
                })
            }
        };

        let lock_timeout = worker.lock_timeout();

        let balances: Arc<dyn BalanceStore> = match balance_url {
            BackendUrl::Memory => Arc::new(InMemoryBalanceStore::with_lock_timeout(lock_timeout)),
            BackendUrl::Sqlite(path) => {
                Arc::new(SqliteBalanceStore::new(&path, lock_timeout).map_err(store_err("balance"))?)
            }
            BackendUrl::Postgres(url) => {
                Arc::new(PostgresBalanceStore::new(&url, lock_timeout).map_err(store_err("balance"))?)
            }
        };

        let ledger: Arc<dyn LedgerStore> = match ledger_url {
            BackendUrl::Memory => Arc::new(InMemoryLedgerStore::new()),
            BackendUrl::Sqlite(path) => {
                Arc::new(SqliteLedgerStore::new(&path, lock_timeout).map_err(store_err("ledger"))?)
            }
            BackendUrl::Postgres(url) => Arc::new(PostgresLedgerStore::new(&url).map_err(store_err("ledger"))?),
        };

        tracing::info!(
            balance = %storage.balance,
            ledger = %storage.ledger,
            queue = %storage.queue,
            "Backends opened"
        );
        Ok(Self { balances, ledger, queue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        assert_eq!(BackendUrl::parse("x", "memory").unwrap(), BackendUrl::Memory);
        assert_eq!(
            BackendUrl::parse("x", "sqlite:/tmp/t.db").unwrap(),
            BackendUrl::Sqlite("/tmp/t.db".into())
        );
        assert_eq!(
            BackendUrl::parse("x", "postgres://u@h/db").unwrap(),
            BackendUrl::Postgres("postgres://u@h/db".into())
        );
        assert!(BackendUrl::parse("x", "redis://h").is_err());
    }

    #[test]
    fn test_memory_rejected_for_split_roles() {
        let mut config = Config::default();
        config.role = Role::Worker;
        assert!(matches!(
            Backends::open(&config),
            Err(StartupError::MemoryWithSplitRole("balance"))
        ));
        config.role = Role::All;
        assert!(Backends::open(&config).is_ok());
    }

    #[test]
    fn test_postgres_queue_rejected() {
        let mut config = Config::default();
        config.storage.queue = "postgres://localhost/q".into();
        assert!(matches!(
            Backends::open(&config),
            Err(StartupError::UnsupportedBackend { what: "queue", .. })
        ));
    }

    #[test]
    fn test_open_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db = format!("sqlite:{}", dir.path().join("tally.db").display());
        let mut config = Config::default();
        config.role = Role::Worker;
        config.storage.balance = db.clone();
        config.storage.ledger = db.clone();
        config.storage.queue = db;
        let backends = Backends::open(&config).unwrap();
        assert_eq!(backends.queue.depth("transaction").unwrap().ready, 0);
    }
}
