//! Tally: an HTTP intake that queues balance mutations, and workers that
//! apply them to a balance store and record them in a ledger store.

pub mod api;
pub mod backends;
pub mod config;
pub mod consumer;
pub mod intake;
pub mod orchestrator;
pub mod telemetry;

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread::JoinHandle,
};

use tally_core::{ACCOUNT_CREATION_QUEUE, TRANSACTION_QUEUE};

use crate::{
    backends::Backends,
    config::WorkerConfig,
    consumer::{subscribe, RedeliveryPolicy},
    orchestrator::{AccountProcessor, TransactionProcessor},
};

/// Starts the configured number of consumers on both queues.
pub fn start_workers(
    backends: &Backends,
    config: &WorkerConfig,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let policy = RedeliveryPolicy {
        max_deliveries: config.max_deliveries,
    };
    let transactions = Arc::new(
        TransactionProcessor::new(backends.balances.clone(), backends.ledger.clone())
            .with_replay_guard(config.guard_replays),
    );
    let accounts = Arc::new(AccountProcessor::new(backends.balances.clone()));

    let mut handles = subscribe(
        backends.queue.clone(),
        ACCOUNT_CREATION_QUEUE,
        accounts,
        policy,
        config.poll_interval(),
        config.consumers,
        shutdown.clone(),
    )?;
    handles.extend(subscribe(
        backends.queue.clone(),
        TRANSACTION_QUEUE,
        transactions,
        policy,
        config.poll_interval(),
        config.consumers,
        shutdown,
    )?);
    tracing::info!(
        consumers = config.consumers,
        max_deliveries = config.max_deliveries,
        guard_replays = config.guard_replays,
        "Workers started"
    );
    Ok(handles)
}
