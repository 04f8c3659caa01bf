use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use tally_core::{
    fits_money_scale, AccountCreationPayload, QueueError, Task, TaskKind, TaskQueue, TransactionKind, TransactionPayload,
    MONEY_SCALE,
};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    #[error("failed to enqueue task: {0}")]
    Broker(#[from] QueueError),
}

impl IntakeError {
    /// Value of the `outcome` label on `tally_intake_total`.
    pub fn outcome(&self) -> &'static str {
        match self {
            IntakeError::Validation(_) => "rejected",
            IntakeError::Broker(_) => "broker_error",
        }
    }
}

fn record<T>(kind: &'static str, result: &Result<T, IntakeError>) {
    let outcome = match result {
        Ok(_) => "accepted",
        Err(e) => e.outcome(),
    };
    metrics::increment_counter!("tally_intake_total", "kind" => kind, "outcome" => outcome);
}

/// Validates requests and turns them into queued tasks. Nothing here touches
/// the balance or ledger stores.
pub struct Intake {
    queue: Arc<dyn TaskQueue>,
}

fn non_blank<'a>(field: &str, value: &'a str) -> Result<&'a str, IntakeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IntakeError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

fn check_scale(field: &str, value: Decimal) -> Result<(), IntakeError> {
    if !fits_money_scale(value) {
        return Err(IntakeError::Validation(format!(
            "{} must have at most {} decimal places",
            field, MONEY_SCALE
        )));
    }
    Ok(())
}

impl Intake {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Enqueues a balance mutation and returns the reference id that will
    /// identify its ledger record.
    pub fn submit_transaction(
        &self,
        account_id: &str,
        amount: Decimal,
        kind: TransactionKind,
    ) -> Result<String, IntakeError> {
        let result = self.enqueue_transaction(account_id, amount, kind);
        record("transaction", &result);
        result
    }

    /// Enqueues an account creation and returns the id the account will have.
    pub fn submit_account_creation(&self, name: &str, initial_amount: Decimal) -> Result<String, IntakeError> {
        let result = self.enqueue_account_creation(name, initial_amount);
        record("account", &result);
        result
    }

    fn enqueue_transaction(
        &self,
        account_id: &str,
        amount: Decimal,
        kind: TransactionKind,
    ) -> Result<String, IntakeError> {
        let account_id = non_blank("account_id", account_id)?;
        if amount <= Decimal::ZERO {
            return Err(IntakeError::Validation("amount must be greater than zero".to_string()));
        }
        check_scale("amount", amount)?;

        let payload = TransactionPayload {
            account_id: account_id.to_string(),
            amount,
            kind,
            reference_id: Uuid::new_v4().to_string(),
        };
        let task = Task::new(TaskKind::ProcessTransaction, &payload)?;
        self.queue.publish(TaskKind::ProcessTransaction.queue(), &task)?;

        tracing::info!(
            task_id = %task.id,
            reference_id = %payload.reference_id,
            account_id,
            %amount,
            kind = kind.as_str(),
            "Transaction accepted"
        );
        Ok(payload.reference_id)
    }

    fn enqueue_account_creation(&self, name: &str, initial_amount: Decimal) -> Result<String, IntakeError> {
        let name = non_blank("name", name)?;
        if initial_amount < Decimal::ZERO {
            return Err(IntakeError::Validation("initial_amount must not be negative".to_string()));
        }
        check_scale("initial_amount", initial_amount)?;

        let account_id = Uuid::new_v4().to_string();
        let payload = AccountCreationPayload {
            account_id: Some(account_id.clone()),
            name: name.to_string(),
            initial_amount,
        };
        let task = Task::new(TaskKind::CreateAccount, &payload)?;
        self.queue.publish(TaskKind::CreateAccount.queue(), &task)?;

        tracing::info!(task_id = %task.id, %account_id, "Account creation accepted");
        Ok(account_id)
    }
}
