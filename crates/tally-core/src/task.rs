use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::QueueError, models::TransactionKind};

pub const ACCOUNT_CREATION_QUEUE: &str = "account_creation";
pub const TRANSACTION_QUEUE: &str = "transaction";

/// Name of the queue that receives tasks given up on from `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dead_letter", queue)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CreateAccount,
    ProcessTransaction,
}

impl TaskKind {
    pub fn queue(&self) -> &'static str {
        match self {
            TaskKind::CreateAccount => ACCOUNT_CREATION_QUEUE,
            TaskKind::ProcessTransaction => TRANSACTION_QUEUE,
        }
    }
}

/// Envelope carried by the queue. `payload` is the JSON of one of the
/// payload types below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Task {
    pub fn new<P: Serialize>(kind: TaskKind, payload: &P) -> Result<Self, QueueError> {
        let payload = serde_json::to_value(payload).map_err(|e| QueueError::Encode(e.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(|e| QueueError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        P::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreationPayload {
    /// Assigned by intake so the caller learns the id before processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub name: String,
    pub initial_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub account_id: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub reference_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn envelope_wire_shape() {
        let payload = TransactionPayload {
            account_id: "acc-1".into(),
            amount: dec!(60.00),
            kind: TransactionKind::Debit,
            reference_id: "ref-1".into(),
        };
        let task = Task::new(TaskKind::ProcessTransaction, &payload).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&task.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "process_transaction");
        assert_eq!(json["payload"]["account_id"], "acc-1");
        assert_eq!(json["payload"]["type"], "debit");
        assert_eq!(json["payload"]["reference_id"], "ref-1");
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn payload_accepts_numeric_amounts() {
        let task = Task::decode(
            br#"{"id":"t","type":"process_transaction","created_at":"2024-01-01T00:00:00Z",
                 "payload":{"account_id":"a","amount":50.25,"type":"credit","reference_id":"r"}}"#,
        )
        .unwrap();
        let payload: TransactionPayload = task.payload().unwrap();
        assert_eq!(payload.amount, dec!(50.25));
        assert_eq!(payload.kind, TransactionKind::Credit);
    }

    #[test]
    fn payload_missing_account_id_fails() {
        let task = Task::decode(
            br#"{"id":"t","type":"process_transaction","created_at":"2024-01-01T00:00:00Z",
                 "payload":{"amount":"5","type":"credit","reference_id":"r"}}"#,
        )
        .unwrap();
        assert!(task.payload::<TransactionPayload>().is_err());
    }

    #[test]
    fn account_payload_without_id_is_accepted() {
        let payload: AccountCreationPayload =
            serde_json::from_str(r#"{"name":"Alice","initial_amount":"100.00"}"#).unwrap();
        assert_eq!(payload.account_id, None);
        assert_eq!(payload.initial_amount, dec!(100.00));
    }

    #[test]
    fn queues_by_kind() {
        assert_eq!(TaskKind::CreateAccount.queue(), ACCOUNT_CREATION_QUEUE);
        assert_eq!(TaskKind::ProcessTransaction.queue(), TRANSACTION_QUEUE);
        assert_eq!(dead_letter_queue(TRANSACTION_QUEUE), "transaction.dead_letter");
    }
}
