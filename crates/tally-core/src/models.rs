use std::{fmt::Display, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;

/// Number of decimal places money amounts are kept at.
pub const MONEY_SCALE: u32 = 2;

/// Whether `value` can be represented exactly at `MONEY_SCALE`.
pub fn fits_money_scale(value: Decimal) -> bool {
    value.normalize().scale() <= MONEY_SCALE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Credit,
    Debit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
        }
    }

    /// Computes the balance after applying `amount` to `balance`.
    ///
    /// Debits that would take the balance below zero fail with
    /// `InsufficientFunds`; credits always succeed.
    pub fn apply(&self, account_id: &str, balance: Decimal, amount: Decimal) -> Result<Decimal, StoreError> {
        match self {
            TransactionKind::Credit => Ok(balance + amount),
            TransactionKind::Debit => {
                let new_balance = balance - amount;
                if new_balance < Decimal::ZERO {
                    return Err(StoreError::InsufficientFunds {
                        account_id: account_id.to_string(),
                        balance,
                        requested: amount,
                    });
                }
                Ok(new_balance)
            }
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionKind::Credit),
            "debit" => Ok(TransactionKind::Debit),
            other => Err(StoreError::Corrupt(format!("unknown transaction kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub balance: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Input to `BalanceStore::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub id: String,
    pub name: String,
    pub opening_balance: Decimal,
}

impl NewAccount {
    pub fn into_account(self, now: OffsetDateTime) -> Account {
        Account {
            id: self.id,
            name: self.name,
            balance: self.opening_balance.round_dp(MONEY_SCALE),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable ledger entry describing one applied credit or debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub account_id: String,
    pub reference_id: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
