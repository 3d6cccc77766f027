// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ledger records.
//!
//! Records follow a state machine:
//! - [`Pending`] → [`Completed`] (same unit of work that moved the money)
//! - [`Pending`] → [`Failed`]
//!
//! Terminal records are never modified again.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed

use crate::base::{AccountId, Amount, TransactionId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::Transfer => "TRANSFER",
        }
    }
}

impl TransactionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Validates a status change. Only `Pending` may move, and only to a terminal state.
    pub fn transition(self, to: TransactionStatus) -> Result<TransactionStatus, LedgerError> {
        match (self, to) {
            (Self::Pending, Self::Completed | Self::Failed) => Ok(to),
            _ => Err(LedgerError::Internal(format!(
                "illegal ledger status change {} -> {}",
                self.as_str(),
                to.as_str()
            ))),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(Self::Deposit),
            "WITHDRAWAL" => Ok(Self::Withdrawal),
            "TRANSFER" => Ok(Self::Transfer),
            _ => Err(LedgerError::Validation(format!("unknown transaction type '{s}'"))),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(LedgerError::Validation(format!("unknown transaction status '{s}'"))),
        }
    }
}

/// One ledger row.
///
/// Deposits carry only `destination`, withdrawals only `source`, transfers both.
/// `amount` is signed: negative for money leaving the referenced account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub source: Option<AccountId>,
    pub destination: Option<AccountId>,
    pub kind: TransactionType,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn involves(&self, account: AccountId) -> bool {
        self.source == Some(account) || self.destination == Some(account)
    }
}

/// A record about to be appended. Always starts out `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub source: Option<AccountId>,
    pub destination: Option<AccountId>,
    pub kind: TransactionType,
    pub amount: Amount,
    pub correlation_id: Option<String>,
}

impl NewTransaction {
    pub fn deposit(account: AccountId, amount: Amount) -> Self {
        Self {
            source: None,
            destination: Some(account),
            kind: TransactionType::Deposit,
            amount,
            correlation_id: None,
        }
    }

    pub fn withdrawal(account: AccountId, amount: Amount) -> Self {
        Self {
            source: Some(account),
            destination: None,
            kind: TransactionType::Withdrawal,
            amount: amount.negate(),
            correlation_id: None,
        }
    }

    pub fn transfer(source: AccountId, destination: AccountId, amount: Amount) -> Self {
        Self {
            source: Some(source),
            destination: Some(destination),
            kind: TransactionType::Transfer,
            amount,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Materializes the row with a store-allocated id.
    pub fn into_record(self, id: TransactionId, created_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id,
            source: self.source,
            destination: self.destination,
            kind: self.kind,
            amount: self.amount,
            status: TransactionStatus::Pending,
            correlation_id: self.correlation_id,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_moves_to_terminal_states() {
        assert_eq!(
            TransactionStatus::Pending.transition(TransactionStatus::Completed),
            Ok(TransactionStatus::Completed)
        );
        assert_eq!(
            TransactionStatus::Pending.transition(TransactionStatus::Failed),
            Ok(TransactionStatus::Failed)
        );
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(
            TransactionStatus::Completed
                .transition(TransactionStatus::Failed)
                .is_err()
        );
        assert!(
            TransactionStatus::Failed
                .transition(TransactionStatus::Completed)
                .is_err()
        );
        assert!(
            TransactionStatus::Pending
                .transition(TransactionStatus::Pending)
                .is_err()
        );
    }

    #[test]
    fn enums_round_trip_through_their_column_text() {
        for kind in [
            TransactionType::Deposit,
            TransactionType::Withdrawal,
            TransactionType::Transfer,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionType>().unwrap(), kind);
        }
        assert_eq!("completed".parse::<TransactionStatus>().unwrap(), TransactionStatus::Completed);
    }

    #[test]
    fn withdrawal_records_are_negative() {
        let tx = NewTransaction::withdrawal(AccountId(1), Amount(500));
        assert_eq!(tx.amount, Amount(-500));
        assert_eq!(tx.source, Some(AccountId(1)));
        assert_eq!(tx.destination, None);
    }

    #[test]
    fn transfer_references_both_accounts() {
        let record = NewTransaction::transfer(AccountId(1), AccountId(2), Amount(5000))
            .into_record(TransactionId(10), Utc::now());
        assert!(record.involves(AccountId(1)));
        assert!(record.involves(AccountId(2)));
        assert!(!record.involves(AccountId(3)));
        assert_eq!(record.status, TransactionStatus::Pending);
    }

    #[test]
    fn serializes_with_uppercase_enums() {
        let record = NewTransaction::deposit(AccountId(1), Amount(100))
            .into_record(TransactionId(1), Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "DEPOSIT");
        assert_eq!(json["status"], "PENDING");
    }
}
