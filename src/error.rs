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

//! Error types for ledger and payment operations.
//!
//! [`StoreError`] is what a storage backend reports. Services never return it;
//! every store failure is classified into a [`LedgerError`] first.

use crate::base::{AccountId, CardId, Currency};
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the account and payment services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("card {0} not found")]
    CardNotFound(CardId),

    /// Debit would take the balance below zero
    #[error("insufficient funds on account {0}")]
    InsufficientFunds(AccountId),

    /// Transfer between accounts held in different currencies
    #[error("currency mismatch: {from} -> {to}")]
    CurrencyMismatch { from: Currency, to: Currency },

    /// Duplicate resource, or a serialization conflict that survived every retry
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("card {0} is blocked")]
    CardBlocked(CardId),

    /// The unit of work did not finish inside its wall-clock budget
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Storage or infrastructure failure; details are in the logs only
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_) | LedgerError::CardNotFound(_)
        )
    }

    /// True for failures the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, LedgerError::Timeout(_) | LedgerError::Internal(_))
    }
}

/// Failures reported by a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Isolation violation detected by the store; the unit of work may be retried
    #[error("serialization failure")]
    Serialization,

    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },

    #[error("check constraint {constraint} violated")]
    CheckViolation { constraint: String },

    /// No connection became available
    #[error("connection pool timed out")]
    PoolTimeout,

    /// A row was written without holding its exclusive lock
    #[error("row {0} written without holding its lock")]
    NotLocked(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization)
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization => {
                LedgerError::Conflict("concurrent update, retries exhausted".to_string())
            }
            StoreError::UniqueViolation { constraint } => {
                LedgerError::Conflict(format!("duplicate value for {constraint}"))
            }
            StoreError::PoolTimeout => LedgerError::Timeout(Duration::ZERO),
            StoreError::CheckViolation { .. }
            | StoreError::NotLocked(_)
            | StoreError::Backend(_) => {
                tracing::error!(error = %err, "storage failure");
                LedgerError::Internal("storage failure".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            LedgerError::InsufficientFunds(AccountId(7)).to_string(),
            "insufficient funds on account 7"
        );
        assert_eq!(
            LedgerError::CurrencyMismatch {
                from: Currency::Usd,
                to: Currency::Eur
            }
            .to_string(),
            "currency mismatch: USD -> EUR"
        );
        assert_eq!(LedgerError::CardBlocked(CardId(3)).to_string(), "card 3 is blocked");
        assert_eq!(
            LedgerError::AccountNotFound(AccountId(1)).to_string(),
            "account 1 not found"
        );
    }

    #[test]
    fn serialization_failures_become_conflicts() {
        let err: LedgerError = StoreError::Serialization.into();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[test]
    fn unique_violations_become_conflicts() {
        let err: LedgerError = StoreError::UniqueViolation {
            constraint: "cards_token_key".to_string(),
        }
        .into();
        assert_eq!(
            err,
            LedgerError::Conflict("duplicate value for cards_token_key".to_string())
        );
    }

    #[test]
    fn backend_details_do_not_leak() {
        let err: LedgerError =
            StoreError::Backend("password authentication failed for user bank".to_string()).into();
        assert_eq!(err, LedgerError::Internal("storage failure".to_string()));
        assert!(!err.is_client_error());
    }

    #[test]
    fn only_serialization_is_retryable() {
        assert!(StoreError::Serialization.is_retryable());
        assert!(!StoreError::PoolTimeout.is_retryable());
        assert!(
            !StoreError::UniqueViolation {
                constraint: "x".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn not_found_class() {
        assert!(LedgerError::CardNotFound(CardId(1)).is_not_found());
        assert!(!LedgerError::CardBlocked(CardId(1)).is_not_found());
    }
}
