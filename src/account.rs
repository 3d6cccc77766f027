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

//! Account rows.
//!
//! An [`Account`] is a snapshot of one row of the accounts table. Balance
//! changes are computed here and written back by the account service while it
//! holds the row lock.
//!
//! # Example
//!
//! ```
//! use bank_ledger::{Account, AccountId, Amount, Currency, OwnerId};
//!
//! let account = Account::open(AccountId(1), OwnerId(9), Currency::Usd);
//! let credited = account.credit(Amount(10_000)).unwrap();
//! assert_eq!(credited, Amount(10_000));
//! assert!(account.debit(Amount(1)).is_err());
//! ```

use crate::base::{AccountId, Amount, Currency, OwnerId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Snapshot of an account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub balance: Amount,
    /// Incremented on every balance write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Values needed to insert a new account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewAccount {
    pub owner_id: OwnerId,
    pub currency: Currency,
}

impl Account {
    /// Builds a fresh zero-balance account.
    pub fn open(id: AccountId, owner_id: OwnerId, currency: Currency) -> Self {
        Self {
            id,
            owner_id,
            currency,
            balance: Amount::ZERO,
            version: 0,
            created_at: Utc::now(),
        }
    }

    fn assert_invariants(balance: Amount) {
        debug_assert!(
            balance >= Amount::ZERO,
            "Invariant violated: balance went negative: {balance}"
        );
    }

    /// Balance after crediting `amount`.
    pub fn credit(&self, amount: Amount) -> Result<Amount, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".to_string()));
        }
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Validation("balance overflow".to_string()))?;
        Self::assert_invariants(balance);
        Ok(balance)
    }

    /// Balance after debiting `amount`. Overdraft is never allowed.
    pub fn debit(&self, amount: Amount) -> Result<Amount, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".to_string()));
        }
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds(self.id));
        }
        let balance = self
            .balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientFunds(self.id))?;
        Self::assert_invariants(balance);
        Ok(balance)
    }

    /// Only empty accounts can be closed.
    pub fn ensure_closable(&self) -> Result<(), LedgerError> {
        if self.balance != Amount::ZERO {
            return Err(LedgerError::Validation(format!(
                "account {} still holds {} minor units",
                self.id, self.balance
            )));
        }
        Ok(())
    }
}

impl Serialize for Account {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Account", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("owner_id", &self.owner_id)?;
        state.serialize_field("currency", &self.currency)?;
        state.serialize_field("balance_minor", &self.balance)?;
        state.serialize_field("balance", &self.balance.to_decimal(self.currency))?;
        state.serialize_field("created_at", &self.created_at)?;
        state.end()
    }
}
