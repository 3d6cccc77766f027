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

//! Storage ports.
//!
//! A [`Store`] serves lock-free snapshot reads and opens units of work. A
//! [`UnitOfWork`] is one database transaction: row locks taken through it are
//! held until [`UnitOfWork::commit`], and dropping it without committing rolls
//! everything back. That drop is also how cancellation and timeouts abort.

use crate::account::{Account, NewAccount};
use crate::base::{AccountId, Amount, CardId, OwnerId, TransactionId};
use crate::card::{Card, CardStatus, NewCard};
use crate::error::StoreError;
use crate::tokenizer::CardToken;
use crate::transaction::{NewTransaction, TransactionRecord, TransactionStatus};
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub type StoreResult<T> = Result<T, StoreError>;

/// Account rows as seen from inside a unit of work.
#[async_trait]
pub trait AccountStore: Send {
    async fn insert_account(&mut self, account: NewAccount) -> StoreResult<Account>;

    /// `SELECT … FOR UPDATE`: blocks until the row lock is free, then returns the
    /// latest committed row. `None` if the account does not exist.
    async fn lock_account(&mut self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Writes a new balance and bumps the version. The row must be locked.
    async fn write_balance(&mut self, id: AccountId, balance: Amount) -> StoreResult<Account>;

    /// Removes the row. The row must be locked.
    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()>;
}

/// Append-only ledger as seen from inside a unit of work.
#[async_trait]
pub trait TransactionLedger: Send {
    /// Appends a `Pending` record.
    async fn append(&mut self, tx: NewTransaction) -> StoreResult<TransactionRecord>;

    /// Moves a record appended by this unit of work to a terminal status.
    async fn finalize(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> StoreResult<TransactionRecord>;

    async fn find_by_correlation(
        &mut self,
        correlation_id: &str,
    ) -> StoreResult<Option<TransactionRecord>>;
}

/// Card rows as seen from inside a unit of work.
#[async_trait]
pub trait CardStore: Send {
    async fn insert_card(&mut self, card: NewCard) -> StoreResult<Card>;

    async fn card(&mut self, id: CardId) -> StoreResult<Option<Card>>;

    async fn card_by_token(&mut self, token: &CardToken) -> StoreResult<Option<Card>>;

    async fn cards_of_account(&mut self, account: AccountId) -> StoreResult<Vec<Card>>;

    async fn set_card_status(&mut self, id: CardId, status: CardStatus) -> StoreResult<Card>;
}

/// One atomic transaction over all three tables.
#[async_trait]
pub trait UnitOfWork: AccountStore + TransactionLedger + CardStore {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Process-scoped storage handle.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Accounts of one owner in ascending id order.
    async fn accounts_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<Account>>;

    /// Up to `limit` records touching `account`, newest first, strictly older than
    /// `before` when given.
    async fn transactions_page(
        &self,
        account: AccountId,
        before: Option<TransactionId>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>>;

    async fn card(&self, id: CardId) -> StoreResult<Option<Card>>;

    async fn cards_by_account(&self, account: AccountId) -> StoreResult<Vec<Card>>;
}

pub type StoreHandle = Arc<dyn Store>;
