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

//! Account service.
//!
//! The [`AccountService`] is the consistency authority for balances. Each public
//! operation runs as exactly one unit of work against the store:
//!
//! - **Create**: inserts a zero-balance account.
//! - **Update balance**: locks the row, credits or debits it, appends one
//!   `DEPOSIT` or `WITHDRAWAL` record.
//! - **Transfer**: locks both rows in canonical order, moves the money, appends
//!   one `TRANSFER` record referencing both accounts.
//! - **Close**: locks the row, requires a zero balance, blocks the account's
//!   cards and deletes the row.
//!
//! # Concurrency
//!
//! There is no in-process lock around balances. Row locks taken through the
//! store serialize operations that share an account; operations on disjoint
//! accounts run fully in parallel.

use crate::account::{Account, NewAccount};
use crate::base::{AccountId, Amount, Currency, OwnerId, TransactionId};
use crate::card::CardStatus;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::executor::{Executor, TxError, Work};
use crate::history::{Page, TransactionHistory};
use crate::store::{AccountStore, CardStore, StoreHandle, TransactionLedger};
use crate::transaction::{NewTransaction, TransactionRecord, TransactionStatus, TransactionType};
use serde::Serialize;
use tracing::{info, instrument};

/// Outcome of a single-account balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceChange {
    pub account: Account,
    pub record: TransactionRecord,
}

/// Outcome of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub source: Account,
    pub destination: Account,
    pub record: TransactionRecord,
}

/// Orchestrates account creation, balance changes and transfers.
#[derive(Clone)]
pub struct AccountService {
    executor: Executor,
}

impl AccountService {
    /// Creates a service over a process-scoped store handle.
    pub fn new(store: StoreHandle, config: LedgerConfig) -> Self {
        Self {
            executor: Executor::new(store, config),
        }
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Opens a zero-balance account.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `currency` is not RUB, USD or EUR.
    #[instrument(skip(self))]
    pub async fn create_account(
        &self,
        owner: OwnerId,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let currency: Currency = currency.parse()?;
        let account = self
            .executor
            .run("create_account", move || async move {
                let mut work = self.executor.begin("create_account").await?;
                let account = work
                    .insert_account(NewAccount {
                        owner_id: owner,
                        currency,
                    })
                    .await?;
                work.validated();
                work.commit().await?;
                Ok::<_, TxError>(account)
            })
            .await?;
        info!(account_id = %account.id, %currency, "account created");
        Ok(account)
    }

    /// Accounts owned by `owner`, ascending by id. Takes no locks.
    pub async fn get_accounts(&self, owner: OwnerId) -> Result<Vec<Account>, LedgerError> {
        self.executor
            .read("get_accounts", self.executor.store().accounts_by_owner(owner))
            .await
    }

    /// Latest committed snapshot of one account. Takes no locks.
    pub async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.executor
            .read("get_account", self.executor.store().account(id))
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Direct deposit or withdrawal.
    ///
    /// | Kind | Behavior |
    /// |------|----------|
    /// | `Deposit` | Credits `amount` |
    /// | `Withdrawal` | Debits `amount`, never below zero |
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `amount` is not positive, or `kind` is `Transfer`.
    /// - [`LedgerError::AccountNotFound`] - No such account.
    /// - [`LedgerError::InsufficientFunds`] - Withdrawal exceeds the balance.
    #[instrument(skip(self))]
    pub async fn update_balance(
        &self,
        account_id: AccountId,
        amount: Amount,
        kind: TransactionType,
    ) -> Result<BalanceChange, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".to_string()));
        }
        if kind == TransactionType::Transfer {
            return Err(LedgerError::Validation(
                "transfers must name a destination account".to_string(),
            ));
        }

        let change = self
            .executor
            .run("update_balance", move || async move {
                let mut work = self.executor.begin("update_balance").await?;
                let account = work.lock(account_id).await?;
                let change = Self::post(&mut work, &account, kind, amount, None).await?;
                work.commit().await?;
                Ok::<_, TxError>(change)
            })
            .await?;
        info!(
            account_id = %account_id,
            kind = %kind,
            amount = %amount,
            balance = %change.account.balance,
            transaction_id = %change.record.id,
            "balance updated"
        );
        Ok(change)
    }

    /// Applies a credit or debit to an account already locked by `work`, and
    /// appends its completed ledger record. Shared with card payments.
    pub(crate) async fn post(
        work: &mut Work,
        account: &Account,
        kind: TransactionType,
        amount: Amount,
        correlation_id: Option<String>,
    ) -> Result<BalanceChange, TxError> {
        let (balance, entry) = match kind {
            TransactionType::Deposit => (
                account.credit(amount)?,
                NewTransaction::deposit(account.id, amount),
            ),
            TransactionType::Withdrawal => (
                account.debit(amount)?,
                NewTransaction::withdrawal(account.id, amount),
            ),
            TransactionType::Transfer => {
                return Err(LedgerError::Validation(
                    "transfers must name a destination account".to_string(),
                )
                .into());
            }
        };
        let entry = match correlation_id {
            Some(correlation) => entry.with_correlation(correlation),
            None => entry,
        };
        work.validated();

        let pending = work.append(entry).await?;
        let account = work.write_balance(account.id, balance).await?;
        let record = work.finalize(pending.id, TransactionStatus::Completed).await?;
        Ok(BalanceChange { account, record })
    }

    /// Moves `amount` from `source` to `destination`.
    ///
    /// Both rows are locked smaller id first, whichever of them is the source, so
    /// opposite-direction transfers over the same pair cannot deadlock. The debit,
    /// the credit and the single `TRANSFER` record commit together or not at all.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - Same account on both sides, or `amount` not positive.
    /// - [`LedgerError::AccountNotFound`] - Either account is missing.
    /// - [`LedgerError::CurrencyMismatch`] - Accounts hold different currencies.
    /// - [`LedgerError::InsufficientFunds`] - Source balance is below `amount`.
    /// - [`LedgerError::Conflict`] - Serialization conflicts outlasted every retry.
    /// - [`LedgerError::Timeout`] - The operation exceeded its budget and was rolled back.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        source: AccountId,
        destination: AccountId,
        amount: Amount,
    ) -> Result<TransferReceipt, LedgerError> {
        if source == destination {
            return Err(LedgerError::Validation(
                "source and destination must differ".to_string(),
            ));
        }
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".to_string()));
        }

        let receipt = self
            .executor
            .run("transfer", move || async move {
                let mut work = self.executor.begin("transfer").await?;
                let (from, to) = work.lock_pair(source, destination).await?;
                if from.currency != to.currency {
                    return Err(LedgerError::CurrencyMismatch {
                        from: from.currency,
                        to: to.currency,
                    }
                    .into());
                }
                let from_balance = from.debit(amount)?;
                let to_balance = to.credit(amount)?;
                work.validated();

                let pending = work
                    .append(NewTransaction::transfer(source, destination, amount))
                    .await?;
                let from = work.write_balance(source, from_balance).await?;
                let to = work.write_balance(destination, to_balance).await?;
                let record = work
                    .finalize(pending.id, TransactionStatus::Completed)
                    .await?;
                work.commit().await?;
                Ok::<_, TxError>(TransferReceipt {
                    source: from,
                    destination: to,
                    record,
                })
            })
            .await?;
        info!(
            source = %source,
            destination = %destination,
            amount = %amount,
            transaction_id = %receipt.record.id,
            "transfer committed"
        );
        Ok(receipt)
    }

    /// Lazy, newest-first history of `account_id`, resuming after `cursor` if given.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AccountNotFound`] - No such account.
    pub async fn get_transactions(
        &self,
        account_id: AccountId,
        cursor: Option<TransactionId>,
        page_size: Option<usize>,
    ) -> Result<TransactionHistory, LedgerError> {
        self.get_account(account_id).await?;
        let page_size = page_size.unwrap_or(self.executor.config().default_page_size);
        Ok(TransactionHistory::new(
            self.executor.clone(),
            account_id,
            cursor,
            page_size,
        ))
    }

    /// One page of history; the shape the HTTP layer returns.
    pub async fn transactions_page(
        &self,
        account_id: AccountId,
        cursor: Option<TransactionId>,
        page_size: Option<usize>,
    ) -> Result<Page, LedgerError> {
        let mut history = self.get_transactions(account_id, cursor, page_size).await?;
        Ok(history.next_page().await?.unwrap_or(Page {
            records: Vec::new(),
            next_cursor: None,
        }))
    }

    /// Closes an empty account. Its cards are blocked in the same unit of work;
    /// ledger and card rows keep the account id.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AccountNotFound`] - No such account.
    /// - [`LedgerError::Validation`] - The balance is not zero.
    #[instrument(skip(self))]
    pub async fn close_account(&self, account_id: AccountId) -> Result<(), LedgerError> {
        self.executor
            .run("close_account", move || async move {
                let mut work = self.executor.begin("close_account").await?;
                let account = work.lock(account_id).await?;
                account.ensure_closable()?;
                work.validated();
                for card in work.cards_of_account(account_id).await? {
                    if !card.is_blocked() {
                        work.set_card_status(card.id, CardStatus::Blocked).await?;
                    }
                }
                work.delete_account(account_id).await?;
                work.commit().await?;
                Ok::<_, TxError>(())
            })
            .await?;
        info!(account_id = %account_id, "account closed");
        Ok(())
    }
}
