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

//! In-process store with relational-transaction semantics.
//!
//! Committed rows live in one [`Mutex`]-protected set of tables that is only
//! held for the duration of a synchronous read or a commit. Each account row
//! has its own async lock in a [`DashMap`]; a unit of work keeps the owned
//! guards until it commits or is dropped, which gives `SELECT … FOR UPDATE`
//! behaviour. Writes are staged inside the unit of work and applied in one
//! step at commit, so a dropped unit of work leaves no trace.

use super::{
    AccountStore, CardStore, Store, StoreResult, TransactionLedger, UnitOfWork,
};
use crate::account::{Account, NewAccount};
use crate::base::{AccountId, Amount, CardId, OwnerId, TransactionId};
use crate::card::{Card, CardStatus, NewCard};
use crate::error::StoreError;
use crate::tokenizer::CardToken;
use crate::transaction::{NewTransaction, TransactionRecord, TransactionStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
    cards: BTreeMap<CardId, Card>,
    card_tokens: HashMap<CardToken, CardId>,
    correlations: HashMap<String, TransactionId>,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<AccountId, Arc<RowLock<()>>>,
    next_account: AtomicI64,
    next_transaction: AtomicI64,
    next_card: AtomicI64,
    injected_conflicts: AtomicUsize,
}

impl Shared {
    fn row_lock(&self, id: AccountId) -> Arc<RowLock<()>> {
        // Clone the Arc out so the map shard is not held while waiting.
        Arc::clone(
            self.row_locks
                .entry(id)
                .or_insert_with(|| Arc::new(RowLock::new(())))
                .value(),
        )
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Thread-safe in-memory store.
///
/// Cloning is cheap and every clone sees the same tables.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: DashMap::new(),
                next_account: AtomicI64::new(1),
                next_transaction: AtomicI64::new(1),
                next_card: AtomicI64::new(1),
                injected_conflicts: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `count` commits fail with [`StoreError::Serialization`],
    /// the way a database reports a serialization conflict. Zero clears any
    /// failures still pending.
    pub fn inject_serialization_failures(&self, count: usize) {
        self.shared.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of committed ledger records.
    pub fn ledger_len(&self) -> usize {
        self.shared.tables.lock().transactions.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork::new(Arc::clone(&self.shared))))
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.shared.tables.lock().accounts.get(&id).cloned())
    }

    async fn accounts_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<Account>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .accounts
            .values()
            .filter(|a| a.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn transactions_page(
        &self,
        account: AccountId,
        before: Option<TransactionId>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let upper = before.unwrap_or(TransactionId(i64::MAX));
        let tables = self.shared.tables.lock();
        Ok(tables
            .transactions
            .range(..upper)
            .rev()
            .map(|(_, tx)| tx)
            .filter(|tx| tx.involves(account))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn card(&self, id: CardId) -> StoreResult<Option<Card>> {
        Ok(self.shared.tables.lock().cards.get(&id).cloned())
    }

    async fn cards_by_account(&self, account: AccountId) -> StoreResult<Vec<Card>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .cards
            .values()
            .filter(|c| c.account_id == account)
            .cloned()
            .collect())
    }
}

/// Row locks held by one unit of work.
///
/// Releasing them also removes lock-table entries that no other unit of work
/// holds or waits on, so the table only tracks rows that are in use.
struct HeldLocks {
    shared: Arc<Shared>,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn contains(&self, id: AccountId) -> bool {
        self.guards.contains_key(&id)
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for (id, guard) in self.guards.drain() {
            drop(guard);
            // Waiters hold a clone of the Arc, so a count of one means only the map is left.
            self.shared
                .row_locks
                .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Staged writes and held row locks of one open transaction.
pub struct MemoryUnitOfWork {
    shared: Arc<Shared>,
    locks: HeldLocks,
    /// `None` marks a deleted row.
    accounts: HashMap<AccountId, Option<Account>>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
    cards: BTreeMap<CardId, Card>,
}

impl MemoryUnitOfWork {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            locks: HeldLocks {
                shared: Arc::clone(&shared),
                guards: HashMap::new(),
            },
            shared,
            accounts: HashMap::new(),
            transactions: BTreeMap::new(),
            cards: BTreeMap::new(),
        }
    }

    fn read_account(&self, id: AccountId) -> Option<Account> {
        match self.accounts.get(&id) {
            Some(staged) => staged.clone(),
            None => self.shared.tables.lock().accounts.get(&id).cloned(),
        }
    }

    fn read_card(&self, id: CardId) -> Option<Card> {
        match self.cards.get(&id) {
            Some(staged) => Some(staged.clone()),
            None => self.shared.tables.lock().cards.get(&id).cloned(),
        }
    }

    fn ensure_locked(&self, id: AccountId) -> StoreResult<()> {
        if self.locks.contains(id) {
            Ok(())
        } else {
            Err(StoreError::NotLocked(format!("accounts/{id}")))
        }
    }
}

#[async_trait]
impl AccountStore for MemoryUnitOfWork {
    async fn insert_account(&mut self, account: NewAccount) -> StoreResult<Account> {
        let id = AccountId(self.shared.next_account.fetch_add(1, Ordering::SeqCst));
        let row = Account::open(id, account.owner_id, account.currency);
        self.accounts.insert(id, Some(row.clone()));
        Ok(row)
    }

    async fn lock_account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        if !self.locks.contains(id) {
            let row = self.shared.row_lock(id);
            let guard = row.lock_owned().await;
            self.locks.guards.insert(id, guard);
        }
        Ok(self.read_account(id))
    }

    async fn write_balance(&mut self, id: AccountId, balance: Amount) -> StoreResult<Account> {
        self.ensure_locked(id)?;
        if balance < Amount::ZERO {
            return Err(StoreError::CheckViolation {
                constraint: "accounts_balance_non_negative".to_string(),
            });
        }
        let mut row = self
            .read_account(id)
            .ok_or_else(|| StoreError::Backend(format!("account {id} vanished under lock")))?;
        row.balance = balance;
        row.version += 1;
        self.accounts.insert(id, Some(row.clone()));
        Ok(row)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        self.ensure_locked(id)?;
        self.accounts.insert(id, None);
        Ok(())
    }
}

#[async_trait]
impl TransactionLedger for MemoryUnitOfWork {
    async fn append(&mut self, tx: NewTransaction) -> StoreResult<TransactionRecord> {
        if let Some(correlation) = &tx.correlation_id {
            let taken = self.shared.tables.lock().correlations.contains_key(correlation)
                || self
                    .transactions
                    .values()
                    .any(|t| t.correlation_id.as_ref() == Some(correlation));
            if taken {
                return Err(StoreError::UniqueViolation {
                    constraint: "transactions_correlation_id_key".to_string(),
                });
            }
        }
        let id = TransactionId(self.shared.next_transaction.fetch_add(1, Ordering::SeqCst));
        let record = tx.into_record(id, Utc::now());
        self.transactions.insert(id, record.clone());
        Ok(record)
    }

    async fn finalize(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> StoreResult<TransactionRecord> {
        let record = self.transactions.get_mut(&id).ok_or_else(|| {
            StoreError::Backend(format!("record {id} was not appended by this unit of work"))
        })?;
        record.status = record
            .status
            .transition(status)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(record.clone())
    }

    async fn find_by_correlation(
        &mut self,
        correlation_id: &str,
    ) -> StoreResult<Option<TransactionRecord>> {
        if let Some(staged) = self
            .transactions
            .values()
            .find(|t| t.correlation_id.as_deref() == Some(correlation_id))
        {
            return Ok(Some(staged.clone()));
        }
        let tables = self.shared.tables.lock();
        Ok(tables
            .correlations
            .get(correlation_id)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }
}

#[async_trait]
impl CardStore for MemoryUnitOfWork {
    async fn insert_card(&mut self, card: NewCard) -> StoreResult<Card> {
        let taken = self.shared.tables.lock().card_tokens.contains_key(&card.token)
            || self.cards.values().any(|c| c.token == card.token);
        if taken {
            return Err(StoreError::UniqueViolation {
                constraint: "cards_token_key".to_string(),
            });
        }
        let id = CardId(self.shared.next_card.fetch_add(1, Ordering::SeqCst));
        let row = card.into_card(id, Utc::now());
        self.cards.insert(id, row.clone());
        Ok(row)
    }

    async fn card(&mut self, id: CardId) -> StoreResult<Option<Card>> {
        Ok(self.read_card(id))
    }

    async fn card_by_token(&mut self, token: &CardToken) -> StoreResult<Option<Card>> {
        if let Some(staged) = self.cards.values().find(|c| &c.token == token) {
            return Ok(Some(staged.clone()));
        }
        let tables = self.shared.tables.lock();
        Ok(tables
            .card_tokens
            .get(token)
            .and_then(|id| tables.cards.get(id))
            .cloned())
    }

    async fn cards_of_account(&mut self, account: AccountId) -> StoreResult<Vec<Card>> {
        let mut merged: BTreeMap<CardId, Card> = {
            let tables = self.shared.tables.lock();
            tables
                .cards
                .values()
                .filter(|c| c.account_id == account)
                .map(|c| (c.id, c.clone()))
                .collect()
        };
        for card in self.cards.values().filter(|c| c.account_id == account) {
            merged.insert(card.id, card.clone());
        }
        Ok(merged.into_values().collect())
    }

    async fn set_card_status(&mut self, id: CardId, status: CardStatus) -> StoreResult<Card> {
        let mut card = self
            .read_card(id)
            .ok_or_else(|| StoreError::Backend(format!("card {id} missing")))?;
        card.status = status;
        self.cards.insert(id, card.clone());
        Ok(card)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        if this
            .transactions
            .values()
            .any(|t| t.status == TransactionStatus::Pending)
        {
            return Err(StoreError::Backend(
                "ledger record left pending at commit".to_string(),
            ));
        }

        let shared = Arc::clone(&this.shared);
        let mut tables = shared.tables.lock();
        if shared.take_injected_conflict() {
            return Err(StoreError::Serialization);
        }

        // Rows inserted by concurrent units of work may have claimed a unique key
        // after it was checked here.
        for card in this.cards.values() {
            if tables
                .card_tokens
                .get(&card.token)
                .is_some_and(|existing| *existing != card.id)
            {
                return Err(StoreError::UniqueViolation {
                    constraint: "cards_token_key".to_string(),
                });
            }
        }
        for tx in this.transactions.values() {
            if let Some(correlation) = &tx.correlation_id
                && tables
                    .correlations
                    .get(correlation)
                    .is_some_and(|existing| *existing != tx.id)
            {
                return Err(StoreError::UniqueViolation {
                    constraint: "transactions_correlation_id_key".to_string(),
                });
            }
        }

        for (id, row) in this.accounts {
            match row {
                Some(account) => {
                    tables.accounts.insert(id, account);
                }
                None => {
                    tables.accounts.remove(&id);
                }
            }
        }
        for (id, tx) in this.transactions {
            if let Some(correlation) = &tx.correlation_id {
                tables.correlations.insert(correlation.clone(), id);
            }
            tables.transactions.insert(id, tx);
        }
        for (id, card) in this.cards {
            tables.card_tokens.insert(card.token.clone(), id);
            tables.cards.insert(id, card);
        }
        drop(tables);
        // Row locks are released here, after the writes are visible.
        drop(this.locks);
        Ok(())
    }
}
