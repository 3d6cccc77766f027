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

//! PostgreSQL store.
//!
//! One [`PgUnitOfWork`] is one `READ COMMITTED` transaction on a pooled
//! connection. Account locks are `SELECT … FOR UPDATE`; dropping the unit of
//! work drops the `sqlx` transaction, which rolls it back. The schema lives in
//! `migrations/0001_init.sql`.

use super::{AccountStore, CardStore, Store, StoreResult, TransactionLedger, UnitOfWork};
use crate::account::{Account, NewAccount};
use crate::base::{AccountId, Amount, CardId, OwnerId, TransactionId};
use crate::card::{Card, CardStatus, NewCard};
use crate::error::StoreError;
use crate::tokenizer::CardToken;
use crate::transaction::{NewTransaction, TransactionRecord, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;

const ACCOUNT_COLUMNS: &str = "id, owner_id, currency, balance_minor, version, created_at";
const TRANSACTION_COLUMNS: &str = "id, source_account_id, dest_account_id, type, amount_minor, \
                                   status, correlation_id, created_at";
const CARD_COLUMNS: &str = "id, account_id, token, masked_display, status, created_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::PoolTimeout,
            sqlx::Error::Database(db) => {
                let constraint = db.constraint().unwrap_or("unknown").to_string();
                match db.code().as_deref() {
                    Some("40001") | Some("40P01") => StoreError::Serialization,
                    Some("23505") => StoreError::UniqueViolation { constraint },
                    Some("23514") => StoreError::CheckViolation { constraint },
                    _ => StoreError::Backend(err.to_string()),
                }
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn decode<T, E: std::fmt::Display>(column: &str, value: Result<T, E>) -> StoreResult<T> {
    value.map_err(|e| StoreError::Backend(format!("bad value in column {column}: {e}")))
}

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    owner_id: i64,
    currency: String,
    balance_minor: i64,
    version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> StoreResult<Self> {
        Ok(Account {
            id: AccountId(row.id),
            owner_id: OwnerId(row.owner_id),
            currency: decode("currency", row.currency.parse())?,
            balance: Amount(row.balance_minor),
            version: row.version,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: i64,
    source_account_id: Option<i64>,
    dest_account_id: Option<i64>,
    #[sqlx(rename = "type")]
    kind: String,
    amount_minor: i64,
    status: String,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> StoreResult<Self> {
        Ok(TransactionRecord {
            id: TransactionId(row.id),
            source: row.source_account_id.map(AccountId),
            destination: row.dest_account_id.map(AccountId),
            kind: decode("type", row.kind.parse())?,
            amount: Amount(row.amount_minor),
            status: decode("status", row.status.parse())?,
            correlation_id: row.correlation_id,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct CardRow {
    id: i64,
    account_id: i64,
    token: String,
    masked_display: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CardRow> for Card {
    type Error = StoreError;

    fn try_from(row: CardRow) -> StoreResult<Self> {
        Ok(Card {
            id: CardId(row.id),
            account_id: AccountId(row.account_id),
            token: CardToken(row.token),
            masked: row.masked_display,
            status: decode("status", row.status.parse())?,
            created_at: row.created_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Process-wide connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a bounded pool. Waiting for a free connection fails with
    /// [`StoreError::PoolTimeout`] after `acquire_timeout`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork {
            tx,
            locked: HashSet::new(),
            pending: HashSet::new(),
        }))
    }

    async fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Account::try_from).transpose()
    }

    async fn accounts_by_owner(&self, owner: OwnerId) -> StoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = $1 ORDER BY id"
        ))
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn transactions_page(
        &self,
        account: AccountId,
        before: Option<TransactionId>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE (source_account_id = $1 OR dest_account_id = $1) AND id < $2 \
             ORDER BY id DESC LIMIT $3"
        ))
        .bind(account.0)
        .bind(before.map_or(i64::MAX, |id| id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn card(&self, id: CardId) -> StoreResult<Option<Card>> {
        let row: Option<CardRow> =
            sqlx::query_as(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Card::try_from).transpose()
    }

    async fn cards_by_account(&self, account: AccountId) -> StoreResult<Vec<Card>> {
        let rows: Vec<CardRow> = sqlx::query_as(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE account_id = $1 ORDER BY id"
        ))
        .bind(account.0)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}

/// One open database transaction.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<AccountId>,
    pending: HashSet<TransactionId>,
}

impl PgUnitOfWork {
    fn ensure_locked(&self, id: AccountId) -> StoreResult<()> {
        if self.locked.contains(&id) {
            Ok(())
        } else {
            Err(StoreError::NotLocked(format!("account {id}")))
        }
    }
}

#[async_trait]
impl AccountStore for PgUnitOfWork {
    async fn insert_account(&mut self, account: NewAccount) -> StoreResult<Account> {
        let row: AccountRow = sqlx::query_as(&format!(
            "INSERT INTO accounts (owner_id, currency, balance_minor, version) \
             VALUES ($1, $2, 0, 0) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account.owner_id.0)
        .bind(account.currency.code())
        .fetch_one(&mut *self.tx)
        .await?;
        Account::try_from(row)
    }

    async fn lock_account(&mut self, id: AccountId) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        if row.is_some() {
            self.locked.insert(id);
        }
        row.map(Account::try_from).transpose()
    }

    async fn write_balance(&mut self, id: AccountId, balance: Amount) -> StoreResult<Account> {
        self.ensure_locked(id)?;
        let row: AccountRow = sqlx::query_as(&format!(
            "UPDATE accounts SET balance_minor = $2, version = version + 1 \
             WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.0)
        .bind(balance.0)
        .fetch_one(&mut *self.tx)
        .await?;
        Account::try_from(row)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        self.ensure_locked(id)?;
        sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionLedger for PgUnitOfWork {
    async fn append(&mut self, tx: NewTransaction) -> StoreResult<TransactionRecord> {
        let row: TransactionRow = sqlx::query_as(&format!(
            "INSERT INTO transactions \
             (source_account_id, dest_account_id, type, amount_minor, status, correlation_id) \
             VALUES ($1, $2, $3, $4, 'PENDING', $5) RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(tx.source.map(|id| id.0))
        .bind(tx.destination.map(|id| id.0))
        .bind(tx.kind.as_str())
        .bind(tx.amount.0)
        .bind(tx.correlation_id)
        .fetch_one(&mut *self.tx)
        .await?;
        let record = TransactionRecord::try_from(row)?;
        self.pending.insert(record.id);
        Ok(record)
    }

    async fn finalize(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> StoreResult<TransactionRecord> {
        if !self.pending.contains(&id) {
            return Err(StoreError::Backend(format!(
                "record {id} was not appended by this unit of work"
            )));
        }
        TransactionStatus::Pending
            .transition(status)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let row: TransactionRow = sqlx::query_as(&format!(
            "UPDATE transactions SET status = $2 WHERE id = $1 AND status = 'PENDING' \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(id.0)
        .bind(status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        self.pending.remove(&id);
        TransactionRecord::try_from(row)
    }

    async fn find_by_correlation(
        &mut self,
        correlation_id: &str,
    ) -> StoreResult<Option<TransactionRecord>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE correlation_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(TransactionRecord::try_from).transpose()
    }
}

#[async_trait]
impl CardStore for PgUnitOfWork {
    async fn insert_card(&mut self, card: NewCard) -> StoreResult<Card> {
        let row: CardRow = sqlx::query_as(&format!(
            "INSERT INTO cards (account_id, token, masked_display, status) \
             VALUES ($1, $2, $3, 'ACTIVE') RETURNING {CARD_COLUMNS}"
        ))
        .bind(card.account_id.0)
        .bind(card.token.0)
        .bind(card.masked)
        .fetch_one(&mut *self.tx)
        .await?;
        Card::try_from(row)
    }

    async fn card(&mut self, id: CardId) -> StoreResult<Option<Card>> {
        let row: Option<CardRow> =
            sqlx::query_as(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&mut *self.tx)
                .await?;
        row.map(Card::try_from).transpose()
    }

    async fn card_by_token(&mut self, token: &CardToken) -> StoreResult<Option<Card>> {
        let row: Option<CardRow> =
            sqlx::query_as(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE token = $1"))
                .bind(token.as_str())
                .fetch_optional(&mut *self.tx)
                .await?;
        row.map(Card::try_from).transpose()
    }

    async fn cards_of_account(&mut self, account: AccountId) -> StoreResult<Vec<Card>> {
        let rows: Vec<CardRow> = sqlx::query_as(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE account_id = $1 ORDER BY id"
        ))
        .bind(account.0)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows)
    }

    async fn set_card_status(&mut self, id: CardId, status: CardStatus) -> StoreResult<Card> {
        let row: Option<CardRow> = sqlx::query_as(&format!(
            "UPDATE cards SET status = $2 WHERE id = $1 RETURNING {CARD_COLUMNS}"
        ))
        .bind(id.0)
        .bind(status.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Card::try_from)
            .transpose()?
            .ok_or_else(|| StoreError::Backend(format!("card {id} missing")))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        if !this.pending.is_empty() {
            return Err(StoreError::Backend(
                "ledger record left pending at commit".to_string(),
            ));
        }
        this.tx.commit().await?;
        Ok(())
    }
}
