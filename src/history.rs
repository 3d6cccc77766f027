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

//! Paged, newest-first transaction history of one account.
//!
//! Pages are fetched only when asked for, without taking any lock. The cursor
//! is the id of the last record handed out, so a history can be dropped and
//! resumed later from [`TransactionHistory::cursor`].

use crate::base::{AccountId, TransactionId};
use crate::error::LedgerError;
use crate::executor::Executor;
use crate::transaction::TransactionRecord;
use futures::stream::{self, Stream, TryStreamExt};
use serde::Serialize;

/// One page of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub records: Vec<TransactionRecord>,
    /// Pass back to continue after this page; `None` on the last page.
    pub next_cursor: Option<TransactionId>,
}

/// Lazy reader over an account's ledger records.
pub struct TransactionHistory {
    executor: Executor,
    account: AccountId,
    cursor: Option<TransactionId>,
    page_size: usize,
    exhausted: bool,
}

impl TransactionHistory {
    pub(crate) fn new(
        executor: Executor,
        account: AccountId,
        cursor: Option<TransactionId>,
        page_size: usize,
    ) -> Self {
        Self {
            executor,
            account,
            cursor,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    /// Resume point: everything newer than this has already been returned.
    pub fn cursor(&self) -> Option<TransactionId> {
        self.cursor
    }

    /// Fetches the next page, or `None` once the history is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>, LedgerError> {
        if self.exhausted {
            return Ok(None);
        }
        let records = self
            .executor
            .read(
                "transactions_page",
                self.executor
                    .store()
                    .transactions_page(self.account, self.cursor, self.page_size),
            )
            .await?;

        if records.len() < self.page_size {
            self.exhausted = true;
        }
        if records.is_empty() {
            return Ok(None);
        }
        if let Some(last) = records.last() {
            self.cursor = Some(last.id);
        }
        let next_cursor = if self.exhausted { None } else { self.cursor };
        Ok(Some(Page {
            records,
            next_cursor,
        }))
    }

    /// Flattens the remaining pages into a stream of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<TransactionRecord, LedgerError>> + Send {
        stream::try_unfold(self, |mut history| async move {
            let next = history.next_page().await?.map(|page| {
                let records = stream::iter(page.records.into_iter().map(Ok::<_, LedgerError>));
                (records, history)
            });
            Ok::<_, LedgerError>(next)
        })
        .try_flatten()
    }
}
