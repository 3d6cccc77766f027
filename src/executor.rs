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

//! Running money-moving operations as units of work.
//!
//! Every operation goes through the same phases:
//!
//! ```text
//!  Initiated ──lock──► Locked ──checks pass──► Validated ──commit──► Committed
//!      │                 │                         │
//!      └─────────────────┴─────────────────────────┴──► Aborted (dropped)
//! ```
//!
//! [`Executor::run`] drives one operation: it re-runs the attempt on
//! serialization conflicts with exponential backoff, and bounds the whole thing
//! (pool wait, lock waits, retries) by the configured wall-clock budget. When the
//! budget runs out, or the caller stops polling, the in-flight [`Work`] is
//! dropped and the store rolls it back; a commit can never happen afterwards.

use crate::account::Account;
use crate::base::AccountId;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, StoreError};
use crate::store::{AccountStore, StoreHandle, UnitOfWork};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Orders two accounts for locking: smaller id first, whatever their roles.
///
/// Every operation that locks more than one account row acquires them in this
/// order, so two operations over the same pair can never wait on each other in
/// a cycle.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Progress of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Initiated,
    Locked,
    Validated,
    Committed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initiated => "INITIATED",
            Phase::Locked => "LOCKED",
            Phase::Validated => "VALIDATED",
            Phase::Committed => "COMMITTED",
        };
        f.write_str(name)
    }
}

/// Failure of a single attempt. Store errors stay raw here so the executor can
/// tell retryable conflicts apart before classifying them.
#[derive(Debug)]
pub(crate) enum TxError {
    Store(StoreError),
    Ledger(LedgerError),
}

impl From<StoreError> for TxError {
    fn from(err: StoreError) -> Self {
        TxError::Store(err)
    }
}

impl From<LedgerError> for TxError {
    fn from(err: LedgerError) -> Self {
        TxError::Ledger(err)
    }
}

/// Logs the phase an aborted unit of work reached.
struct PhaseTracker {
    operation: &'static str,
    phase: Phase,
}

impl PhaseTracker {
    fn advance(&mut self, to: Phase) {
        if to > self.phase {
            self.phase = to;
        }
    }
}

impl Drop for PhaseTracker {
    fn drop(&mut self) {
        if self.phase != Phase::Committed {
            debug!(operation = self.operation, phase = %self.phase, "unit of work aborted");
        }
    }
}

/// An open unit of work with phase tracking.
///
/// Dereferences to the underlying [`UnitOfWork`] for plain reads and writes;
/// account locks go through [`Work::lock`] and [`Work::lock_pair`].
pub(crate) struct Work {
    uow: Box<dyn UnitOfWork>,
    tracker: PhaseTracker,
}

impl Work {
    fn new(uow: Box<dyn UnitOfWork>, operation: &'static str) -> Self {
        Self {
            uow,
            tracker: PhaseTracker {
                operation,
                phase: Phase::Initiated,
            },
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.tracker.phase
    }

    /// Locks one account row; a missing row is [`LedgerError::AccountNotFound`].
    pub async fn lock(&mut self, id: AccountId) -> Result<Account, TxError> {
        let account = self
            .uow
            .lock_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))?;
        self.tracker.advance(Phase::Locked);
        Ok(account)
    }

    /// Locks two distinct account rows in [`lock_order`] and returns them as `(a, b)`.
    pub async fn lock_pair(
        &mut self,
        a: AccountId,
        b: AccountId,
    ) -> Result<(Account, Account), TxError> {
        let (first, second) = lock_order(a, b);
        let first_row = self.lock(first).await?;
        let second_row = self.lock(second).await?;
        if first == a {
            Ok((first_row, second_row))
        } else {
            Ok((second_row, first_row))
        }
    }

    /// All checks passed; only writes remain.
    pub fn validated(&mut self) {
        self.tracker.advance(Phase::Validated);
    }

    pub async fn commit(self) -> Result<(), TxError> {
        let Work { uow, mut tracker } = self;
        uow.commit().await?;
        tracker.advance(Phase::Committed);
        Ok(())
    }
}

impl Deref for Work {
    type Target = dyn UnitOfWork;

    fn deref(&self) -> &Self::Target {
        &*self.uow
    }
}

impl DerefMut for Work {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.uow
    }
}

/// Runs operations against a store with retry and timeout.
#[derive(Clone)]
pub(crate) struct Executor {
    store: StoreHandle,
    config: LedgerConfig,
}

impl Executor {
    pub fn new(store: StoreHandle, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Opens a unit of work for `operation`.
    pub async fn begin(&self, operation: &'static str) -> Result<Work, TxError> {
        let uow = self.store.begin().await?;
        Ok(Work::new(uow, operation))
    }

    /// Runs a lock-free snapshot read under the same wall-clock budget.
    pub async fn read<T, Fut>(&self, operation: &'static str, read: Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let budget = self.config.operation_timeout;
        match tokio::time::timeout(budget, read).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(StoreError::PoolTimeout)) | Err(_) => {
                warn!(operation, ?budget, "read timed out");
                Err(LedgerError::Timeout(budget))
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Runs `attempt` until it succeeds, fails for good, or the budget is spent.
    ///
    /// Each call of `attempt` must open and commit its own unit of work.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TxError>>,
    {
        let budget = self.config.operation_timeout;
        let retry = self.config.retry;

        let attempts = async {
            let mut tries = 0u32;
            loop {
                tries += 1;
                match attempt().await {
                    Ok(value) => return Ok(value),
                    Err(TxError::Store(err)) if err.is_retryable() && tries < retry.max_attempts => {
                        let delay = retry.backoff(tries);
                        warn!(operation, attempt = tries, ?delay, "serialization conflict, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(TxError::Store(StoreError::PoolTimeout)) => {
                        return Err(LedgerError::Timeout(budget));
                    }
                    Err(TxError::Store(err)) => {
                        if err.is_retryable() {
                            warn!(operation, attempts = tries, "serialization conflict, giving up");
                        }
                        return Err(err.into());
                    }
                    Err(TxError::Ledger(err)) => return Err(err),
                }
            }
        };

        match tokio::time::timeout(budget, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, ?budget, "operation timed out, rolled back");
                Err(LedgerError::Timeout(budget))
            }
        }
    }
}
