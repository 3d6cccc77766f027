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

//! # Bank Ledger
//!
//! Ledger and payment consistency engine: accounts, transfers, an immutable
//! transaction history and card payments over tokenized card numbers, safe
//! under concurrent requests racing on the same account rows.
//!
//! ## Core Components
//!
//! - [`AccountService`]: Account creation, deposits, withdrawals, transfers, closure
//! - [`PaymentService`]: Card issuance and lifecycle, card payments
//! - [`store`]: Storage ports, with an in-memory backend and a PostgreSQL one
//!   behind the `postgres` feature
//! - [`Tokenizer`]: Keyed one-way hashing of card numbers
//! - [`LedgerError`]: Error taxonomy surfaced by both services
//!
//! ## Example
//!
//! ```
//! use bank_ledger::{AccountService, Amount, LedgerConfig, OwnerId, TransactionType};
//! use bank_ledger::store::memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let ledger = AccountService::new(Arc::new(InMemoryStore::new()), LedgerConfig::default());
//!
//! let a = ledger.create_account(OwnerId(1), "RUB").await.unwrap();
//! let b = ledger.create_account(OwnerId(2), "RUB").await.unwrap();
//! ledger
//!     .update_balance(a.id, Amount(10_000), TransactionType::Deposit)
//!     .await
//!     .unwrap();
//!
//! let receipt = ledger.transfer(a.id, b.id, Amount(5_000)).await.unwrap();
//! assert_eq!(receipt.source.balance, Amount(5_000));
//! assert_eq!(receipt.destination.balance, Amount(5_000));
//! # });
//! ```
//!
//! ## Concurrency
//!
//! There is no in-process lock around balances. Every operation is one unit of
//! work against the store; operations that touch an account take its row lock,
//! smaller account id first, and hold it until commit. Operations on disjoint
//! accounts run in parallel.

pub mod account;
pub mod account_service;
mod base;
pub mod card;
pub mod config;
pub mod error;
mod executor;
pub mod history;
pub mod http;
pub mod payment_service;
pub mod store;
pub mod tokenizer;
pub mod transaction;

pub use account::Account;
pub use account_service::{AccountService, BalanceChange, TransferReceipt};
pub use base::{AccountId, Amount, CardId, Currency, OwnerId, TransactionId};
pub use card::{Card, CardStatus};
pub use config::{LedgerConfig, RetryPolicy};
pub use error::{LedgerError, StoreError};
pub use executor::{Phase, lock_order};
pub use history::{Page, TransactionHistory};
pub use payment_service::{PaymentReceipt, PaymentService};
pub use tokenizer::{CardNumber, CardToken, Tokenizer, TokenizerKey};
pub use transaction::{TransactionRecord, TransactionStatus, TransactionType};
