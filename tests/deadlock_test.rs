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

//! Deadlock-freedom tests for row locking.
//!
//! Every scenario races transfers that share accounts in both directions on a
//! multi-threaded runtime. A lock cycle would hang the runtime, so each
//! scenario runs under a generous wall-clock guard and must finish well
//! inside it with money conserved.

use bank_ledger::store::memory::InMemoryStore;
use bank_ledger::store::{AccountStore, Store};
use bank_ledger::{
    AccountId, AccountService, Amount, LedgerConfig, LedgerError, OwnerId, PaymentService,
    Tokenizer, TokenizerKey, TransactionType, lock_order,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

const GUARD: Duration = Duration::from_secs(20);

// === Helpers ===

fn ledger() -> AccountService {
    let config = LedgerConfig {
        operation_timeout: Duration::from_secs(10),
        ..LedgerConfig::default()
    };
    AccountService::new(Arc::new(InMemoryStore::new()), config)
}

async fn open_funded(ledger: &AccountService, count: usize, balance: i64) -> Vec<AccountId> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let account = ledger.create_account(OwnerId(1), "USD").await.unwrap();
        ledger
            .update_balance(account.id, Amount(balance), TransactionType::Deposit)
            .await
            .unwrap();
        ids.push(account.id);
    }
    ids
}

async fn total(ledger: &AccountService, ids: &[AccountId]) -> i64 {
    let mut sum = 0;
    for id in ids {
        let balance = ledger.get_account(*id).await.unwrap().balance;
        assert!(balance.minor() >= 0, "account {id} went negative");
        sum += balance.minor();
    }
    sum
}

/// Transfers may lose the funds race; anything else is a bug.
fn expect_ok_or_insufficient<T>(result: Result<T, LedgerError>) {
    match result {
        Ok(_) | Err(LedgerError::InsufficientFunds(_)) => {}
        Err(err) => panic!("unexpected failure: {err}"),
    }
}

// === Lock ordering ===

#[test]
fn lock_order_ignores_transfer_direction() {
    let (a, b) = (AccountId(17), AccountId(4));
    assert_eq!(lock_order(a, b), lock_order(b, a));
    assert_eq!(lock_order(a, b).0, b);
}

// === Scenarios ===

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn opposite_direction_transfers_on_one_pair() {
    let ledger = ledger();
    let ids = open_funded(&ledger, 2, 10_000).await;
    let (a, b) = (ids[0], ids[1]);

    let tasks = (0..200).map(|i| {
        let ledger = ledger.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        tokio::spawn(async move { ledger.transfer(from, to, Amount(75)).await })
    });
    let results = tokio::time::timeout(GUARD, join_all(tasks))
        .await
        .expect("transfers deadlocked");

    for result in results {
        expect_ok_or_insufficient(result.unwrap());
    }
    assert_eq!(total(&ledger, &ids).await, 20_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ring_of_transfers() {
    let ledger = ledger();
    let ids = open_funded(&ledger, 6, 1_000).await;

    let tasks = (0..300).map(|i| {
        let ledger = ledger.clone();
        let from = ids[i % ids.len()];
        let to = ids[(i + 1) % ids.len()];
        tokio::spawn(async move { ledger.transfer(from, to, Amount(10)).await })
    });
    let results = tokio::time::timeout(GUARD, join_all(tasks))
        .await
        .expect("transfer ring deadlocked");

    for result in results {
        expect_ok_or_insufficient(result.unwrap());
    }
    assert_eq!(total(&ledger, &ids).await, 6_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn random_pairs_over_a_small_pool() {
    let ledger = ledger();
    let ids = open_funded(&ledger, 5, 2_000).await;

    let tasks = (0..500usize).map(|i| {
        let ledger = ledger.clone();
        let from = ids[(i * 7) % ids.len()];
        let to = ids[(i * 3 + 1) % ids.len()];
        let amount = Amount(1 + (i as i64 % 50));
        tokio::spawn(async move {
            if from == to {
                return Ok(());
            }
            ledger.transfer(from, to, amount).await.map(|_| ())
        })
    });
    let results = tokio::time::timeout(GUARD, join_all(tasks))
        .await
        .expect("transfers deadlocked");

    for result in results {
        expect_ok_or_insufficient(result.unwrap());
    }
    assert_eq!(total(&ledger, &ids).await, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_accounts_do_not_wait_on_each_other() {
    let store = InMemoryStore::new();
    let ledger = AccountService::new(Arc::new(store.clone()), LedgerConfig::default());
    let ids = open_funded(&ledger, 4, 100).await;

    let mut holder = store.begin().await.unwrap();
    holder.lock_account(ids[0]).await.unwrap();
    holder.lock_account(ids[1]).await.unwrap();

    tokio::time::timeout(
        Duration::from_millis(500),
        ledger.transfer(ids[2], ids[3], Amount(50)),
    )
    .await
    .expect("transfer on unrelated accounts was blocked")
    .unwrap();
    drop(holder);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn payments_card_blocks_and_transfers_interleave() {
    let ledger = ledger();
    let ids = open_funded(&ledger, 2, 5_000).await;
    let key = TokenizerKey::new(b"deadlock-test-key-0001".to_vec()).unwrap();
    let payments = PaymentService::new(ledger.clone(), Tokenizer::new(&key).unwrap());
    let card_id = payments
        .create_card(ids[0], "4111111111111111")
        .await
        .unwrap()
        .id;

    let mut tasks = Vec::new();
    for i in 0..150 {
        let ledger = ledger.clone();
        let payments = payments.clone();
        let (a, b) = (ids[0], ids[1]);
        tasks.push(tokio::spawn(async move {
            match i % 5 {
                0 => payments.block_card(card_id).await.map(|_| ()),
                1 => payments.unblock_card(card_id).await.map(|_| ()),
                2 => ledger.transfer(b, a, Amount(20)).await.map(|_| ()),
                3 => ledger.transfer(a, b, Amount(20)).await.map(|_| ()),
                _ => payments
                    .process_payment(card_id, Amount(15), None)
                    .await
                    .map(|_| ()),
            }
        }));
    }
    let results = tokio::time::timeout(GUARD, join_all(tasks))
        .await
        .expect("mixed workload deadlocked");

    let mut paid = 0i64;
    for (i, result) in results.into_iter().enumerate() {
        match result.unwrap() {
            Ok(()) if i % 5 == 4 => paid += 15,
            Ok(()) | Err(LedgerError::InsufficientFunds(_)) | Err(LedgerError::CardBlocked(_)) => {}
            Err(err) => panic!("unexpected failure: {err}"),
        }
    }
    assert_eq!(total(&ledger, &ids).await, 10_000 - paid);
}
