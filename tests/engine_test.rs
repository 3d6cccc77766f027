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

//! Account and payment service integration tests.

use bank_ledger::store::memory::InMemoryStore;
use bank_ledger::store::{AccountStore, Store};
use bank_ledger::{
    AccountId, AccountService, Amount, LedgerConfig, LedgerError, OwnerId, PaymentService,
    RetryPolicy, Tokenizer, TokenizerKey, TransactionStatus, TransactionType,
};
use std::sync::Arc;
use std::time::Duration;

const CARD: &str = "5555 5555 5555 4444";

fn ledger_with(config: LedgerConfig) -> (AccountService, InMemoryStore) {
    let store = InMemoryStore::new();
    (AccountService::new(Arc::new(store.clone()), config), store)
}

fn ledger() -> (AccountService, InMemoryStore) {
    ledger_with(LedgerConfig::default())
}

fn payments(accounts: AccountService) -> PaymentService {
    let key = TokenizerKey::new(b"integration-test-key".to_vec()).unwrap();
    PaymentService::new(accounts, Tokenizer::new(&key).unwrap())
}

async fn open(ledger: &AccountService, balance: i64) -> AccountId {
    let account = ledger.create_account(OwnerId(1), "RUB").await.unwrap();
    if balance > 0 {
        ledger
            .update_balance(account.id, Amount(balance), TransactionType::Deposit)
            .await
            .unwrap();
    }
    account.id
}

async fn balance(ledger: &AccountService, id: AccountId) -> Amount {
    ledger.get_account(id).await.unwrap().balance
}

// === Scenarios ===

#[tokio::test]
async fn deposit_into_new_account() {
    let (ledger, store) = ledger();
    let a = open(&ledger, 0).await;
    assert_eq!(balance(&ledger, a).await, Amount::ZERO);

    let change = ledger
        .update_balance(a, Amount(10_000), TransactionType::Deposit)
        .await
        .unwrap();
    assert_eq!(change.account.balance, Amount(10_000));
    assert_eq!(change.record.kind, TransactionType::Deposit);
    assert_eq!(change.record.status, TransactionStatus::Completed);
    assert_eq!(store.ledger_len(), 1);
}

#[tokio::test]
async fn transfer_moves_money_with_one_record() {
    let (ledger, store) = ledger();
    let a = open(&ledger, 10_000).await;
    let b = open(&ledger, 0).await;

    let receipt = ledger.transfer(a, b, Amount(5_000)).await.unwrap();
    assert_eq!(receipt.source.balance, Amount(5_000));
    assert_eq!(receipt.destination.balance, Amount(5_000));
    assert_eq!(receipt.record.kind, TransactionType::Transfer);
    assert_eq!(receipt.record.status, TransactionStatus::Completed);
    assert_eq!(receipt.record.source, Some(a));
    assert_eq!(receipt.record.destination, Some(b));
    assert_eq!(store.ledger_len(), 2);
}

#[tokio::test]
async fn transfer_beyond_balance_is_rejected() {
    let (ledger, store) = ledger();
    let a = open(&ledger, 5_000).await;
    let b = open(&ledger, 0).await;

    assert_eq!(
        ledger.transfer(a, b, Amount(6_000)).await,
        Err(LedgerError::InsufficientFunds(a))
    );
    assert_eq!(balance(&ledger, a).await, Amount(5_000));
    assert_eq!(balance(&ledger, b).await, Amount::ZERO);
    assert_eq!(store.ledger_len(), 1);
}

#[tokio::test]
async fn transfer_of_entire_balance_leaves_zero() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 700).await;
    let b = open(&ledger, 0).await;
    ledger.transfer(a, b, Amount(700)).await.unwrap();
    assert_eq!(balance(&ledger, a).await, Amount::ZERO);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 100).await;
    let b = open(&ledger, 0).await;
    for amount in [0, -5] {
        assert!(matches!(
            ledger.transfer(a, b, Amount(amount)).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger
                .update_balance(a, Amount(amount), TransactionType::Deposit)
                .await,
            Err(LedgerError::Validation(_))
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_transfers_keep_the_total() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 5_000).await;
    let b = open(&ledger, 5_000).await;

    let (ab, ba) = tokio::join!(
        ledger.transfer(a, b, Amount(3_000)),
        ledger.transfer(b, a, Amount(3_000)),
    );
    ab.unwrap();
    ba.unwrap();

    let (x, y) = (balance(&ledger, a).await, balance(&ledger, b).await);
    assert_eq!(x.minor() + y.minor(), 10_000);
    assert!(x.minor() >= 0 && y.minor() >= 0);
}

#[tokio::test]
async fn issuing_the_same_card_twice_conflicts() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 0).await;
    let payments = payments(ledger);

    payments.create_card(a, CARD).await.unwrap();
    assert!(matches!(
        payments.create_card(a, CARD).await,
        Err(LedgerError::Conflict(_))
    ));
    assert_eq!(payments.get_cards(a).await.unwrap().len(), 1);
}

// === Payments ===

#[tokio::test]
async fn payment_records_a_correlated_withdrawal() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 1_000).await;
    let payments = payments(ledger.clone());
    let card = payments.create_card(a, CARD).await.unwrap();

    let receipt = payments
        .process_payment(card.id, Amount(400), Some("order-1".to_string()))
        .await
        .unwrap();
    assert_eq!(receipt.record.correlation_id.as_deref(), Some("order-1"));
    assert_eq!(balance(&ledger, a).await, Amount(600));

    let page = ledger.transactions_page(a, None, None).await.unwrap();
    assert_eq!(page.records[0].id, receipt.record.id);
}

#[tokio::test]
async fn correlation_ids_are_unique_across_accounts() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 1_000).await;
    let b = open(&ledger, 1_000).await;
    let payments = payments(ledger);
    let card_a = payments.create_card(a, CARD).await.unwrap();
    let card_b = payments.create_card(b, "4012 8888 8888 1881").await.unwrap();

    payments
        .process_payment(card_a.id, Amount(10), Some("shared".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        payments
            .process_payment(card_b.id, Amount(10), Some("shared".to_string()))
            .await,
        Err(LedgerError::Conflict(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_payments_never_overdraw() {
    let (ledger, _) = ledger();
    let a = open(&ledger, 1_000).await;
    let payments = payments(ledger.clone());
    let card_id = payments.create_card(a, CARD).await.unwrap().id;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let payments = payments.clone();
            tokio::spawn(async move { payments.process_payment(card_id, Amount(100), None).await })
        })
        .collect();

    let mut approved = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => approved += 1,
            Err(err) => assert_eq!(err, LedgerError::InsufficientFunds(a)),
        }
    }
    assert_eq!(approved, 10);
    assert_eq!(balance(&ledger, a).await, Amount::ZERO);
}

// === Failure handling ===

#[tokio::test]
async fn serialization_conflicts_are_retried() {
    let (ledger, store) = ledger_with(LedgerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        ..LedgerConfig::default()
    });
    let a = open(&ledger, 100).await;
    let b = open(&ledger, 0).await;

    store.inject_serialization_failures(2);
    ledger.transfer(a, b, Amount(40)).await.unwrap();
    assert_eq!(balance(&ledger, b).await, Amount(40));
}

#[tokio::test]
async fn persistent_conflicts_surface_and_change_nothing() {
    let (ledger, store) = ledger_with(LedgerConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        ..LedgerConfig::default()
    });
    let a = open(&ledger, 100).await;
    let b = open(&ledger, 0).await;
    let records = store.ledger_len();

    store.inject_serialization_failures(5);
    assert!(matches!(
        ledger.transfer(a, b, Amount(40)).await,
        Err(LedgerError::Conflict(_))
    ));
    store.inject_serialization_failures(0);
    assert_eq!(balance(&ledger, a).await, Amount(100));
    assert_eq!(store.ledger_len(), records);
}

#[tokio::test]
async fn lock_wait_past_the_budget_times_out() {
    let timeout = Duration::from_millis(50);
    let (ledger, store) = ledger_with(LedgerConfig {
        operation_timeout: timeout,
        ..LedgerConfig::default()
    });
    let a = open(&ledger, 100).await;
    let b = open(&ledger, 0).await;

    let mut holder = store.begin().await.unwrap();
    holder.lock_account(b).await.unwrap();
    assert_eq!(
        ledger.transfer(a, b, Amount(10)).await,
        Err(LedgerError::Timeout(timeout))
    );
    drop(holder);

    assert_eq!(balance(&ledger, a).await, Amount(100));
    ledger.transfer(a, b, Amount(10)).await.unwrap();
}

#[tokio::test]
async fn cancelled_transfer_rolls_back_and_releases_locks() {
    let (ledger, store) = ledger();
    let a = open(&ledger, 100).await;
    let b = open(&ledger, 0).await;
    let records = store.ledger_len();

    let mut holder = store.begin().await.unwrap();
    holder.lock_account(b).await.unwrap();

    let task = {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.transfer(a, b, Amount(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    drop(holder);

    assert_eq!(balance(&ledger, a).await, Amount(100));
    assert_eq!(balance(&ledger, b).await, Amount::ZERO);
    assert_eq!(store.ledger_len(), records);

    tokio::time::timeout(Duration::from_secs(1), ledger.transfer(a, b, Amount(60)))
        .await
        .expect("row locks were not released")
        .unwrap();
}
