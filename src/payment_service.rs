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

//! Payment service.
//!
//! Issues cards over tokenized card numbers and authorizes card payments. A
//! payment is a withdrawal from the card's account: it takes the same row lock,
//! follows the same funds check and writes one `WITHDRAWAL` record carrying the
//! payment's correlation id.
//!
//! Card status changes lock the owning account first, so a block and a payment
//! on the same card never interleave.

use crate::account::Account;
use crate::account_service::AccountService;
use crate::base::{AccountId, Amount, CardId};
use crate::card::{Card, CardStatus, NewCard};
use crate::error::LedgerError;
use crate::executor::{TxError, Work};
use crate::store::{AccountStore, CardStore, TransactionLedger};
use crate::tokenizer::{CardNumber, Tokenizer};
use crate::transaction::{TransactionRecord, TransactionStatus, TransactionType};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

/// Outcome of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub card_id: CardId,
    pub account_id: AccountId,
    pub record: TransactionRecord,
    /// True when the correlation id matched an earlier payment and nothing was debited.
    pub replayed: bool,
}

/// Card issuance, card lifecycle and payment authorization.
#[derive(Clone)]
pub struct PaymentService {
    accounts: AccountService,
    tokenizer: Tokenizer,
}

impl PaymentService {
    pub fn new(accounts: AccountService, tokenizer: Tokenizer) -> Self {
        Self {
            accounts,
            tokenizer,
        }
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// Issues a card for `account_id`. Only the token and the masked display are stored.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - Not a 13 to 19 digit number with a valid checksum.
    /// - [`LedgerError::AccountNotFound`] - No such account.
    /// - [`LedgerError::Conflict`] - A card with the same number already exists.
    #[instrument(skip(self, raw_number))]
    pub async fn create_card(
        &self,
        account_id: AccountId,
        raw_number: &str,
    ) -> Result<Card, LedgerError> {
        let number = CardNumber::parse(raw_number)?;
        let token = self.tokenizer.tokenize(&number);
        let masked = number.masked();
        drop(number);

        let executor = self.accounts.executor();
        let card = executor
            .run("create_card", || {
                let token = token.clone();
                let masked = masked.clone();
                async move {
                    let mut work = executor.begin("create_card").await?;
                    work.lock(account_id).await?;
                    if work.card_by_token(&token).await?.is_some() {
                        return Err(LedgerError::Conflict("card already issued".to_string()).into());
                    }
                    work.validated();
                    let card = work
                        .insert_card(NewCard {
                            account_id,
                            token,
                            masked,
                        })
                        .await?;
                    work.commit().await?;
                    Ok::<_, TxError>(card)
                }
            })
            .await?;
        info!(card_id = %card.id, account_id = %account_id, masked = %card.masked, "card issued");
        Ok(card)
    }

    /// Cards of one account, ascending by id. Takes no locks.
    pub async fn get_cards(&self, account_id: AccountId) -> Result<Vec<Card>, LedgerError> {
        let executor = self.accounts.executor();
        executor
            .read("get_cards", executor.store().cards_by_account(account_id))
            .await
    }

    pub async fn get_card_details(&self, card_id: CardId) -> Result<Card, LedgerError> {
        let executor = self.accounts.executor();
        executor
            .read("get_card_details", executor.store().card(card_id))
            .await?
            .ok_or(LedgerError::CardNotFound(card_id))
    }

    #[instrument(skip(self))]
    pub async fn block_card(&self, card_id: CardId) -> Result<Card, LedgerError> {
        self.set_status(card_id, CardStatus::Blocked).await
    }

    #[instrument(skip(self))]
    pub async fn unblock_card(&self, card_id: CardId) -> Result<Card, LedgerError> {
        self.set_status(card_id, CardStatus::Active).await
    }

    async fn set_status(&self, card_id: CardId, status: CardStatus) -> Result<Card, LedgerError> {
        let executor = self.accounts.executor();
        let card = executor
            .run("set_card_status", move || async move {
                let mut work = executor.begin("set_card_status").await?;
                let (card, _) = Self::lock_card(&mut work, card_id).await?;
                work.validated();
                let card = if card.status == status {
                    card
                } else {
                    work.set_card_status(card_id, status).await?
                };
                work.commit().await?;
                Ok::<_, TxError>(card)
            })
            .await?;
        info!(card_id = %card_id, status = %status, "card status changed");
        Ok(card)
    }

    /// Looks the card up, locks its account, then re-reads the card under that
    /// lock so concurrent status changes are seen.
    async fn lock_card(work: &mut Work, card_id: CardId) -> Result<(Card, Account), TxError> {
        let card = work
            .card(card_id)
            .await?
            .ok_or(LedgerError::CardNotFound(card_id))?;
        let account = work.lock(card.account_id).await?;
        let card = work
            .card(card_id)
            .await?
            .ok_or(LedgerError::CardNotFound(card_id))?;
        Ok((card, account))
    }

    /// Charges `amount` to the card's account.
    ///
    /// A `correlation_id` makes the call idempotent: if a completed payment with
    /// the same id exists on this card's account, it is returned with
    /// `replayed == true` and nothing else happens. Without one, a fresh
    /// `pay-<uuid>` id is recorded.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `amount` is not positive.
    /// - [`LedgerError::CardNotFound`] - No such card.
    /// - [`LedgerError::CardBlocked`] - The card is blocked.
    /// - [`LedgerError::InsufficientFunds`] - The account balance is below `amount`.
    /// - [`LedgerError::Conflict`] - The correlation id belongs to a different payment.
    #[instrument(skip(self))]
    pub async fn process_payment(
        &self,
        card_id: CardId,
        amount: Amount,
        correlation_id: Option<String>,
    ) -> Result<PaymentReceipt, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation("amount must be positive".to_string()));
        }
        let correlation_id = correlation_id.unwrap_or_else(|| format!("pay-{}", Uuid::new_v4()));

        let executor = self.accounts.executor();
        let receipt = executor
            .run("process_payment", || {
                let correlation_id = correlation_id.clone();
                async move {
                    let mut work = executor.begin("process_payment").await?;
                    let (card, account) = Self::lock_card(&mut work, card_id).await?;

                    if let Some(previous) = work.find_by_correlation(&correlation_id).await? {
                        let same_payment = previous.kind == TransactionType::Withdrawal
                            && previous.source == Some(account.id)
                            && previous.amount == amount.negate()
                            && previous.status == TransactionStatus::Completed;
                        if !same_payment {
                            return Err(LedgerError::Conflict(format!(
                                "correlation id {correlation_id} already used"
                            ))
                            .into());
                        }
                        return Ok::<_, TxError>(PaymentReceipt {
                            card_id,
                            account_id: account.id,
                            record: previous,
                            replayed: true,
                        });
                    }

                    if card.is_blocked() {
                        return Err(LedgerError::CardBlocked(card_id).into());
                    }
                    let change = AccountService::post(
                        &mut work,
                        &account,
                        TransactionType::Withdrawal,
                        amount,
                        Some(correlation_id),
                    )
                    .await?;
                    work.commit().await?;
                    Ok(PaymentReceipt {
                        card_id,
                        account_id: account.id,
                        record: change.record,
                        replayed: false,
                    })
                }
            })
            .await?;

        if !receipt.replayed {
            info!(
                card_id = %card_id,
                account_id = %receipt.account_id,
                amount = %amount,
                transaction_id = %receipt.record.id,
                "payment committed"
            );
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::store::memory::InMemoryStore;
    use crate::tokenizer::TokenizerKey;
    use std::sync::Arc;

    const VISA: &str = "4111 1111 1111 1111";

    fn service() -> PaymentService {
        let accounts = AccountService::new(Arc::new(InMemoryStore::new()), LedgerConfig::default());
        let key = TokenizerKey::new(b"0123456789abcdef-test".to_vec()).unwrap();
        PaymentService::new(accounts, Tokenizer::new(&key).unwrap())
    }

    async fn funded(svc: &PaymentService, minor: i64) -> AccountId {
        let account = svc
            .accounts()
            .create_account(crate::base::OwnerId(1), "RUB")
            .await
            .unwrap();
        if minor > 0 {
            svc.accounts()
                .update_balance(account.id, Amount(minor), TransactionType::Deposit)
                .await
                .unwrap();
        }
        account.id
    }

    #[tokio::test]
    async fn issued_card_is_masked_and_active() {
        let svc = service();
        let account = funded(&svc, 0).await;
        let card = svc.create_card(account, VISA).await.unwrap();
        assert_eq!(card.masked, "**** 1111");
        assert_eq!(card.status, CardStatus::Active);
        assert_eq!(svc.get_cards(account).await.unwrap(), vec![card.clone()]);
        assert_eq!(svc.get_card_details(card.id).await.unwrap(), card);
    }

    #[tokio::test]
    async fn same_number_cannot_be_issued_twice() {
        let svc = service();
        let a = funded(&svc, 0).await;
        let b = funded(&svc, 0).await;
        svc.create_card(a, VISA).await.unwrap();
        assert!(matches!(
            svc.create_card(b, "4111-1111-1111-1111").await,
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn invalid_number_is_rejected() {
        let svc = service();
        let account = funded(&svc, 0).await;
        assert!(matches!(
            svc.create_card(account, "4111 1111 1111 1112").await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn payment_debits_the_card_account() {
        let svc = service();
        let account = funded(&svc, 10_000).await;
        let card = svc.create_card(account, VISA).await.unwrap();

        let receipt = svc
            .process_payment(card.id, Amount(2_500), None)
            .await
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.record.kind, TransactionType::Withdrawal);
        assert_eq!(receipt.record.amount, Amount(-2_500));
        assert!(
            receipt
                .record
                .correlation_id
                .as_deref()
                .is_some_and(|c| c.starts_with("pay-"))
        );
        assert_eq!(
            svc.accounts().get_account(account).await.unwrap().balance,
            Amount(7_500)
        );
    }

    #[tokio::test]
    async fn replayed_correlation_id_debits_once() {
        let svc = service();
        let account = funded(&svc, 10_000).await;
        let card = svc.create_card(account, VISA).await.unwrap();
        let id = Some("order-42".to_string());

        let first = svc
            .process_payment(card.id, Amount(1_000), id.clone())
            .await
            .unwrap();
        let second = svc
            .process_payment(card.id, Amount(1_000), id.clone())
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.record, first.record);
        assert_eq!(
            svc.accounts().get_account(account).await.unwrap().balance,
            Amount(9_000)
        );

        assert!(matches!(
            svc.process_payment(card.id, Amount(999), id).await,
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn blocked_card_cannot_pay_until_unblocked() {
        let svc = service();
        let account = funded(&svc, 500).await;
        let card = svc.create_card(account, VISA).await.unwrap();

        svc.block_card(card.id).await.unwrap();
        assert_eq!(
            svc.process_payment(card.id, Amount(100), None).await,
            Err(LedgerError::CardBlocked(card.id))
        );
        svc.unblock_card(card.id).await.unwrap();
        svc.process_payment(card.id, Amount(100), None).await.unwrap();
    }

    #[tokio::test]
    async fn payment_beyond_balance_leaves_account_untouched() {
        let svc = service();
        let account = funded(&svc, 100).await;
        let card = svc.create_card(account, VISA).await.unwrap();
        assert_eq!(
            svc.process_payment(card.id, Amount(101), None).await,
            Err(LedgerError::InsufficientFunds(account))
        );
        assert_eq!(
            svc.accounts().get_account(account).await.unwrap().balance,
            Amount(100)
        );
    }

    #[tokio::test]
    async fn unknown_card_is_not_found() {
        let svc = service();
        assert_eq!(
            svc.process_payment(CardId(77), Amount(1), None).await,
            Err(LedgerError::CardNotFound(CardId(77)))
        );
        assert_eq!(
            svc.block_card(CardId(77)).await,
            Err(LedgerError::CardNotFound(CardId(77)))
        );
    }

    #[tokio::test]
    async fn closing_an_account_blocks_its_cards() {
        let svc = service();
        let account = funded(&svc, 0).await;
        let card = svc.create_card(account, VISA).await.unwrap();
        svc.accounts().close_account(account).await.unwrap();
        assert!(svc.get_card_details(card.id).await.unwrap().is_blocked());
    }
}
