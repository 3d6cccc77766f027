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

//! REST surface over the account and payment services.
//!
//! Authentication happens upstream: the gateway validates the JWT and forwards
//! the caller as an `x-principal-id` header. Requests without it are rejected
//! with 401. Accounts and cards that belong to someone else are reported as 404.
//!
//! Amounts are integers in minor units.
//!
//! ## Endpoints
//!
//! - `POST /accounts` - Open an account
//! - `GET /accounts` - List the caller's accounts
//! - `GET /accounts/{id}` - Get one account
//! - `DELETE /accounts/{id}` - Close an empty account
//! - `PATCH /accounts/{id}/balance` - Deposit or withdraw
//! - `GET /accounts/{id}/transactions` - Paged history, `?cursor=&limit=`
//! - `POST /transfer` - Move money between accounts
//! - `POST /cards` - Issue a card
//! - `GET /cards`, `GET /cards/{id}` - Masked card projections
//! - `POST /cards/{id}/block`, `POST /cards/{id}/unblock`
//! - `POST /payments` - Charge a card
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:8080/accounts \
//!   -H "x-principal-id: 7" -H "Content-Type: application/json" \
//!   -d '{"currency": "RUB"}'
//!
//! curl -X PATCH http://localhost:8080/accounts/1/balance \
//!   -H "x-principal-id: 7" -H "Content-Type: application/json" \
//!   -d '{"type": "DEPOSIT", "amount": 10000}'
//! ```

use crate::account::Account;
use crate::account_service::{AccountService, BalanceChange};
use crate::base::{AccountId, Amount, CardId, OwnerId, TransactionId};
use crate::card::Card;
use crate::error::LedgerError;
use crate::history::Page;
use crate::payment_service::{PaymentReceipt, PaymentService};
use crate::transaction::{TransactionRecord, TransactionType};
use axum::{
    Extension, Json, Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Header carrying the authenticated caller, set by the gateway.
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

/// Largest page a client may ask for.
pub const MAX_PAGE_SIZE: usize = 500;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub currency: String,
}

/// `{"type": "DEPOSIT", "amount": 10000}`
#[derive(Debug, Deserialize)]
pub struct UpdateBalanceRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateCardRequest {
    pub account_id: i64,
    /// Raw card number. Tokenized on arrival and never stored.
    pub number: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub card_id: i64,
    pub amount: i64,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Transfer outcome as seen by the caller. The destination may belong to
/// someone else, so only its id is echoed, inside `record`.
#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub source: Account,
    pub record: TransactionRecord,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub cursor: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CardsQuery {
    pub account_id: Option<i64>,
}

/// Response body for errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Extractors ===

/// [`Json`] whose rejections answer with [`ErrorResponse`] and status 400.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(AppError))]
pub struct AppPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(AppError))]
pub struct AppQuery<T>(pub T);

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub accounts: AccountService,
    pub payments: PaymentService,
}

impl AppState {
    pub fn new(payments: PaymentService) -> Self {
        Self {
            accounts: payments.accounts().clone(),
            payments,
        }
    }

    /// Loads an account, hiding accounts of other owners.
    async fn owned_account(&self, owner: OwnerId, id: AccountId) -> Result<Account, AppError> {
        let account = self.accounts.get_account(id).await?;
        if account.owner_id != owner {
            return Err(LedgerError::AccountNotFound(id).into());
        }
        Ok(account)
    }

    /// Loads a card, hiding cards on accounts of other owners or on closed accounts.
    async fn owned_card(&self, owner: OwnerId, id: CardId) -> Result<Card, AppError> {
        let card = self.payments.get_card_details(id).await?;
        match self.owned_account(owner, card.account_id).await {
            Ok(_) => Ok(card),
            Err(AppError::Ledger(err)) if err.is_not_found() => {
                Err(LedgerError::CardNotFound(id).into())
            }
            Err(err) => Err(err),
        }
    }
}

// === Error Handling ===

/// Converts service failures into HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    Ledger(LedgerError),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::Ledger(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Ledger(LedgerError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Ledger(LedgerError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Ledger(LedgerError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::Unauthorized => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse {
                        error: format!("missing or invalid {PRINCIPAL_HEADER} header"),
                        code: "UNAUTHORIZED".to_string(),
                    }),
                )
                    .into_response();
            }
            AppError::Ledger(err) => err,
        };

        let (status, code) = match &err {
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            LedgerError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            LedgerError::CardNotFound(_) => (StatusCode::NOT_FOUND, "CARD_NOT_FOUND"),
            LedgerError::InsufficientFunds(_) => (StatusCode::CONFLICT, "INSUFFICIENT_FUNDS"),
            LedgerError::CurrencyMismatch { .. } => (StatusCode::BAD_REQUEST, "CURRENCY_MISMATCH"),
            LedgerError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            LedgerError::CardBlocked(_) => (StatusCode::LOCKED, "CARD_BLOCKED"),
            LedgerError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            LedgerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if err.is_client_error() {
            debug!(code, error = %err, "request rejected");
        } else {
            warn!(code, error = %err, "request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: err.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Middleware ===

/// Rejects requests without a numeric principal and exposes it as an [`OwnerId`] extension.
async fn require_principal(mut request: Request, next: Next) -> Result<Response, AppError> {
    let owner = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(OwnerId)
        .ok_or(AppError::Unauthorized)?;
    request.extensions_mut().insert(owner);
    Ok(next.run(request).await)
}

// === Handlers ===

/// POST /accounts
async fn create_account(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppJson(request): AppJson<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), AppError> {
    let account = state.accounts.create_account(owner, &request.currency).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// GET /accounts
async fn list_accounts(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
) -> Result<Json<Vec<Account>>, AppError> {
    Ok(Json(state.accounts.get_accounts(owner).await?))
}

/// GET /accounts/{id}
async fn get_account(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
) -> Result<Json<Account>, AppError> {
    Ok(Json(state.owned_account(owner, AccountId(id)).await?))
}

/// DELETE /accounts/{id}
async fn close_account(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
) -> Result<StatusCode, AppError> {
    let account = state.owned_account(owner, AccountId(id)).await?;
    state.accounts.close_account(account.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /accounts/{id}/balance
async fn update_balance(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
    AppJson(request): AppJson<UpdateBalanceRequest>,
) -> Result<Json<BalanceChange>, AppError> {
    let kind = request.kind.parse::<TransactionType>()?;
    let account = state.owned_account(owner, AccountId(id)).await?;
    let change = state
        .accounts
        .update_balance(account.id, Amount(request.amount), kind)
        .await?;
    Ok(Json(change))
}

/// GET /accounts/{id}/transactions
async fn list_transactions(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> Result<Json<Page>, AppError> {
    if let Some(limit) = query.limit
        && !(1..=MAX_PAGE_SIZE).contains(&limit)
    {
        return Err(LedgerError::Validation(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        ))
        .into());
    }
    let account = state.owned_account(owner, AccountId(id)).await?;
    let page = state
        .accounts
        .transactions_page(account.id, query.cursor.map(TransactionId), query.limit)
        .await?;
    Ok(Json(page))
}

/// POST /transfer
async fn transfer(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppJson(request): AppJson<TransferRequest>,
) -> Result<Json<TransferResponse>, AppError> {
    let source = state
        .owned_account(owner, AccountId(request.from_account_id))
        .await?;
    let receipt = state
        .accounts
        .transfer(
            source.id,
            AccountId(request.to_account_id),
            Amount(request.amount),
        )
        .await?;
    Ok(Json(TransferResponse {
        source: receipt.source,
        record: receipt.record,
    }))
}

/// POST /cards
async fn create_card(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppJson(request): AppJson<CreateCardRequest>,
) -> Result<(StatusCode, Json<Card>), AppError> {
    let account = state
        .owned_account(owner, AccountId(request.account_id))
        .await?;
    let card = state.payments.create_card(account.id, &request.number).await?;
    Ok((StatusCode::CREATED, Json(card)))
}

/// GET /cards, optionally narrowed to one account.
async fn list_cards(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppQuery(query): AppQuery<CardsQuery>,
) -> Result<Json<Vec<Card>>, AppError> {
    let accounts = match query.account_id {
        Some(id) => vec![state.owned_account(owner, AccountId(id)).await?],
        None => state.accounts.get_accounts(owner).await?,
    };
    let mut cards = Vec::new();
    for account in accounts {
        cards.extend(state.payments.get_cards(account.id).await?);
    }
    Ok(Json(cards))
}

/// GET /cards/{id}
async fn get_card(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
) -> Result<Json<Card>, AppError> {
    Ok(Json(state.owned_card(owner, CardId(id)).await?))
}

/// POST /cards/{id}/block
async fn block_card(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
) -> Result<Json<Card>, AppError> {
    let card = state.owned_card(owner, CardId(id)).await?;
    Ok(Json(state.payments.block_card(card.id).await?))
}

/// POST /cards/{id}/unblock
async fn unblock_card(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppPath(id): AppPath<i64>,
) -> Result<Json<Card>, AppError> {
    let card = state.owned_card(owner, CardId(id)).await?;
    Ok(Json(state.payments.unblock_card(card.id).await?))
}

/// POST /payments
async fn process_payment(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    AppJson(request): AppJson<PaymentRequest>,
) -> Result<Json<PaymentReceipt>, AppError> {
    let card = state.owned_card(owner, CardId(request.card_id)).await?;
    let receipt = state
        .payments
        .process_payment(card.id, Amount(request.amount), request.correlation_id)
        .await?;
    Ok(Json(receipt))
}

// === Router ===

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/{id}", get(get_account).delete(close_account))
        .route("/accounts/{id}/balance", patch(update_balance))
        .route("/accounts/{id}/transactions", get(list_transactions))
        .route("/transfer", post(transfer))
        .route("/cards", post(create_card).get(list_cards))
        .route("/cards/{id}", get(get_card))
        .route("/cards/{id}/block", post(block_card))
        .route("/cards/{id}/unblock", post(unblock_card))
        .route("/payments", post(process_payment))
        .layer(middleware::from_fn(require_principal))
        .with_state(state)
}
