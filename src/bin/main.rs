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

use bank_ledger::http::{AppState, router};
use bank_ledger::store::StoreHandle;
use bank_ledger::store::memory::InMemoryStore;
use bank_ledger::{
    AccountService, LedgerConfig, PaymentService, RetryPolicy, Tokenizer, TokenizerKey,
};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Bank ledger server
///
/// Serves accounts, transfers, transaction history, cards and card payments
/// over HTTP. Callers are identified by the `x-principal-id` header set by the
/// authenticating gateway.
#[derive(Parser)]
#[command(name = "bank-ledger")]
#[command(about = "Ledger and payment consistency engine", long_about = None)]
struct Args {
    /// PostgreSQL connection string; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Size of the connection pool
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    db_max_connections: u32,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Secret key for card tokenization, at least 16 bytes
    #[arg(long, env = "CARD_TOKEN_KEY", hide_env_values = true)]
    card_token_key: String,

    /// Wall-clock budget of one operation, retries included
    #[arg(long, env = "OPERATION_TIMEOUT_MS", default_value_t = 3000)]
    operation_timeout_ms: u64,

    /// Attempts per operation on serialization conflicts
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    fn ledger_config(&self) -> LedgerConfig {
        let defaults = LedgerConfig::default();
        LedgerConfig {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                ..defaults.retry
            },
            ..defaults
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn open_store(args: &Args, config: &LedgerConfig) -> Result<StoreHandle, String> {
    let Some(url) = &args.database_url else {
        warn!("DATABASE_URL not set, using the in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    };
    open_postgres(url, args.db_max_connections, config.operation_timeout).await
}

#[cfg(feature = "postgres")]
async fn open_postgres(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<StoreHandle, String> {
    let store = bank_ledger::store::postgres::PgStore::connect(url, max_connections, acquire_timeout)
        .await
        .map_err(|e| format!("cannot connect to database: {e}"))?;
    info!(max_connections, "connected to PostgreSQL");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(
    _url: &str,
    _max_connections: u32,
    _acquire_timeout: Duration,
) -> Result<StoreHandle, String> {
    Err("DATABASE_URL is set but this build lacks the `postgres` feature".to_string())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_format);

    let key = match TokenizerKey::new(args.card_token_key.as_bytes().to_vec()) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "invalid CARD_TOKEN_KEY");
            process::exit(1);
        }
    };
    let tokenizer = match Tokenizer::new(&key) {
        Ok(tokenizer) => tokenizer,
        Err(e) => {
            error!(error = %e, "cannot build tokenizer");
            process::exit(1);
        }
    };

    let config = args.ledger_config();
    let store = match open_store(&args, &config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open store");
            process::exit(1);
        }
    };

    let accounts = AccountService::new(store, config);
    let payments = PaymentService::new(accounts, tokenizer);
    let app = router(AppState::new(payments));

    let listener = match TcpListener::bind(args.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.listen_addr, error = %e, "cannot bind");
            process::exit(1);
        }
    };
    info!(addr = %args.listen_addr, timeout = ?config.operation_timeout, "ledger listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }
}
