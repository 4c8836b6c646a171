//! walletd - Transactional Ledger Transfer Service
//!
//! Entry point. Loads config, picks a backend, and runs a short
//! transfer demonstration:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐    ┌─────────┐
//! │  Config  │───▶│  Backend  │───▶│ WalletService│───▶│ Result  │
//! │  (YAML)  │    │ (Pg/Mem)  │    │ (transfers)  │    │ (codes) │
//! └──────────┘    └───────────┘    └──────────────┘    └─────────┘
//! ```
//!
//! With `database.url` configured the PostgreSQL backend is used and
//! the schema is bootstrapped; otherwise the in-process ledger serves
//! the demo.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use walletd::config::AppConfig;
use walletd::query::SqlExecutor;
use walletd::store::memory::MemoryLedger;
use walletd::store::postgres::{self, PgProvider};
use walletd::store::ConnectionProvider;
use walletd::wallet::{WalletError, WalletService};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn build_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn ConnectionProvider>> {
    match &config.database.url {
        Some(url) => {
            let provider = PgProvider::connect(
                url,
                config.database.max_connections,
                Duration::from_secs(config.database.acquire_timeout_secs),
            )
            .await
            .context("connecting to PostgreSQL")?;
            postgres::init_schema(provider.pool())
                .await
                .context("bootstrapping wallet schema")?;
            tracing::info!("Using PostgreSQL backend");
            Ok(Arc::new(provider))
        }
        None => {
            let ledger = MemoryLedger::new();
            ledger.create_account(1, "USD", 1_000.0, true);
            ledger.create_account(2, "USD", 50.0, true);
            tracing::info!("Using in-process ledger backend with demo accounts");
            Ok(Arc::new(ledger))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _log_guard = walletd::logging::init_logging(&config);

    tracing::info!("Starting walletd in {} env", env);

    let provider = build_provider(&config).await?;
    let service = WalletService::new(SqlExecutor::new(provider));

    // One clean transfer, one replay of the same request id.
    let request_id = service
        .transfer(None, 1, 2, "USD", 25.0)
        .await
        .context("demo transfer")?;
    println!("transfer accepted, request_id = {}", request_id);

    match service.transfer(Some(&request_id), 1, 2, "USD", 25.0).await {
        Err(WalletError::DuplicateRequest) => {
            println!("replay of {} rejected as duplicate", request_id)
        }
        Err(e) => println!("replay rejected: {} (code {})", e, e.code()),
        Ok(_) => println!("replay unexpectedly accepted"),
    }

    for account in [1i64, 2] {
        match service.balance_of(account).await {
            Ok(balance) => println!("account {} balance: {:.2}", account, balance),
            Err(e) => println!("account {} balance unavailable: {}", account, e),
        }
    }

    Ok(())
}
