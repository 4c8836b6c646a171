//! walletd - Transactional Ledger Transfer Service
//!
//! Atomic balance transfers between wallet accounts, with request-id
//! idempotency and typed rejection codes.
//!
//! # Modules
//!
//! - [`store`] - Connection seam, typed SQL values, backend error codes
//! - [`store::postgres`] - sqlx/PostgreSQL backend and schema bootstrap
//! - [`store::memory`] - in-process ledger backend (tests, demo)
//! - [`txn`] - Transaction lifecycle and savepoint-based child transactions
//! - [`query`] - Query executor with `execute_in_transaction`
//! - [`wallet`] - Transfer orchestration and the domain error taxonomy
//! - [`config`] / [`logging`] - YAML config and tracing setup

pub mod config;
pub mod logging;
pub mod query;
pub mod store;
pub mod txn;
pub mod wallet;

// Convenient re-exports at crate root
pub use query::{SqlExecutor, TransactionScope};
pub use store::{
    ConnectionProvider, IsolationLevel, ProcParam, SqlKind, SqlRow, SqlValue, StoreError,
    WalletConnection,
};
pub use txn::{TransactionManager, TxError, TxState};
pub use wallet::{WalletError, WalletService};
