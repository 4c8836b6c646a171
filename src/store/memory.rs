//! In-Process Ledger Backend
//!
//! Hosts the balance arithmetic in-process while preserving the
//! store contract: the `wallet_transfer` routine is atomic
//! (commit-or-rollback as one unit) and signals failures with the same
//! numeric codes as the PostgreSQL backend.
//!
//! A transaction works on a snapshot of the ledger and publishes it on
//! commit. A process-wide gate serializes transactions (and autocommit
//! calls) begin-to-commit, so observed isolation is stricter than READ
//! COMMITTED and no concurrent update is ever lost. Savepoints are
//! nested snapshots of the working copy. Generic SQL text is not
//! interpreted; this backend speaks routines only.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use async_trait::async_trait;
use tracing::debug;

use super::{
    codes, ConnectionProvider, IsolationLevel, ProcParam, SqlKind, SqlValue, StoreError,
    WalletConnection, WALLET_BALANCE_ROUTINE, WALLET_TRANSFER_ROUTINE,
};

/// One ledger account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub account_id: i64,
    pub currency_code: String,
    pub balance: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: HashMap<i64, AccountRecord>,
    /// Request ids already accepted. Recorded in the same atomic unit
    /// as the balance mutation, so replays stay detectable.
    applied: HashSet<String>,
}

impl LedgerState {
    fn transfer(
        &mut self,
        request_id: &str,
        from: i64,
        to: i64,
        currency: &str,
        amount: f64,
    ) -> Result<(), StoreError> {
        if from == to {
            return Err(backend(
                codes::ACCOUNTS_MUST_DIFFER,
                "source and destination accounts must differ",
            ));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(backend(
                codes::INVALID_AMOUNT,
                format!("invalid transfer amount: {}", amount),
            ));
        }
        if self.applied.contains(request_id) {
            return Err(backend(
                codes::DUPLICATE_REQUEST,
                format!("duplicate request: {}", request_id),
            ));
        }

        let source = self.accounts.get(&from).ok_or_else(|| {
            backend(codes::ACCOUNT_NOT_FOUND, format!("account {} not found", from))
        })?;
        let target = self.accounts.get(&to).ok_or_else(|| {
            backend(codes::ACCOUNT_NOT_FOUND, format!("account {} not found", to))
        })?;

        if !source.active {
            return Err(backend(
                codes::ACCOUNT_INACTIVE,
                format!("account {} is not active", from),
            ));
        }
        if !target.active {
            return Err(backend(
                codes::ACCOUNT_INACTIVE,
                format!("account {} is not active", to),
            ));
        }
        if source.currency_code != currency || target.currency_code != currency {
            return Err(backend(
                codes::CURRENCY_MISMATCH,
                format!("transfer currency {} does not match both accounts", currency),
            ));
        }
        if source.balance < amount {
            return Err(backend(
                codes::INSUFFICIENT_BALANCE,
                format!("insufficient balance on account {}", from),
            ));
        }

        // Checks passed; the two-sided mutation below cannot fail.
        if let Some(acct) = self.accounts.get_mut(&from) {
            acct.balance -= amount;
        }
        if let Some(acct) = self.accounts.get_mut(&to) {
            acct.balance += amount;
        }
        self.applied.insert(request_id.to_string());
        Ok(())
    }

    fn balance_of(&self, account_id: i64) -> Result<f64, StoreError> {
        self.accounts
            .get(&account_id)
            .map(|a| a.balance)
            .ok_or_else(|| {
                backend(
                    codes::ACCOUNT_NOT_FOUND,
                    format!("account {} not found", account_id),
                )
            })
    }
}

fn backend(code: i32, message: impl Into<String>) -> StoreError {
    StoreError::Backend {
        code,
        message: message.into(),
    }
}

/// In-process ledger: shared state plus seeding/inspection helpers.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    /// Serializes transactions begin-to-commit.
    tx_gate: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an account.
    ///
    /// Seeding helper: writes the shared state directly without waiting
    /// on the transaction gate, so an account seeded while a
    /// transaction is open is overwritten when that transaction
    /// publishes its working copy. Seed before opening transactions.
    pub fn create_account(&self, account_id: i64, currency_code: &str, balance: f64, active: bool) {
        let mut state = lock(&self.state);
        state.accounts.insert(
            account_id,
            AccountRecord {
                account_id,
                currency_code: currency_code.to_string(),
                balance,
                active,
            },
        );
    }

    /// Committed balance of an account, if it exists.
    pub fn balance_of(&self, account_id: i64) -> Option<f64> {
        lock(&self.state).accounts.get(&account_id).map(|a| a.balance)
    }

    /// Whether a request id has been durably accepted.
    pub fn is_applied(&self, request_id: &str) -> bool {
        lock(&self.state).applied.contains(request_id)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryLedger {
    async fn acquire(&self) -> Result<Box<dyn WalletConnection>, StoreError> {
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            tx_gate: Arc::clone(&self.tx_gate),
            tx: None,
            isolation: None,
            closed: false,
        }))
    }
}

struct TxBuffer {
    working: LedgerState,
    savepoints: Vec<(String, LedgerState)>,
    /// Held from begin until commit/rollback/close; dropping it lets
    /// the next transaction in.
    _permit: OwnedMutexGuard<()>,
}

/// One logical connection to the in-process ledger.
pub struct MemoryConnection {
    state: Arc<Mutex<LedgerState>>,
    tx_gate: Arc<tokio::sync::Mutex<()>>,
    tx: Option<TxBuffer>,
    isolation: Option<IsolationLevel>,
    closed: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn tx_mut(&mut self) -> Result<&mut TxBuffer, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Unsupported("no open transaction".into()))
    }

    /// Isolation level of the open transaction, if any.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }
}

// Lock guards are never held across await points; the poison case
// unwraps to the inner state so one panicked test cannot wedge others.
fn lock(state: &Mutex<LedgerState>) -> MutexGuard<'_, LedgerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl WalletConnection for MemoryConnection {
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), StoreError> {
        self.check_open()?;
        if self.tx.is_some() {
            return Err(StoreError::Unsupported("transaction already open".into()));
        }
        let permit = self.tx_gate.clone().lock_owned().await;
        let working = lock(&self.state).clone();
        self.tx = Some(TxBuffer {
            working,
            savepoints: Vec::new(),
            _permit: permit,
        });
        self.isolation = Some(isolation);
        debug!(isolation = %isolation, "memory transaction opened");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let buffer = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Unsupported("commit without open transaction".into()))?;
        *lock(&self.state) = buffer.working;
        self.isolation = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.tx
            .take()
            .ok_or_else(|| StoreError::Unsupported("rollback without open transaction".into()))?;
        self.isolation = None;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let buffer = self.tx_mut()?;
        let snapshot = buffer.working.clone();
        buffer.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let buffer = self.tx_mut()?;
        let pos = find_savepoint(&buffer.savepoints, name)?;
        // Releasing destroys this savepoint and any established after it.
        buffer.savepoints.truncate(pos);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let buffer = self.tx_mut()?;
        let pos = find_savepoint(&buffer.savepoints, name)?;
        buffer.working = buffer.savepoints[pos].1.clone();
        // The savepoint itself survives until released.
        buffer.savepoints.truncate(pos + 1);
        Ok(())
    }

    async fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<Vec<super::SqlRow>, StoreError> {
        self.check_open()?;
        Err(StoreError::Unsupported(sql.to_string()))
    }

    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, StoreError> {
        self.check_open()?;
        Err(StoreError::Unsupported(sql.to_string()))
    }

    async fn insert_returning(
        &mut self,
        sql: &str,
        _key_column: &str,
        _params: &[SqlValue],
    ) -> Result<Option<i64>, StoreError> {
        self.check_open()?;
        Err(StoreError::Unsupported(sql.to_string()))
    }

    async fn call(
        &mut self,
        routine: &str,
        params: &[ProcParam],
    ) -> Result<Vec<(usize, SqlValue)>, StoreError> {
        self.check_open()?;
        match routine {
            WALLET_TRANSFER_ROUTINE => {
                let (request_id, from, to, currency, amount) = decode_transfer_params(params)?;
                match self.tx.as_mut() {
                    Some(buffer) => {
                        buffer.working.transfer(&request_id, from, to, &currency, amount)?
                    }
                    // Autocommit: apply directly to the shared ledger,
                    // waiting out any open transaction.
                    None => {
                        let _permit = self.tx_gate.clone().lock_owned().await;
                        lock(&self.state).transfer(&request_id, from, to, &currency, amount)?
                    }
                }
                Ok(Vec::new())
            }
            WALLET_BALANCE_ROUTINE => {
                let (account_id, out_pos) = decode_balance_params(params)?;
                let balance = match self.tx.as_ref() {
                    Some(buffer) => buffer.working.balance_of(account_id)?,
                    None => lock(&self.state).balance_of(account_id)?,
                };
                Ok(vec![(out_pos, SqlValue::Float64(balance))])
            }
            other => Err(StoreError::Unsupported(format!("unknown routine: {}", other))),
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        // Uncommitted work is discarded with the buffer.
        self.tx = None;
        self.isolation = None;
        self.closed = true;
        Ok(())
    }
}

fn find_savepoint(savepoints: &[(String, LedgerState)], name: &str) -> Result<usize, StoreError> {
    savepoints
        .iter()
        .rposition(|(n, _)| n == name)
        .ok_or_else(|| StoreError::Unsupported(format!("unknown savepoint: {}", name)))
}

fn decode_transfer_params(
    params: &[ProcParam],
) -> Result<(String, i64, i64, String, f64), StoreError> {
    match params {
        [ProcParam::In(SqlValue::Text(request_id)), ProcParam::In(SqlValue::Int64(from)), ProcParam::In(SqlValue::Int64(to)), ProcParam::In(SqlValue::Text(currency)), ProcParam::In(SqlValue::Float64(amount))] => {
            Ok((request_id.clone(), *from, *to, currency.clone(), *amount))
        }
        _ => Err(StoreError::Unsupported(
            "wallet_transfer expects (text, int64, int64, text, float64)".into(),
        )),
    }
}

fn decode_balance_params(params: &[ProcParam]) -> Result<(i64, usize), StoreError> {
    match params {
        [ProcParam::In(SqlValue::Int64(account_id)), ProcParam::Out(SqlKind::Float64)] => {
            Ok((*account_id, 1))
        }
        _ => Err(StoreError::Unsupported(
            "wallet_balance expects (int64, OUT float64)".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.create_account(1, "USD", 500.0, true);
        ledger.create_account(2, "USD", 0.0, true);
        ledger.create_account(3, "EUR", 100.0, true);
        ledger.create_account(4, "USD", 100.0, false);
        ledger
    }

    fn transfer_params(request_id: &str, from: i64, to: i64, currency: &str, amount: f64) -> Vec<ProcParam> {
        vec![
            ProcParam::In(SqlValue::Text(request_id.into())),
            ProcParam::In(SqlValue::Int64(from)),
            ProcParam::In(SqlValue::Int64(to)),
            ProcParam::In(SqlValue::Text(currency.into())),
            ProcParam::In(SqlValue::Float64(amount)),
        ]
    }

    async fn call_transfer(
        conn: &mut Box<dyn WalletConnection>,
        request_id: &str,
        from: i64,
        to: i64,
        currency: &str,
        amount: f64,
    ) -> Result<(), StoreError> {
        conn.call(
            WALLET_TRANSFER_ROUTINE,
            &transfer_params(request_id, from, to, currency, amount),
        )
        .await
        .map(|_| ())
    }

    fn assert_code(result: Result<(), StoreError>, code: i32) {
        match result {
            Err(StoreError::Backend { code: got, .. }) => assert_eq!(got, code),
            other => panic!("expected backend code {code}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn autocommit_transfer_moves_funds() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();
        call_transfer(&mut conn, "r1", 1, 2, "USD", 100.0).await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(ledger.balance_of(1), Some(400.0));
        assert_eq!(ledger.balance_of(2), Some(100.0));
        assert!(ledger.is_applied("r1"));
    }

    #[tokio::test]
    async fn validation_ladder_reports_expected_codes() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();

        // Same account beats every other check, even a bad amount.
        assert_code(
            call_transfer(&mut conn, "a", 1, 1, "USD", -5.0).await,
            codes::ACCOUNTS_MUST_DIFFER,
        );
        assert_code(
            call_transfer(&mut conn, "b", 1, 2, "USD", 0.0).await,
            codes::INVALID_AMOUNT,
        );
        assert_code(
            call_transfer(&mut conn, "c", 1, 999, "USD", 10.0).await,
            codes::ACCOUNT_NOT_FOUND,
        );
        assert_code(
            call_transfer(&mut conn, "d", 1, 4, "USD", 10.0).await,
            codes::ACCOUNT_INACTIVE,
        );
        assert_code(
            call_transfer(&mut conn, "e", 1, 3, "USD", 10.0).await,
            codes::CURRENCY_MISMATCH,
        );
        assert_code(
            call_transfer(&mut conn, "f", 1, 2, "USD", 10_000.0).await,
            codes::INSUFFICIENT_BALANCE,
        );

        // Only rejected attempts so far; nothing applied.
        assert_eq!(ledger.balance_of(1), Some(500.0));
        assert_eq!(ledger.balance_of(2), Some(0.0));
    }

    #[tokio::test]
    async fn duplicate_request_is_durable_across_connections() {
        let ledger = seeded_ledger();

        let mut first = ledger.acquire().await.unwrap();
        call_transfer(&mut first, "r1", 1, 2, "USD", 100.0).await.unwrap();
        first.close().await.unwrap();

        let mut second = ledger.acquire().await.unwrap();
        assert_code(
            call_transfer(&mut second, "r1", 1, 2, "USD", 100.0).await,
            codes::DUPLICATE_REQUEST,
        );
        assert_eq!(ledger.balance_of(1), Some(400.0));
    }

    #[tokio::test]
    async fn rollback_discards_uncommitted_transfer() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();

        conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
        call_transfer(&mut conn, "r1", 1, 2, "USD", 100.0).await.unwrap();
        conn.rollback().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(ledger.balance_of(1), Some(500.0));
        assert!(!ledger.is_applied("r1"));
    }

    #[tokio::test]
    async fn commit_publishes_transfer() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();

        conn.begin(IsolationLevel::Serializable).await.unwrap();
        call_transfer(&mut conn, "r1", 1, 2, "USD", 100.0).await.unwrap();
        // Not visible before commit.
        assert_eq!(ledger.balance_of(1), Some(500.0));
        conn.commit().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(ledger.balance_of(1), Some(400.0));
        assert_eq!(ledger.balance_of(2), Some(100.0));
    }

    #[tokio::test]
    async fn savepoint_rollback_restores_working_copy() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();

        conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
        call_transfer(&mut conn, "r1", 1, 2, "USD", 100.0).await.unwrap();
        conn.savepoint("sp_1").await.unwrap();
        call_transfer(&mut conn, "r2", 1, 2, "USD", 200.0).await.unwrap();
        conn.rollback_to_savepoint("sp_1").await.unwrap();
        conn.release_savepoint("sp_1").await.unwrap();
        conn.commit().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(ledger.balance_of(1), Some(400.0));
        assert_eq!(ledger.balance_of(2), Some(100.0));
        assert!(ledger.is_applied("r1"));
        assert!(!ledger.is_applied("r2"));
    }

    #[tokio::test]
    async fn balance_routine_returns_out_value() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();

        let outs = conn
            .call(
                WALLET_BALANCE_ROUTINE,
                &[
                    ProcParam::In(SqlValue::Int64(1)),
                    ProcParam::Out(SqlKind::Float64),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outs, vec![(1, SqlValue::Float64(500.0))]);
    }

    #[tokio::test]
    async fn closed_connection_rejects_everything() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();
        conn.close().await.unwrap();
        // close stays idempotent
        conn.close().await.unwrap();

        assert!(matches!(
            call_transfer(&mut conn, "r1", 1, 2, "USD", 1.0).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            conn.begin(IsolationLevel::ReadCommitted).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn generic_sql_is_unsupported() {
        let ledger = seeded_ledger();
        let mut conn = ledger.acquire().await.unwrap();
        let result = conn.query("SELECT 1", &[]).await;
        assert!(matches!(result, Err(StoreError::Unsupported(_))));
    }
}
