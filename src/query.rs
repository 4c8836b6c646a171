//! Transactional Query Executor
//!
//! Two modes over the store seam:
//!
//! - single-shot: every operation acquires a connection, runs in
//!   autocommit, and releases the connection before returning;
//! - transaction-scoped: [`SqlExecutor::execute_in_transaction`] opens
//!   a transaction, hands the callback a [`TransactionScope`] bound to
//!   that one connection, commits on normal return, rolls back on any
//!   error, and always releases the connection afterward.
//!
//! Failures are wrapped with the failing statement text. This layer
//! never retries.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::store::{
    ConnectionProvider, IsolationLevel, ProcParam, SqlRow, SqlValue, StoreError,
};
use crate::txn::{TransactionManager, TxError};

/// Query executor over a connection provider.
#[derive(Clone)]
pub struct SqlExecutor {
    provider: Arc<dyn ConnectionProvider>,
}

impl SqlExecutor {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Run a SELECT and decode every row.
    pub async fn select<T>(
        &self,
        sql: &str,
        decode: impl Fn(&SqlRow) -> Result<T, StoreError>,
        params: &[SqlValue],
    ) -> Result<Vec<T>, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let result = conn.query(sql, params).await;
        let _ = conn.close().await;
        let rows = result.map_err(|e| StoreError::statement(sql, e))?;
        rows.iter().map(|row| decode(row)).collect()
    }

    /// Run a SELECT and decode the first row, if any.
    pub async fn select_one<T>(
        &self,
        sql: &str,
        decode: impl Fn(&SqlRow) -> Result<T, StoreError>,
        params: &[SqlValue],
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let result = conn.query(sql, params).await;
        let _ = conn.close().await;
        let rows = result.map_err(|e| StoreError::statement(sql, e))?;
        rows.first().map(|row| decode(row)).transpose()
    }

    /// Run an INSERT/UPDATE/DELETE, returning the affected-row count.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let result = conn.execute(sql, params).await;
        let _ = conn.close().await;
        result.map_err(|e| StoreError::statement(sql, e))
    }

    /// Run an INSERT and return the generated key.
    pub async fn insert_and_get_key(
        &self,
        sql: &str,
        key_column: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let result = conn.insert_returning(sql, key_column, params).await;
        let _ = conn.close().await;
        result.map_err(|e| StoreError::statement(sql, e))
    }

    /// Run the same INSERT once per parameter row on one connection,
    /// returning per-row update counts.
    pub async fn batch_insert(
        &self,
        sql: &str,
        batch: &[Vec<SqlValue>],
    ) -> Result<Vec<u64>, StoreError> {
        self.run_batch(sql, batch).await
    }

    /// Run the same UPDATE once per parameter row on one connection,
    /// returning per-row update counts.
    pub async fn batch_update(
        &self,
        sql: &str,
        batch: &[Vec<SqlValue>],
    ) -> Result<Vec<u64>, StoreError> {
        self.run_batch(sql, batch).await
    }

    async fn run_batch(&self, sql: &str, batch: &[Vec<SqlValue>]) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let mut counts = Vec::with_capacity(batch.len());
        let mut failure = None;
        for params in batch {
            match conn.execute(sql, params).await {
                Ok(count) => counts.push(count),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let _ = conn.close().await;
        match failure {
            Some(e) => Err(StoreError::statement(sql, e)),
            None => Ok(counts),
        }
    }

    /// Call a stored routine with IN parameters only.
    pub async fn call_procedure(
        &self,
        routine: &str,
        params: &[SqlValue],
    ) -> Result<(), StoreError> {
        let in_params: Vec<ProcParam> = params.iter().cloned().map(ProcParam::In).collect();
        let mut conn = self.provider.acquire().await?;
        let result = conn.call(routine, &in_params).await;
        let _ = conn.close().await;
        result.map_err(|e| StoreError::statement(routine, e))?;
        Ok(())
    }

    /// Call a stored routine with positional IN/OUT parameters,
    /// returning OUT values keyed by position.
    pub async fn call_procedure_with_out(
        &self,
        routine: &str,
        params: &[ProcParam],
    ) -> Result<HashMap<usize, SqlValue>, StoreError> {
        let mut conn = self.provider.acquire().await?;
        let result = conn.call(routine, params).await;
        let _ = conn.close().await;
        let outs = result.map_err(|e| StoreError::statement(routine, e))?;
        Ok(outs.into_iter().collect())
    }

    /// Run `callback` inside a transaction at READ COMMITTED.
    pub async fn execute_in_transaction<T, F>(&self, callback: F) -> Result<T, TxError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut TransactionScope) -> BoxFuture<'a, Result<T, TxError>> + Send,
    {
        self.execute_in_transaction_with(IsolationLevel::ReadCommitted, callback)
            .await
    }

    /// Run `callback` inside a transaction at the given isolation
    /// level: commit on `Ok`, roll back on `Err`, release the
    /// connection on every path.
    pub async fn execute_in_transaction_with<T, F>(
        &self,
        isolation: IsolationLevel,
        callback: F,
    ) -> Result<T, TxError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut TransactionScope) -> BoxFuture<'a, Result<T, TxError>> + Send,
    {
        let txn = TransactionManager::start(self.provider.as_ref(), isolation).await?;
        let mut scope = TransactionScope { txn };

        let outcome = match callback(&mut scope).await {
            Ok(value) => scope.txn.commit().await.map(|_| value),
            Err(e) => {
                let _ = scope.txn.rollback().await;
                Err(e)
            }
        };

        // Guaranteed release, success or failure.
        let stop_result = scope.txn.stop().await;
        match outcome {
            Ok(value) => {
                stop_result?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

/// Transaction-scoped sub-interface: the same operations bound to the
/// one connection of an open transaction, plus child-transaction
/// control.
pub struct TransactionScope {
    txn: TransactionManager,
}

impl TransactionScope {
    pub fn isolation(&self) -> IsolationLevel {
        self.txn.isolation()
    }

    /// Open savepoint depth.
    pub fn depth(&self) -> usize {
        self.txn.depth()
    }

    pub async fn select<T>(
        &mut self,
        sql: &str,
        decode: impl Fn(&SqlRow) -> Result<T, StoreError>,
        params: &[SqlValue],
    ) -> Result<Vec<T>, TxError> {
        let conn = self.txn.connection()?;
        let rows = conn
            .query(sql, params)
            .await
            .map_err(|e| TxError::Store(StoreError::statement(sql, e)))?;
        rows.iter()
            .map(|row| decode(row).map_err(TxError::Store))
            .collect()
    }

    pub async fn select_one<T>(
        &mut self,
        sql: &str,
        decode: impl Fn(&SqlRow) -> Result<T, StoreError>,
        params: &[SqlValue],
    ) -> Result<Option<T>, TxError> {
        let rows = self.select(sql, decode, params).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, TxError> {
        let conn = self.txn.connection()?;
        conn.execute(sql, params)
            .await
            .map_err(|e| TxError::Store(StoreError::statement(sql, e)))
    }

    pub async fn insert_and_get_key(
        &mut self,
        sql: &str,
        key_column: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>, TxError> {
        let conn = self.txn.connection()?;
        conn.insert_returning(sql, key_column, params)
            .await
            .map_err(|e| TxError::Store(StoreError::statement(sql, e)))
    }

    pub async fn call_procedure(
        &mut self,
        routine: &str,
        params: &[SqlValue],
    ) -> Result<(), TxError> {
        let in_params: Vec<ProcParam> = params.iter().cloned().map(ProcParam::In).collect();
        let conn = self.txn.connection()?;
        conn.call(routine, &in_params)
            .await
            .map_err(|e| TxError::Store(StoreError::statement(routine, e)))?;
        Ok(())
    }

    pub async fn call_procedure_with_out(
        &mut self,
        routine: &str,
        params: &[ProcParam],
    ) -> Result<HashMap<usize, SqlValue>, TxError> {
        let conn = self.txn.connection()?;
        let outs = conn
            .call(routine, params)
            .await
            .map_err(|e| TxError::Store(StoreError::statement(routine, e)))?;
        Ok(outs.into_iter().collect())
    }

    /// Start a child transaction (savepoint).
    pub async fn begin_child(&mut self) -> Result<(), TxError> {
        self.txn.begin_child().await
    }

    /// Commit the most recent child transaction.
    pub async fn commit_child(&mut self) -> Result<(), TxError> {
        self.txn.commit_child().await
    }

    /// Roll back the most recent child transaction; the enclosing
    /// transaction stays usable.
    pub async fn rollback_child(&mut self) -> Result<(), TxError> {
        self.txn.rollback_child().await
    }
}
