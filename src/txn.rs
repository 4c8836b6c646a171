//! Transaction Manager
//!
//! Owns one connection for the lifetime of a logical transaction:
//! isolation control at start, commit/rollback of the top level, and a
//! LIFO savepoint stack for nested sub-transactions. The manager is
//! single-owner; it is never shared across concurrent callers.

use thiserror::Error;
use tracing::debug;

use crate::store::{ConnectionProvider, IsolationLevel, StoreError, WalletConnection};

/// Lifecycle of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Init,
    Active,
    Committed,
    RolledBack,
    Closed,
}

impl TxState {
    /// Terminal for the top-level transaction (connection may still be
    /// held until `stop`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Closed)
    }
}

/// Transaction-layer error.
///
/// `InvalidState` and `NoSavepoint` are contract violations by the
/// caller and are not recoverable; `Store` carries the backend
/// failure.
#[derive(Error, Debug)]
pub enum TxError {
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    #[error("no active savepoint to resolve")]
    NoSavepoint,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One logical transaction over one connection.
pub struct TransactionManager {
    conn: Option<Box<dyn WalletConnection>>,
    state: TxState,
    isolation: IsolationLevel,
    savepoints: Vec<String>,
    savepoint_seq: u32,
}

impl TransactionManager {
    /// Acquire a connection and open a transaction at `isolation`.
    ///
    /// Acquisition failure surfaces as `TxError::Store` with a
    /// connection fault, which callers classify as infrastructure.
    pub async fn start(
        provider: &dyn ConnectionProvider,
        isolation: IsolationLevel,
    ) -> Result<Self, TxError> {
        let mut conn = provider.acquire().await?;
        if let Err(e) = conn.begin(isolation).await {
            let _ = conn.close().await;
            return Err(e.into());
        }
        debug!(isolation = %isolation, "transaction started");
        Ok(Self {
            conn: Some(conn),
            state: TxState::Active,
            isolation,
            savepoints: Vec::new(),
            savepoint_seq: 0,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Depth of the savepoint stack (number of open child transactions).
    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Commit the top-level transaction. Clears the savepoint stack.
    pub async fn commit(&mut self) -> Result<(), TxError> {
        self.require_active("commit")?;
        self.conn_mut()?.commit().await?;
        self.savepoints.clear();
        self.state = TxState::Committed;
        debug!("transaction committed");
        Ok(())
    }

    /// Roll the top-level transaction back. Clears the savepoint stack.
    pub async fn rollback(&mut self) -> Result<(), TxError> {
        self.require_active("rollback")?;
        self.conn_mut()?.rollback().await?;
        self.savepoints.clear();
        self.state = TxState::RolledBack;
        debug!("transaction rolled back");
        Ok(())
    }

    /// Release the underlying connection.
    ///
    /// Safe on every exit path: a still-ACTIVE transaction is rolled
    /// back before the connection is released, and calling `stop`
    /// again is a no-op.
    pub async fn stop(&mut self) -> Result<(), TxError> {
        if let Some(mut conn) = self.conn.take() {
            if self.state == TxState::Active {
                let _ = conn.rollback().await;
                self.state = TxState::RolledBack;
            }
            self.savepoints.clear();
            conn.close().await?;
        }
        self.state = TxState::Closed;
        Ok(())
    }

    /// Start a child transaction by pushing a new savepoint.
    pub async fn begin_child(&mut self) -> Result<(), TxError> {
        self.require_active("begin child transaction")?;
        self.savepoint_seq += 1;
        let name = format!("sp_{}", self.savepoint_seq);
        self.conn_mut()?.savepoint(&name).await?;
        self.savepoints.push(name);
        Ok(())
    }

    /// Commit the most recent child transaction: release its savepoint.
    /// Changes stay pending and only become durable when the parent
    /// commits.
    pub async fn commit_child(&mut self) -> Result<(), TxError> {
        self.require_active("commit child transaction")?;
        // Pop only once the store has released the savepoint, so a
        // failure leaves the stack matching the connection.
        let name = self.savepoints.last().cloned().ok_or(TxError::NoSavepoint)?;
        self.conn_mut()?.release_savepoint(&name).await?;
        self.savepoints.pop();
        Ok(())
    }

    /// Roll back the most recent child transaction: undo work since
    /// its savepoint, then pop it. The parent stays ACTIVE and usable.
    pub async fn rollback_child(&mut self) -> Result<(), TxError> {
        self.require_active("rollback child transaction")?;
        let name = self.savepoints.last().cloned().ok_or(TxError::NoSavepoint)?;
        let conn = self.conn_mut()?;
        conn.rollback_to_savepoint(&name).await?;
        conn.release_savepoint(&name).await?;
        self.savepoints.pop();
        Ok(())
    }

    /// The owned connection, for transaction-scoped statements.
    pub(crate) fn connection(
        &mut self,
    ) -> Result<&mut (dyn WalletConnection + 'static), TxError> {
        self.require_active("execute statement")?;
        self.conn_mut()
    }

    fn require_active(&self, operation: &str) -> Result<(), TxError> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(TxError::InvalidState(format!(
                "{} requires an active transaction (state: {:?})",
                operation, self.state
            )))
        }
    }

    fn conn_mut(&mut self) -> Result<&mut (dyn WalletConnection + 'static), TxError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| TxError::InvalidState("connection already released".into()))
    }
}
