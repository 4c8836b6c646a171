//! Store Abstraction Layer
//!
//! The connection seam between the transactional core and whatever
//! backs it. A [`ConnectionProvider`] hands out one [`WalletConnection`]
//! per logical transaction; the connection speaks parameterized
//! statements and stored routines with typed, positionally-bound
//! values.
//!
//! Two backends implement this seam:
//! - [`postgres`] - production backend over sqlx/PostgreSQL
//! - [`memory`] - in-process ledger with the same atomicity and
//!   error-code contract, used by tests and the demo binary

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Name of the atomic ledger-transfer routine every backend must honor.
///
/// Signature: `(request_id text, from_account_id int64,
/// to_account_id int64, currency_code text, amount float64)`, no
/// result, failures signalled via the codes in [`codes`].
pub const WALLET_TRANSFER_ROUTINE: &str = "wallet_transfer";

/// Name of the balance-lookup routine: IN account id, OUT balance.
pub const WALLET_BALANCE_ROUTINE: &str = "wallet_balance";

/// Backend-reported error codes for the transfer routine.
///
/// Process-wide constants; the domain taxonomy in `wallet::error` maps
/// from these. Any code outside this set is a generic transfer failure.
pub mod codes {
    pub const ACCOUNTS_MUST_DIFFER: i32 = 20003;
    pub const INVALID_AMOUNT: i32 = 20004;
    pub const ACCOUNT_NOT_FOUND: i32 = 20005;
    pub const INSUFFICIENT_BALANCE: i32 = 20006;
    pub const ACCOUNT_INACTIVE: i32 = 20007;
    pub const CURRENCY_MISMATCH: i32 = 20008;
    pub const DUPLICATE_REQUEST: i32 = 20009;
}

/// Transaction isolation level.
///
/// Numeric ids are the classic JDBC constants (1, 2, 4, 8) so records
/// persisted by the previous generation of the service keep decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IsolationLevel {
    ReadUncommitted = 1,
    ReadCommitted = 2,
    RepeatableRead = 4,
    Serializable = 8,
}

impl IsolationLevel {
    #[inline]
    pub fn id(&self) -> i32 {
        *self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(IsolationLevel::ReadUncommitted),
            2 => Some(IsolationLevel::ReadCommitted),
            4 => Some(IsolationLevel::RepeatableRead),
            8 => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    /// SQL spelling, as accepted by `BEGIN ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Typed statement parameter.
///
/// One variant per supported value kind; binding dispatches on the
/// variant instead of inspecting runtime types. [`SqlValue::Null`]
/// binds as an explicit SQL NULL, never as an absent parameter.
/// [`SqlValue::Other`] is the opaque fallback: the backend binds the
/// text form and lets the store coerce it.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Bytes(Vec<u8>),
    Null,
    Other(String),
}

impl SqlValue {
    /// Kind name, used in decode errors and trace output.
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Text(_) => "text",
            SqlValue::Int32(_) => "int32",
            SqlValue::Int64(_) => "int64",
            SqlValue::Float64(_) => "float64",
            SqlValue::Bool(_) => "bool",
            SqlValue::Timestamp(_) => "timestamp",
            SqlValue::Date(_) => "date",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Null => "null",
            SqlValue::Other(_) => "other",
        }
    }
}

/// Positional routine parameter: IN carries a value, OUT declares the
/// expected kind of a returned value.
#[derive(Debug, Clone)]
pub enum ProcParam {
    In(SqlValue),
    Out(SqlKind),
}

/// Declared kind for OUT parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Text,
    Int32,
    Int64,
    Float64,
    Bool,
    Timestamp,
    Date,
    Bytes,
}

/// A decoded result row: column names plus values, in select order.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value by column name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Raw value by position (0-based).
    pub fn get_at(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, StoreError> {
        match self.require(column)? {
            SqlValue::Int64(v) => Ok(*v),
            SqlValue::Int32(v) => Ok(*v as i64),
            other => Err(decode_mismatch(column, "int64", other)),
        }
    }

    pub fn get_i32(&self, column: &str) -> Result<i32, StoreError> {
        match self.require(column)? {
            SqlValue::Int32(v) => Ok(*v),
            other => Err(decode_mismatch(column, "int32", other)),
        }
    }

    pub fn get_f64(&self, column: &str) -> Result<f64, StoreError> {
        match self.require(column)? {
            SqlValue::Float64(v) => Ok(*v),
            SqlValue::Int64(v) => Ok(*v as f64),
            SqlValue::Int32(v) => Ok(*v as f64),
            other => Err(decode_mismatch(column, "float64", other)),
        }
    }

    pub fn get_bool(&self, column: &str) -> Result<bool, StoreError> {
        match self.require(column)? {
            SqlValue::Bool(v) => Ok(*v),
            other => Err(decode_mismatch(column, "bool", other)),
        }
    }

    pub fn get_text(&self, column: &str) -> Result<String, StoreError> {
        match self.require(column)? {
            SqlValue::Text(v) | SqlValue::Other(v) => Ok(v.clone()),
            other => Err(decode_mismatch(column, "text", other)),
        }
    }

    pub fn get_opt_text(&self, column: &str) -> Result<Option<String>, StoreError> {
        match self.require(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) | SqlValue::Other(v) => Ok(Some(v.clone())),
            other => Err(decode_mismatch(column, "text", other)),
        }
    }

    fn require(&self, column: &str) -> Result<&SqlValue, StoreError> {
        self.get(column)
            .ok_or_else(|| StoreError::Decode(format!("missing column: {}", column)))
    }
}

fn decode_mismatch(column: &str, wanted: &str, got: &SqlValue) -> StoreError {
    StoreError::Decode(format!(
        "column {}: expected {}, got {}",
        column,
        wanted,
        got.kind()
    ))
}

/// Store layer error.
///
/// Any backend failure surfaces as exactly one of these; the query
/// layer wraps them with the failing statement text.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection could not be acquired or was lost.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Store-reported failure carrying the backend numeric code.
    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },

    /// Wrapper carrying the failing statement text.
    #[error("statement failed [{sql}]: {source}")]
    Statement {
        sql: String,
        #[source]
        source: Box<StoreError>,
    },

    /// Result row could not be decoded to the requested shape.
    #[error("row decode failure: {0}")]
    Decode(String),

    /// Statement or routine the backend does not recognise.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// Operation attempted on a released connection.
    #[error("connection already released")]
    Closed,
}

impl StoreError {
    /// Wrap `source` with the failing statement, unless it already
    /// carries one.
    pub fn statement(sql: &str, source: StoreError) -> Self {
        match source {
            already @ StoreError::Statement { .. } => already,
            other => StoreError::Statement {
                sql: sql.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The backend-reported numeric code, if this (or the wrapped
    /// failure) is a store-reported error.
    pub fn backend_code(&self) -> Option<i32> {
        match self {
            StoreError::Backend { code, .. } => Some(*code),
            StoreError::Statement { source, .. } => source.backend_code(),
            _ => None,
        }
    }

    /// True when resubmitting the same request is safe: the failure
    /// happened acquiring or holding the connection, not in the store.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Closed => true,
            StoreError::Statement { source, .. } => source.is_connection_fault(),
            _ => false,
        }
    }
}

/// One backend connection, owned by exactly one caller at a time.
///
/// Outside an explicit `begin`, statements run in autocommit mode.
/// Savepoint operations require an open transaction.
#[async_trait]
pub trait WalletConnection: Send {
    /// Open a transaction at the given isolation level (autocommit off).
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Release (commit) a savepoint; pending work stays pending in the
    /// parent transaction.
    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Undo work since the savepoint; the savepoint itself survives
    /// until released.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, StoreError>;

    /// Run a statement, returning the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    /// Run an insert and return the generated key, if any.
    async fn insert_returning(
        &mut self,
        sql: &str,
        key_column: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>, StoreError>;

    /// Invoke a stored routine with positional IN/OUT parameters,
    /// returning OUT values keyed by position (0-based).
    async fn call(
        &mut self,
        routine: &str,
        params: &[ProcParam],
    ) -> Result<Vec<(usize, SqlValue)>, StoreError>;

    /// Release the underlying connection. Idempotent.
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Supplies one connection per logical transaction.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn WalletConnection>, StoreError>;
}
