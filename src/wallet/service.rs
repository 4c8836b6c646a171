//! Transfer orchestration.
//!
//! One public entry point, [`WalletService::transfer`]: assign a
//! request id if the caller did not supply one, run the stored transfer
//! routine inside a single transaction, and translate backend
//! rejections into [`WalletError`] variants. The request id is the
//! idempotency key; replaying a completed transfer is rejected by the
//! store, not by this layer.

use tracing::{info, warn};
use uuid::Uuid;

use crate::query::SqlExecutor;
use crate::store::{
    IsolationLevel, ProcParam, SqlKind, SqlValue, WALLET_BALANCE_ROUTINE, WALLET_TRANSFER_ROUTINE,
};
use crate::wallet::error::WalletError;

pub struct WalletService {
    executor: SqlExecutor,
    isolation: IsolationLevel,
}

impl WalletService {
    pub fn new(executor: SqlExecutor) -> Self {
        Self {
            executor,
            isolation: IsolationLevel::ReadCommitted,
        }
    }

    /// Override the transaction isolation used for transfers.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Move `amount` of `currency` from one account to another.
    ///
    /// Returns the request id that identifies this transfer. When
    /// `request_id` is `None` a fresh UUID is assigned; passing the
    /// same id twice gets [`WalletError::DuplicateRequest`] on the
    /// second attempt.
    pub async fn transfer(
        &self,
        request_id: Option<&str>,
        from_account: i64,
        to_account: i64,
        currency: &str,
        amount: f64,
    ) -> Result<String, WalletError> {
        let request_id = match request_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let params = vec![
            SqlValue::Text(request_id.clone()),
            SqlValue::Int64(from_account),
            SqlValue::Int64(to_account),
            SqlValue::Text(currency.to_string()),
            SqlValue::Float64(amount),
        ];

        let outcome = self
            .executor
            .execute_in_transaction_with(self.isolation, move |scope| {
                Box::pin(async move {
                    scope.call_procedure(WALLET_TRANSFER_ROUTINE, &params).await
                })
            })
            .await;

        match outcome {
            Ok(()) => {
                info!(
                    request_id = %request_id,
                    from_account,
                    to_account,
                    currency,
                    amount,
                    "transfer committed"
                );
                Ok(request_id)
            }
            Err(e) => {
                let err = WalletError::from(e);
                warn!(
                    request_id = %request_id,
                    from_account,
                    to_account,
                    code = err.code(),
                    error = %err,
                    "transfer rejected"
                );
                Err(err)
            }
        }
    }

    /// Current balance of an account, via the balance routine.
    pub async fn balance_of(&self, account_id: i64) -> Result<f64, WalletError> {
        let outs = self
            .executor
            .call_procedure_with_out(
                WALLET_BALANCE_ROUTINE,
                &[
                    ProcParam::In(SqlValue::Int64(account_id)),
                    ProcParam::Out(SqlKind::Float64),
                ],
            )
            .await?;
        match outs.get(&1) {
            Some(SqlValue::Float64(balance)) => Ok(*balance),
            Some(SqlValue::Null) | None => Err(WalletError::AccountNotFound),
            Some(other) => Err(WalletError::Infrastructure(format!(
                "balance routine returned {} instead of float64",
                other.kind()
            ))),
        }
    }
}
