//! End-to-end transfer flows over the in-process ledger backend: the
//! full stack (service → executor → transaction manager → store) minus
//! the real database.

use std::sync::Arc;

use async_trait::async_trait;

use walletd::query::SqlExecutor;
use walletd::store::memory::MemoryLedger;
use walletd::store::{
    ConnectionProvider, IsolationLevel, SqlValue, StoreError, WalletConnection,
    WALLET_TRANSFER_ROUTINE,
};
use walletd::txn::TxError;
use walletd::wallet::{WalletError, WalletService};

/// Two active USD accounts: #1 funded with 500, #2 with 10.
fn seeded_ledger() -> MemoryLedger {
    let ledger = MemoryLedger::new();
    ledger.create_account(1, "USD", 500.0, true);
    ledger.create_account(2, "USD", 10.0, true);
    ledger
}

fn service_over(ledger: &MemoryLedger) -> WalletService {
    WalletService::new(SqlExecutor::new(Arc::new(ledger.clone())))
}

#[tokio::test]
async fn valid_transfer_applies_exactly_once_and_echoes_request_id() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    let id = service
        .transfer(Some("r1"), 1, 2, "USD", 100.0)
        .await
        .unwrap();

    assert_eq!(id, "r1");
    assert_eq!(ledger.balance_of(1), Some(400.0));
    assert_eq!(ledger.balance_of(2), Some(110.0));
    assert!(ledger.is_applied("r1"));
}

#[tokio::test]
async fn resubmitted_request_id_is_duplicate_with_no_second_mutation() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    service
        .transfer(Some("r1"), 1, 2, "USD", 100.0)
        .await
        .unwrap();
    let err = service
        .transfer(Some("r1"), 1, 2, "USD", 100.0)
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::DuplicateRequest));
    assert_eq!(err.code(), 20009);
    // Balances are exactly as after the first transfer.
    assert_eq!(ledger.balance_of(1), Some(400.0));
    assert_eq!(ledger.balance_of(2), Some(110.0));
}

#[tokio::test]
async fn same_account_is_rejected_regardless_of_amount() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    for amount in [50.0, -1.0, 0.0] {
        let err = service.transfer(None, 1, 1, "USD", amount).await.unwrap_err();
        assert!(
            matches!(err, WalletError::AccountsMustDiffer),
            "amount {amount}"
        );
    }
    assert_eq!(ledger.balance_of(1), Some(500.0));
}

#[tokio::test]
async fn non_positive_amount_is_invalid() {
    let service = service_over(&seeded_ledger());

    let err = service.transfer(None, 1, 2, "USD", -10.0).await.unwrap_err();
    assert!(matches!(err, WalletError::InvalidAmount));

    let err = service.transfer(None, 1, 2, "USD", 0.0).await.unwrap_err();
    assert!(matches!(err, WalletError::InvalidAmount));
}

#[tokio::test]
async fn missing_account_leaves_all_balances_unchanged() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    let err = service.transfer(None, 1, 999, "USD", 10.0).await.unwrap_err();

    assert!(matches!(err, WalletError::AccountNotFound));
    assert_eq!(ledger.balance_of(1), Some(500.0));
    assert_eq!(ledger.balance_of(2), Some(10.0));
}

#[tokio::test]
async fn insufficient_funds_rolls_back_without_partial_debit() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    let err = service.transfer(None, 2, 1, "USD", 10_000.0).await.unwrap_err();

    assert!(matches!(err, WalletError::InsufficientBalance));
    assert_eq!(ledger.balance_of(1), Some(500.0));
    assert_eq!(ledger.balance_of(2), Some(10.0));
}

#[tokio::test]
async fn failed_request_id_can_be_reused_after_rollback() {
    let ledger = seeded_ledger();
    let service = service_over(&ledger);

    // First attempt fails on funds; the request record rolls back with it.
    let err = service
        .transfer(Some("r-retry"), 2, 1, "USD", 10_000.0)
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::InsufficientBalance));
    assert!(!ledger.is_applied("r-retry"));

    // Same id with a valid amount goes through.
    service
        .transfer(Some("r-retry"), 2, 1, "USD", 5.0)
        .await
        .unwrap();
    assert_eq!(ledger.balance_of(2), Some(5.0));
}

#[tokio::test]
async fn child_rollback_undoes_only_its_own_work() {
    let ledger = seeded_ledger();
    let executor = SqlExecutor::new(Arc::new(ledger.clone()));

    executor
        .execute_in_transaction(|scope| {
            Box::pin(async move {
                // Parent work: 1 -> 2, 100.
                scope
                    .call_procedure(
                        WALLET_TRANSFER_ROUTINE,
                        &transfer_params("p1", 1, 2, 100.0),
                    )
                    .await?;

                // Child work: another 50, then abandoned.
                scope.begin_child().await?;
                scope
                    .call_procedure(
                        WALLET_TRANSFER_ROUTINE,
                        &transfer_params("p2", 1, 2, 50.0),
                    )
                    .await?;
                scope.rollback_child().await?;

                // Parent still active and committable.
                Ok(())
            })
        })
        .await
        .unwrap();

    // Only the parent's 100 landed.
    assert_eq!(ledger.balance_of(1), Some(400.0));
    assert_eq!(ledger.balance_of(2), Some(110.0));
    assert!(ledger.is_applied("p1"));
    assert!(!ledger.is_applied("p2"));
}

#[tokio::test]
async fn parent_can_still_roll_back_after_child_commit() {
    let ledger = seeded_ledger();
    let executor = SqlExecutor::new(Arc::new(ledger.clone()));

    let result: Result<(), TxError> = executor
        .execute_in_transaction(|scope| {
            Box::pin(async move {
                scope.begin_child().await?;
                scope
                    .call_procedure(
                        WALLET_TRANSFER_ROUTINE,
                        &transfer_params("c1", 1, 2, 100.0),
                    )
                    .await?;
                scope.commit_child().await?;

                // Abort the whole transaction after the child committed.
                Err(TxError::InvalidState("caller abort".into()))
            })
        })
        .await;

    assert!(result.is_err());
    // The child's work rolled back with the parent.
    assert_eq!(ledger.balance_of(1), Some(500.0));
    assert!(!ledger.is_applied("c1"));
}

/// Provider that fails every acquisition, simulating an unreachable
/// store.
struct DownProvider;

#[async_trait]
impl ConnectionProvider for DownProvider {
    async fn acquire(&self) -> Result<Box<dyn WalletConnection>, StoreError> {
        Err(StoreError::Connection("connection refused".into()))
    }
}

#[tokio::test]
async fn connection_failure_is_retry_safe_infrastructure_error() {
    let service = WalletService::new(SqlExecutor::new(Arc::new(DownProvider)));

    let err = service
        .transfer(Some("r-down"), 1, 2, "USD", 10.0)
        .await
        .unwrap_err();

    assert!(matches!(err, WalletError::Infrastructure(_)));
    assert!(err.is_retry_safe());
}

#[tokio::test]
async fn serializable_isolation_is_honoured_end_to_end() {
    let ledger = seeded_ledger();
    let service =
        service_over(&ledger).with_isolation(IsolationLevel::Serializable);

    service.transfer(None, 1, 2, "USD", 10.0).await.unwrap();
    assert_eq!(ledger.balance_of(1), Some(490.0));
}

#[tokio::test]
async fn concurrent_transfers_with_distinct_ids_all_apply() {
    let ledger = seeded_ledger();

    let mut handles = Vec::new();
    for i in 0..10 {
        let service = service_over(&ledger);
        handles.push(tokio::spawn(async move {
            service
                .transfer(Some(&format!("bulk-{i}")), 1, 2, "USD", 10.0)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(ledger.balance_of(1), Some(400.0));
    assert_eq!(ledger.balance_of(2), Some(110.0));
}

fn transfer_params(request_id: &str, from: i64, to: i64, amount: f64) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(request_id.into()),
        SqlValue::Int64(from),
        SqlValue::Int64(to),
        SqlValue::Text("USD".into()),
        SqlValue::Float64(amount),
    ]
}
