//! Transfer transaction behaviour under concurrency and failure

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::*;
use simple_bank::store::{ConstraintCode, StoreError};
use simple_bank::transfer::{TransferCoordinator, TransferError, TransferTxParams};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_apply_exactly_once() {
    let (store, backend) = memory_store();
    let account1 = create_random_account(&store, 1000).await;
    let account2 = create_random_account(&store, 1000).await;
    let coordinator = TransferCoordinator::new(store.clone());

    let n = 5;
    let amount = 10;

    let (from, to) = (account1.id, account2.id);
    let mut handles = Vec::new();
    for _ in 0..n {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .transfer_tx(TransferTxParams::new(from, to, amount))
                .await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();

        let transfer = &result.transfer;
        assert_eq!(transfer.from_account_id, account1.id);
        assert_eq!(transfer.to_account_id, account2.id);
        assert_eq!(transfer.amount, amount);
        assert!(transfer.id > 0);
        assert!(store.queries().get_transfer(transfer.id).await.is_ok());

        assert_eq!(result.from_entry.account_id, account1.id);
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.account_id, account2.id);
        assert_eq!(result.to_entry.amount, amount);
        assert!(store.queries().get_entry(result.from_entry.id).await.is_ok());
        assert!(store.queries().get_entry(result.to_entry.id).await.is_ok());

        assert_eq!(result.from_account.id, account1.id);
        assert_eq!(result.to_account.id, account2.id);

        let diff1 = account1.balance - result.from_account.balance;
        let diff2 = result.to_account.balance - account2.balance;
        assert_eq!(diff1, diff2);
        assert!(diff1 > 0);
        assert_eq!(diff1 % amount, 0);

        let k = diff1 / amount;
        assert!((1..=n).contains(&k), "k={k}");
        assert!(seen.insert(k), "k={k} observed twice");
    }

    assert_eq!(balance(&store, account1.id).await, account1.balance - n * amount);
    assert_eq!(balance(&store, account2.id).await, account2.balance + n * amount);
    assert_eq!(backend.transfer_count(), n as usize);
    assert_eq!(backend.entry_count(), 2 * n as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_do_not_deadlock() {
    let (store, _) = memory_store_with_lock_timeout(Duration::from_secs(2));
    let account1 = create_random_account(&store, 500).await;
    let account2 = create_random_account(&store, 500).await;
    let coordinator = TransferCoordinator::new(store.clone());

    let n = 10;
    let amount = 10;

    let mut handles = Vec::new();
    for i in 0..n {
        let (from, to) = if i % 2 == 1 {
            (account2.id, account1.id)
        } else {
            (account1.id, account2.id)
        };
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .transfer_tx(TransferTxParams::new(from, to, amount))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&store, account1.id).await, account1.balance);
    assert_eq!(balance(&store, account2.id).await, account2.balance);
}

/// Two units of work touching the same pair with a pause between updates
async fn update_pair(
    store: &simple_bank::Store,
    first: i64,
    second: i64,
    delta: i64,
) -> Result<(), StoreError> {
    store
        .exec_tx(move |q| {
            Box::pin(async move {
                q.add_account_balance(first, delta).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                q.add_account_balance(second, -delta).await?;
                Ok(())
            })
        })
        .await
}

#[tokio::test]
async fn test_role_ordered_locking_conflicts() {
    let (store, _) = memory_store_with_lock_timeout(Duration::from_millis(200));
    let account1 = create_random_account(&store, 100).await;
    let account2 = create_random_account(&store, 100).await;

    // Each side locks its debit account first: a lock cycle
    let (a, b) = tokio::join!(
        update_pair(&store, account1.id, account2.id, -10),
        update_pair(&store, account2.id, account1.id, -10),
    );

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(StoreError::LockConflict(_))))
        .count();
    assert!(conflicts >= 1, "a={a:?} b={b:?}");
    assert_eq!(
        balance(&store, account1.id).await + balance(&store, account2.id).await,
        200
    );
}

#[tokio::test]
async fn test_ascending_locking_never_conflicts() {
    let (store, _) = memory_store_with_lock_timeout(Duration::from_millis(200));
    let account1 = create_random_account(&store, 100).await;
    let account2 = create_random_account(&store, 100).await;
    let (low, high) = (account1.id.min(account2.id), account1.id.max(account2.id));

    // Same pair, opposite directions, but both lock the lower id first
    let (a, b) = tokio::join!(
        update_pair(&store, low, high, -10),
        update_pair(&store, low, high, 10),
    );

    assert!(a.is_ok(), "{a:?}");
    assert!(b.is_ok(), "{b:?}");
    assert_eq!(balance(&store, account1.id).await, 100);
    assert_eq!(balance(&store, account2.id).await, 100);
}

#[tokio::test]
async fn test_invalid_transfer_touches_nothing() {
    let (store, backend) = memory_store();
    let account1 = create_random_account(&store, 100).await;
    let account2 = create_random_account(&store, 100).await;
    let coordinator = TransferCoordinator::new(store.clone());

    let err = coordinator
        .transfer_tx(TransferTxParams::new(account1.id, account2.id, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidAmount));
    assert!(err.is_validation());

    let err = coordinator
        .transfer_tx(TransferTxParams::new(account1.id, account1.id, 10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SAME_ACCOUNT");

    assert_eq!(backend.transfer_count(), 0);
    assert_eq!(backend.entry_count(), 0);
    assert_eq!(balance(&store, account1.id).await, 100);
}

#[tokio::test]
async fn test_missing_account_rolls_back() {
    let (store, backend) = memory_store();
    let account = create_random_account(&store, 100).await;
    let coordinator = TransferCoordinator::new(store.clone());

    let err = coordinator
        .transfer_tx(TransferTxParams::new(account.id, 9_999, 10))
        .await
        .unwrap_err();

    let source = err.store_error().expect("store error");
    assert_eq!(
        source.constraint_code(),
        Some(ConstraintCode::ForeignKeyViolation)
    );
    assert_eq!(backend.transfer_count(), 0);
    assert_eq!(backend.entry_count(), 0);
    assert_eq!(balance(&store, account.id).await, 100);
}

#[tokio::test]
async fn test_balance_overflow_rolls_back() {
    let (store, backend) = memory_store();
    let account1 = create_random_account(&store, i64::MAX).await;
    let account2 = create_random_account(&store, i64::MAX).await;
    let coordinator = TransferCoordinator::new(store.clone());

    let err = coordinator
        .transfer_tx(TransferTxParams::new(account1.id, account2.id, 1))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "OUT_OF_RANGE");
    assert!(matches!(err.store_error(), Some(StoreError::OutOfRange(_))));
    assert_eq!(backend.transfer_count(), 0);
    assert_eq!(backend.entry_count(), 0);
    assert_eq!(balance(&store, account1.id).await, i64::MAX);
    assert_eq!(balance(&store, account2.id).await, i64::MAX);
}

#[tokio::test]
async fn test_commit_failure_leaves_no_trace() {
    let (store, backend) = memory_store();
    let account1 = create_random_account(&store, 100).await;
    let account2 = create_random_account(&store, 100).await;
    let coordinator = TransferCoordinator::new(store.clone());

    backend.fail_next_commit();
    let err = coordinator
        .transfer_tx(TransferTxParams::new(account1.id, account2.id, 10))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "DATABASE_ERROR");
    assert_eq!(backend.transfer_count(), 0);
    assert_eq!(balance(&store, account1.id).await, 100);
    assert_eq!(balance(&store, account2.id).await, 100);

    // The next attempt goes through
    coordinator
        .transfer_tx(TransferTxParams::new(account1.id, account2.id, 10))
        .await
        .unwrap();
    assert_eq!(balance(&store, account1.id).await, 90);
}

#[tokio::test]
async fn test_deadline_while_waiting_for_lock() {
    let (store, backend) = memory_store();
    let account1 = create_random_account(&store, 100).await;
    let account2 = create_random_account(&store, 100).await;
    let coordinator = TransferCoordinator::new(
        store
            .clone()
            .with_tx_timeout(Duration::from_millis(100)),
    );

    let (id1, id2) = (account1.id, account2.id);
    let blocker = store.exec_tx_within(Duration::from_secs(5), move |q| {
        Box::pin(async move {
            q.add_account_balance(id1, 0).await?;
            q.add_account_balance(id2, 0).await?;
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(())
        })
    });
    let transfer = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator
            .transfer_tx(TransferTxParams::new(account1.id, account2.id, 10))
            .await
    };

    let (blocked, transferred) = tokio::join!(blocker, transfer);
    blocked.unwrap();
    let err = transferred.unwrap_err();
    assert!(matches!(
        err.store_error(),
        Some(StoreError::DeadlineExceeded(_))
    ));
    assert_eq!(backend.transfer_count(), 0);
    assert_eq!(balance(&store, account1.id).await, 100);
}
