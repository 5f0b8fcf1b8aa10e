//! Transfer Coordinator
//!
//! Runs a money transfer as one unit of work: the transfer record, the two
//! offsetting entries and both balance updates commit or roll back together.

use tracing::{debug, info, warn};

use super::error::TransferError;
use super::types::{TransferTxParams, TransferTxResult};
use crate::store::{
    Account, CreateEntryParams, CreateTransferParams, Queries, Store, StoreError,
};

/// Transfer Coordinator - orchestrates ledger transfers
#[derive(Clone)]
pub struct TransferCoordinator {
    store: Store,
}

impl TransferCoordinator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Execute a transfer.
    ///
    /// Inside one transaction, in order: insert the transfer, insert the
    /// debit entry, insert the credit entry, then update both balances.
    /// Balances are always locked in ascending account id order, so two
    /// transfers over the same pair (in either direction) can never wait on
    /// each other in a cycle.
    pub async fn transfer_tx(
        &self,
        params: TransferTxParams,
    ) -> Result<TransferTxResult, TransferError> {
        params.validate()?;

        let TransferTxParams {
            from_account_id,
            to_account_id,
            amount,
        } = params;

        debug!(from_account_id, to_account_id, amount, "Transfer started");

        let result = self
            .store
            .exec_tx(move |q| {
                Box::pin(async move {
                    let transfer = q
                        .create_transfer(CreateTransferParams {
                            from_account_id,
                            to_account_id,
                            amount,
                        })
                        .await?;

                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: from_account_id,
                            amount: -amount,
                        })
                        .await?;

                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: to_account_id,
                            amount,
                        })
                        .await?;

                    let (from_account, to_account) = if from_account_id < to_account_id {
                        add_money(q, from_account_id, -amount, to_account_id, amount).await?
                    } else {
                        let (to_account, from_account) =
                            add_money(q, to_account_id, amount, from_account_id, -amount).await?;
                        (from_account, to_account)
                    };

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await
            .map_err(|source| {
                warn!(from_account_id, to_account_id, amount, error = %source, "Transfer failed");
                TransferError::Store {
                    from_account_id,
                    to_account_id,
                    source,
                }
            })?;

        info!(
            transfer_id = result.transfer.id,
            from_account_id,
            to_account_id,
            amount,
            "Transfer committed"
        );
        Ok(result)
    }
}

/// Apply two balance deltas, `account1` first. Callers pass the lower id first.
async fn add_money(
    q: &mut dyn Queries,
    account1_id: i64,
    amount1: i64,
    account2_id: i64,
    amount2: i64,
) -> Result<(Account, Account), StoreError> {
    let account1 = q.add_account_balance(account1_id, amount1).await?;
    let account2 = q.add_account_balance(account2_id, amount2).await?;
    Ok((account1, account2))
}
