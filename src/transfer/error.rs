//! Transfer Error Types

use thiserror::Error;

use crate::store::StoreError;

/// Transfer error types
///
/// Validation errors are raised before any transaction begins; everything
/// else comes out of the unit of work, tagged with the accounts involved.
#[derive(Error, Debug)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    // === Unit of Work Errors ===
    #[error("transfer {from_account_id} -> {to_account_id} failed: {source}")]
    Store {
        from_account_id: i64,
        to_account_id: i64,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::Store { source, .. } => source.code(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, TransferError::SameAccount | TransferError::InvalidAmount)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            TransferError::Store { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            TransferError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}
