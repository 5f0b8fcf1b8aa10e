//! Ledger Transfers
//!
//! Moves money between two accounts inside a single unit of work.
//!
//! # Flow
//!
//! ```text
//! validate ─▶ BEGIN ─▶ transfer ─▶ debit entry ─▶ credit entry
//!                                                   │
//!                     COMMIT ◀─ balance(max id) ◀─ balance(min id)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Validate first**: equal accounts or non-positive amounts never open a transaction
//! 2. **All or nothing**: a failure at any step leaves no transfer, entry or balance change
//! 3. **Ascending lock order**: balances are updated lowest account id first,
//!    independent of which side is debited

pub mod coordinator;
pub mod error;
pub mod types;

pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use types::{TransferTxParams, TransferTxResult};
