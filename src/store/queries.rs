//! Query capability shared by pool-bound and transaction-bound handles

use async_trait::async_trait;

use super::error::StoreError;
use super::models::{Account, Entry, Transfer, User, VerifyEmail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub currency: String,
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub full_name: String,
    pub hashed_password: String,
    pub email: String,
}

/// Partial update; `None` fields keep their stored value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub full_name: Option<String>,
    pub hashed_password: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
}

/// Data-access handle.
///
/// Implemented once against the connection pool (every call autocommits) and
/// once against an open transaction (handed out by [`crate::store::Store::exec_tx`]).
/// Missing rows are reported as [`StoreError::NotFound`].
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Balance Mutator: `balance = balance + amount` as one statement.
    ///
    /// Takes the row's exclusive lock until the surrounding transaction ends.
    /// Only the transfer coordinator calls this, always in ascending id order.
    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account, StoreError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    /// Transfers where the account is either side, oldest first
    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>, StoreError>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError>;

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    /// Like `get_user`, but holds the user row lock until the transaction ends
    async fn get_user_for_update(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError>;

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    /// Newest verification code for the user that is unused and unexpired
    async fn get_unused_verify_email(
        &mut self,
        username: &str,
    ) -> Result<Option<VerifyEmail>, StoreError>;

    /// Mark a code used. Unknown id, wrong secret, used or expired → `NotFound`.
    async fn consume_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError>;
}
