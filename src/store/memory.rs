//! In-memory backend
//!
//! Behaves like the Postgres schema closely enough to test the transactional
//! core without a database:
//!
//! - read committed: a transaction sees committed rows plus its own writes
//! - writes are buffered and published atomically on commit
//! - every written row takes an exclusive lock held until commit/rollback;
//!   a lock wait longer than `lock_timeout` fails with `LockConflict`
//!   (the analogue of Postgres deadlock detection)
//! - ids come from sequences, so rolled-back inserts leave gaps
//! - primary key, unique, foreign key and check constraints are enforced

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::error::{ConstraintCode, StoreError};
use super::models::{Account, Entry, Transfer, User, VerifyEmail};
use super::queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Queries, UpdateUserParams,
};
use super::{TxBackend, TxHandle};

/// Verification codes stay redeemable for this long
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    transfers: BTreeMap<i64, Transfer>,
    entries: BTreeMap<i64, Entry>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
}

impl Tables {
    fn publish(&mut self, writes: Tables) {
        self.accounts.extend(writes.accounts);
        self.transfers.extend(writes.transfers);
        self.entries.extend(writes.entries);
        self.users.extend(writes.users);
        self.verify_emails.extend(writes.verify_emails);
    }
}

#[derive(Default)]
struct Sequences {
    account: i64,
    transfer: i64,
    entry: i64,
    verify_email: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

struct Shared {
    committed: Mutex<Tables>,
    sequences: Mutex<Sequences>,
    row_locks: Mutex<HashMap<String, Arc<RowLock<()>>>>,
    lock_timeout: Duration,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory implementation of [`TxBackend`]
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: Mutex::new(Tables::default()),
                sequences: Mutex::new(Sequences::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
                fail_commit: AtomicBool::new(false),
                fail_rollback: AtomicBool::new(false),
            }),
        }
    }

    /// The next transaction commit fails and its writes are discarded
    pub fn fail_next_commit(&self) {
        self.shared.fail_commit.store(true, Ordering::SeqCst);
    }

    /// The next transaction rollback reports an error
    pub fn fail_next_rollback(&self) {
        self.shared.fail_rollback.store(true, Ordering::SeqCst);
    }

    pub fn transfer_count(&self) -> usize {
        lock(&self.shared.committed).transfers.len()
    }

    pub fn entry_count(&self) -> usize {
        lock(&self.shared.committed).entries.len()
    }

    /// All committed verification codes issued to `username`
    pub fn verify_emails_for(&self, username: &str) -> Vec<VerifyEmail> {
        lock(&self.shared.committed)
            .verify_emails
            .values()
            .filter(|v| v.username == username)
            .cloned()
            .collect()
    }

    fn tx(&self) -> MemoryTx {
        MemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            writes: Tables::default(),
        }
    }
}

#[async_trait]
impl TxBackend for MemoryBackend {
    fn queries(&self) -> Box<dyn Queries> {
        Box::new(MemoryQueries {
            backend: self.clone(),
        })
    }

    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError> {
        Ok(Box::new(self.tx()))
    }
}

/// Transaction over the shared tables
pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<String, OwnedMutexGuard<()>>,
    writes: Tables,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: String) -> Result<(), StoreError> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let row_lock = lock(&self.shared.row_locks)
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = tokio::time::timeout(self.shared.lock_timeout, row_lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockConflict(key.clone()))?;
        self.held.insert(key, guard);
        Ok(())
    }

    fn publish(self) {
        let MemoryTx {
            shared,
            held,
            writes,
        } = self;
        lock(&shared.committed).publish(writes);
        drop(held);
    }

    /// Autocommit helper for the pool-style handle
    fn settle<T>(self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if result.is_ok() {
            self.publish();
        }
        result
    }

    fn account(&self, id: i64) -> Option<Account> {
        self.writes
            .accounts
            .get(&id)
            .cloned()
            .or_else(|| lock(&self.shared.committed).accounts.get(&id).cloned())
    }

    fn user(&self, username: &str) -> Option<User> {
        self.writes
            .users
            .get(username)
            .cloned()
            .or_else(|| lock(&self.shared.committed).users.get(username).cloned())
    }

    fn verify_email(&self, id: i64) -> Option<VerifyEmail> {
        self.writes
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| lock(&self.shared.committed).verify_emails.get(&id).cloned())
    }

    fn require_account(&self, id: i64, constraint: &str) -> Result<(), StoreError> {
        match self.account(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::constraint(
                ConstraintCode::ForeignKeyViolation,
                constraint,
                format!("account {} does not exist", id),
            )),
        }
    }

    fn require_user(&self, username: &str, constraint: &str) -> Result<(), StoreError> {
        match self.user(username) {
            Some(_) => Ok(()),
            None => Err(StoreError::constraint(
                ConstraintCode::ForeignKeyViolation,
                constraint,
                format!("user {} does not exist", username),
            )),
        }
    }

    fn visible_verify_emails(&self) -> Vec<VerifyEmail> {
        let mut rows = lock(&self.shared.committed).verify_emails.clone();
        rows.extend(self.writes.verify_emails.clone());
        rows.into_values().collect()
    }
}

impl TxHandle for MemoryTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            if self.shared.fail_commit.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::Protocol(
                    "connection reset during commit".to_string(),
                )));
            }
            self.publish();
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let failed = self.shared.fail_rollback.swap(false, Ordering::SeqCst);
            drop(self);
            if failed {
                return Err(StoreError::Database(sqlx::Error::Protocol(
                    "connection reset during rollback".to_string(),
                )));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.require_user(&arg.owner, "accounts_owner_fkey")?;
        self.lock_row(format!("account_owner:{}:{}", arg.owner, arg.currency))
            .await?;

        let committed = lock(&self.shared.committed).accounts.clone();
        let duplicate = committed
            .values()
            .chain(self.writes.accounts.values())
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(StoreError::constraint(
                ConstraintCode::UniqueViolation,
                "owner_currency_key",
                format!("{} already has a {} account", arg.owner, arg.currency),
            ));
        }

        let id = next_id(&mut lock(&self.shared.sequences).account);
        self.lock_row(format!("account:{}", id)).await?;
        let account = Account {
            id,
            owner: arg.owner,
            currency: arg.currency,
            balance: arg.balance,
            created_at: Utc::now(),
        };
        self.writes.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.account(id)
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account, StoreError> {
        self.lock_row(format!("account:{}", id)).await?;
        let mut account = self
            .account(id)
            .ok_or_else(|| StoreError::not_found("account", id))?;
        account.balance = account.balance.checked_add(amount).ok_or_else(|| {
            StoreError::OutOfRange(format!(
                "account {} balance {} + {} overflows",
                id, account.balance, amount
            ))
        })?;
        self.writes.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        self.require_account(arg.from_account_id, "transfers_from_account_id_fkey")?;
        self.require_account(arg.to_account_id, "transfers_to_account_id_fkey")?;
        if arg.amount <= 0 {
            return Err(StoreError::constraint(
                ConstraintCode::CheckViolation,
                "transfers_amount_check",
                format!("amount {} must be positive", arg.amount),
            ));
        }

        let id = next_id(&mut lock(&self.shared.sequences).transfer);
        let transfer = Transfer {
            id,
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.transfers.insert(id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.writes
            .transfers
            .get(&id)
            .cloned()
            .or_else(|| lock(&self.shared.committed).transfers.get(&id).cloned())
            .ok_or_else(|| StoreError::not_found("transfer", id))
    }

    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>, StoreError> {
        let mut rows = lock(&self.shared.committed).transfers.clone();
        rows.extend(self.writes.transfers.clone());
        Ok(rows
            .into_values()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .collect())
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.require_account(arg.account_id, "entries_account_id_fkey")?;

        let id = next_id(&mut lock(&self.shared.sequences).entry);
        let entry = Entry {
            id,
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.writes.entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.writes
            .entries
            .get(&id)
            .cloned()
            .or_else(|| lock(&self.shared.committed).entries.get(&id).cloned())
            .ok_or_else(|| StoreError::not_found("entry", id))
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let mut rows = lock(&self.shared.committed).entries.clone();
        rows.extend(self.writes.entries.clone());
        Ok(rows
            .into_values()
            .filter(|e| e.account_id == account_id)
            .collect())
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.lock_row(format!("user:{}", arg.username)).await?;
        self.lock_row(format!("user_email:{}", arg.email)).await?;

        if self.user(&arg.username).is_some() {
            return Err(StoreError::constraint(
                ConstraintCode::UniqueViolation,
                "users_pkey",
                format!("username {} already exists", arg.username),
            ));
        }
        let committed = lock(&self.shared.committed).users.clone();
        if committed
            .values()
            .chain(self.writes.users.values())
            .any(|u| u.email == arg.email)
        {
            return Err(StoreError::constraint(
                ConstraintCode::UniqueViolation,
                "users_email_key",
                format!("email {} already registered", arg.email),
            ));
        }

        let now = Utc::now();
        let user = User {
            username: arg.username,
            full_name: arg.full_name,
            email: arg.email,
            hashed_password: arg.hashed_password,
            password_changed_at: DateTime::<Utc>::UNIX_EPOCH,
            is_email_verified: false,
            created_at: now,
        };
        self.writes.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.user(username)
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    async fn get_user_for_update(&mut self, username: &str) -> Result<User, StoreError> {
        self.lock_row(format!("user:{}", username)).await?;
        self.user(username)
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.lock_row(format!("user:{}", arg.username)).await?;
        let mut user = self
            .user(&arg.username)
            .ok_or_else(|| StoreError::not_found("user", &arg.username))?;

        if let Some(full_name) = arg.full_name {
            user.full_name = full_name;
        }
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }
        if let Some(email) = arg.email {
            user.email = email;
        }
        if let Some(verified) = arg.is_email_verified {
            user.is_email_verified = verified;
        }
        self.writes.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.require_user(&arg.username, "verify_emails_username_fkey")?;

        let id = next_id(&mut lock(&self.shared.sequences).verify_email);
        let now = Utc::now();
        let verify_email = VerifyEmail {
            id,
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + chrono::Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.writes.verify_emails.insert(id, verify_email.clone());
        Ok(verify_email)
    }

    async fn get_unused_verify_email(
        &mut self,
        username: &str,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        let now = Utc::now();
        Ok(self
            .visible_verify_emails()
            .into_iter()
            .filter(|v| v.username == username && v.is_redeemable(now))
            .max_by_key(|v| v.id))
    }

    async fn consume_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        self.lock_row(format!("verify_email:{}", id)).await?;
        let mut verify_email = self
            .verify_email(id)
            .filter(|v| v.secret_code == secret_code && v.is_redeemable(Utc::now()))
            .ok_or_else(|| StoreError::not_found("verify_email", id))?;
        verify_email.is_used = true;
        self.writes.verify_emails.insert(id, verify_email.clone());
        Ok(verify_email)
    }
}

/// Pool-style handle: every call runs in its own transaction
pub struct MemoryQueries {
    backend: MemoryBackend,
}

#[async_trait]
impl Queries for MemoryQueries {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.create_account(arg).await;
        tx.settle(result)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.backend.tx().get_account(id).await
    }

    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.add_account_balance(id, amount).await;
        tx.settle(result)
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.create_transfer(arg).await;
        tx.settle(result)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.backend.tx().get_transfer(id).await
    }

    async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>, StoreError> {
        self.backend.tx().list_transfers(account_id).await
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.create_entry(arg).await;
        tx.settle(result)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
        self.backend.tx().get_entry(id).await
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        self.backend.tx().list_entries(account_id).await
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.create_user(arg).await;
        tx.settle(result)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.backend.tx().get_user(username).await
    }

    async fn get_user_for_update(&mut self, username: &str) -> Result<User, StoreError> {
        self.backend.tx().get_user_for_update(username).await
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.update_user(arg).await;
        tx.settle(result)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.create_verify_email(arg).await;
        tx.settle(result)
    }

    async fn get_unused_verify_email(
        &mut self,
        username: &str,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        self.backend.tx().get_unused_verify_email(username).await
    }

    async fn consume_verify_email(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        let mut tx = self.backend.tx();
        let result = tx.consume_verify_email(id, secret_code).await;
        tx.settle(result)
    }
}
