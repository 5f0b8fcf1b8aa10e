//! PostgreSQL backend
//!
//! Runtime-checked `sqlx` queries. The SQL lives in [`sql`] as functions
//! generic over the executor so the pool-bound and transaction-bound
//! handles run the exact same statements.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::error::StoreError;
use super::models::{Account, Entry, Transfer, User, VerifyEmail};
use super::queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Queries, UpdateUserParams,
};
use super::{TxBackend, TxHandle};
use crate::config::StoreConfig;

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new connection pool
    pub async fn connect(database_url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(database_url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl TxBackend for PgBackend {
    fn queries(&self) -> Box<dyn Queries> {
        Box::new(PgQueries {
            pool: self.pool.clone(),
        })
    }

    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// Handle bound to the pool
pub struct PgQueries {
    pool: PgPool,
}

/// Handle bound to an open transaction
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl TxHandle for PgTx {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { Ok(self.tx.commit().await?) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move { Ok(self.tx.rollback().await?) })
    }
}

macro_rules! impl_pg_queries {
    ($ty:ty, $this:ident => $exec:expr) => {
        #[async_trait]
        impl Queries for $ty {
            async fn create_account(
                &mut self,
                arg: CreateAccountParams,
            ) -> Result<Account, StoreError> {
                let $this = self;
                sql::create_account($exec, &arg).await
            }

            async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
                let $this = self;
                sql::get_account($exec, id).await
            }

            async fn add_account_balance(
                &mut self,
                id: i64,
                amount: i64,
            ) -> Result<Account, StoreError> {
                let $this = self;
                sql::add_account_balance($exec, id, amount).await
            }

            async fn create_transfer(
                &mut self,
                arg: CreateTransferParams,
            ) -> Result<Transfer, StoreError> {
                let $this = self;
                sql::create_transfer($exec, arg).await
            }

            async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
                let $this = self;
                sql::get_transfer($exec, id).await
            }

            async fn list_transfers(&mut self, account_id: i64) -> Result<Vec<Transfer>, StoreError> {
                let $this = self;
                sql::list_transfers($exec, account_id).await
            }

            async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
                let $this = self;
                sql::create_entry($exec, arg).await
            }

            async fn get_entry(&mut self, id: i64) -> Result<Entry, StoreError> {
                let $this = self;
                sql::get_entry($exec, id).await
            }

            async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
                let $this = self;
                sql::list_entries($exec, account_id).await
            }

            async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
                let $this = self;
                sql::create_user($exec, &arg).await
            }

            async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
                let $this = self;
                sql::get_user($exec, username, false).await
            }

            async fn get_user_for_update(&mut self, username: &str) -> Result<User, StoreError> {
                let $this = self;
                sql::get_user($exec, username, true).await
            }

            async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
                let $this = self;
                sql::update_user($exec, &arg).await
            }

            async fn create_verify_email(
                &mut self,
                arg: CreateVerifyEmailParams,
            ) -> Result<VerifyEmail, StoreError> {
                let $this = self;
                sql::create_verify_email($exec, &arg).await
            }

            async fn get_unused_verify_email(
                &mut self,
                username: &str,
            ) -> Result<Option<VerifyEmail>, StoreError> {
                let $this = self;
                sql::get_unused_verify_email($exec, username).await
            }

            async fn consume_verify_email(
                &mut self,
                id: i64,
                secret_code: &str,
            ) -> Result<VerifyEmail, StoreError> {
                let $this = self;
                sql::consume_verify_email($exec, id, secret_code).await
            }
        }
    };
}

impl_pg_queries!(PgQueries, this => &this.pool);
impl_pg_queries!(PgTx, this => &mut *this.tx);

mod sql {
    use sqlx::PgExecutor;

    use super::*;

    const ACCOUNT_COLUMNS: &str = "id, owner, currency, balance, created_at";
    const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
    const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
    const USER_COLUMNS: &str = "username, full_name, email, hashed_password, \
                                password_changed_at, is_email_verified, created_at";
    const VERIFY_EMAIL_COLUMNS: &str =
        "id, username, email, secret_code, is_used, created_at, expired_at";

    pub async fn create_account<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: &CreateAccountParams,
    ) -> Result<Account, StoreError> {
        let query = format!(
            "INSERT INTO accounts (owner, currency, balance) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, Account>(&query)
            .bind(&arg.owner)
            .bind(&arg.currency)
            .bind(arg.balance)
            .fetch_one(exec)
            .await?;
        Ok(account)
    }

    pub async fn get_account<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
    ) -> Result<Account, StoreError> {
        let query = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    pub async fn add_account_balance<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
        amount: i64,
    ) -> Result<Account, StoreError> {
        let query = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&query)
            .bind(amount)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    pub async fn create_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let query = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        );
        let transfer = sqlx::query_as::<_, Transfer>(&query)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.amount)
            .fetch_one(exec)
            .await?;
        Ok(transfer)
    }

    pub async fn get_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
    ) -> Result<Transfer, StoreError> {
        let query = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        sqlx::query_as::<_, Transfer>(&query)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("transfer", id))
    }

    pub async fn list_transfers<'e, E: PgExecutor<'e>>(
        exec: E,
        account_id: i64,
    ) -> Result<Vec<Transfer>, StoreError> {
        let query = format!(
            "SELECT {} FROM transfers WHERE from_account_id = $1 OR to_account_id = $1 ORDER BY id",
            TRANSFER_COLUMNS
        );
        let transfers = sqlx::query_as::<_, Transfer>(&query)
            .bind(account_id)
            .fetch_all(exec)
            .await?;
        Ok(transfers)
    }

    pub async fn create_entry<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateEntryParams,
    ) -> Result<Entry, StoreError> {
        let query = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, Entry>(&query)
            .bind(arg.account_id)
            .bind(arg.amount)
            .fetch_one(exec)
            .await?;
        Ok(entry)
    }

    pub async fn get_entry<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> Result<Entry, StoreError> {
        let query = format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS);
        sqlx::query_as::<_, Entry>(&query)
            .bind(id)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("entry", id))
    }

    pub async fn list_entries<'e, E: PgExecutor<'e>>(
        exec: E,
        account_id: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        let query = format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, Entry>(&query)
            .bind(account_id)
            .fetch_all(exec)
            .await?;
        Ok(entries)
    }

    pub async fn create_user<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: &CreateUserParams,
    ) -> Result<User, StoreError> {
        let query = format!(
            "INSERT INTO users (username, full_name, hashed_password, email) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&query)
            .bind(&arg.username)
            .bind(&arg.full_name)
            .bind(&arg.hashed_password)
            .bind(&arg.email)
            .fetch_one(exec)
            .await?;
        Ok(user)
    }

    pub async fn get_user<'e, E: PgExecutor<'e>>(
        exec: E,
        username: &str,
        for_update: bool,
    ) -> Result<User, StoreError> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let query = format!(
            "SELECT {} FROM users WHERE username = $1{}",
            USER_COLUMNS, lock
        );
        sqlx::query_as::<_, User>(&query)
            .bind(username)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    pub async fn update_user<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: &UpdateUserParams,
    ) -> Result<User, StoreError> {
        let query = format!(
            r#"
            UPDATE users SET
                full_name = COALESCE($1, full_name),
                hashed_password = COALESCE($2::VARCHAR, hashed_password),
                password_changed_at = CASE WHEN $2::VARCHAR IS NULL THEN password_changed_at ELSE NOW() END,
                email = COALESCE($3, email),
                is_email_verified = COALESCE($4, is_email_verified)
            WHERE username = $5
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        sqlx::query_as::<_, User>(&query)
            .bind(&arg.full_name)
            .bind(&arg.hashed_password)
            .bind(&arg.email)
            .bind(arg.is_email_verified)
            .bind(&arg.username)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("user", &arg.username))
    }

    pub async fn create_verify_email<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: &CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let query = format!(
            "INSERT INTO verify_emails (username, email, secret_code) VALUES ($1, $2, $3) RETURNING {}",
            VERIFY_EMAIL_COLUMNS
        );
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&query)
            .bind(&arg.username)
            .bind(&arg.email)
            .bind(&arg.secret_code)
            .fetch_one(exec)
            .await?;
        Ok(verify_email)
    }

    pub async fn get_unused_verify_email<'e, E: PgExecutor<'e>>(
        exec: E,
        username: &str,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        let query = format!(
            r#"
            SELECT {} FROM verify_emails
            WHERE username = $1 AND is_used = FALSE AND expired_at > NOW()
            ORDER BY id DESC
            LIMIT 1
            "#,
            VERIFY_EMAIL_COLUMNS
        );
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&query)
            .bind(username)
            .fetch_optional(exec)
            .await?;
        Ok(verify_email)
    }

    pub async fn consume_verify_email<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmail, StoreError> {
        let query = format!(
            r#"
            UPDATE verify_emails SET is_used = TRUE
            WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > NOW()
            RETURNING {}
            "#,
            VERIFY_EMAIL_COLUMNS
        );
        sqlx::query_as::<_, VerifyEmail>(&query)
            .bind(id)
            .bind(secret_code)
            .fetch_optional(exec)
            .await?
            .ok_or_else(|| StoreError::not_found("verify_email", id))
    }
}
