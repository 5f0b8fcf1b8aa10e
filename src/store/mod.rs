//! Data layer and Unit-of-Work Executor
//!
//! [`Store`] is the only place that begins, commits or rolls back a
//! transaction. Higher-level operations hand it a closure that receives a
//! transaction-bound [`Queries`] handle; the closure's result decides
//! commit or rollback.
//!
//! # Backends
//!
//! - [`postgres::PgBackend`] - PostgreSQL via `sqlx`
//! - [`memory::MemoryBackend`] - in-process fake with row locks, for tests

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;

pub use error::{BoxError, ConstraintCode, StoreError};
pub use models::{Account, Entry, Transfer, User, VerifyEmail};
pub use queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Queries, UpdateUserParams,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

/// An open transaction
pub trait TxHandle: Send {
    /// Query handle bound to this transaction
    fn queries(&mut self) -> &mut dyn Queries;

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Storage backend able to hand out ambient and transactional query handles
#[async_trait]
pub trait TxBackend: Send + Sync {
    /// Handle bound to the ambient connection; every call autocommits
    fn queries(&self) -> Box<dyn Queries>;

    async fn begin(&self) -> Result<Box<dyn TxHandle>, StoreError>;
}

/// Entry point to the data layer
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn TxBackend>,
    tx_timeout: Option<Duration>,
}

impl Store {
    pub fn new(backend: Arc<dyn TxBackend>) -> Self {
        Self {
            backend,
            tx_timeout: None,
        }
    }

    /// Deadline applied to every unit of work run through [`Store::exec_tx`]
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = Some(timeout);
        self
    }

    /// Non-transactional handle for plain reads and single-statement writes
    pub fn queries(&self) -> Box<dyn Queries> {
        self.backend.queries()
    }

    /// Run `f` as one unit of work.
    ///
    /// `Ok` commits and propagates any commit error. `Err` (including an
    /// expired deadline) rolls back; if the rollback itself fails, the result
    /// is [`StoreError::RollbackFailed`] carrying both errors. No retries.
    pub async fn exec_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut dyn Queries) -> BoxFuture<'q, Result<T, StoreError>> + Send,
    {
        self.run_tx(self.tx_timeout, f).await
    }

    /// [`Store::exec_tx`] with an explicit deadline for this call only
    pub async fn exec_tx_within<T, F>(&self, deadline: Duration, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut dyn Queries) -> BoxFuture<'q, Result<T, StoreError>> + Send,
    {
        self.run_tx(Some(deadline), f).await
    }

    async fn run_tx<T, F>(&self, deadline: Option<Duration>, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'q> FnOnce(&'q mut dyn Queries) -> BoxFuture<'q, Result<T, StoreError>> + Send,
    {
        let mut tx = self.backend.begin().await?;

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, f(tx.queries())).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::DeadlineExceeded(limit)),
            },
            None => f(tx.queries()).await,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => {
                    warn!(error = %cause, "Transaction rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(error = %cause, rollback_error = %rollback, "Transaction rollback failed");
                    Err(StoreError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    })
                }
            },
        }
    }
}
