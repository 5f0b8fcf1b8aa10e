//! Simple Bank - transactional core
//!
//! Ledger transfers, user registration with an outbox-style follow-up task,
//! and a durable priority task queue, all on top of PostgreSQL.
//!
//! # Modules
//!
//! - [`store`] - Unit-of-work executor, query layer, Postgres and in-memory backends
//! - [`transfer`] - Money transfers with deadlock-free lock ordering
//! - [`user`] - Registration, password hashing and email verification
//! - [`worker`] - Task distributor, task queue and task processor
//! - [`mail`] - Outbound email
//! - [`config`] - YAML configuration
//! - [`logging`] - `tracing` subscriber setup

pub mod config;
pub mod logging;
pub mod mail;
pub mod store;
pub mod transfer;
pub mod user;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use store::{Store, StoreError};
pub use transfer::{TransferCoordinator, TransferError, TransferTxParams, TransferTxResult};
pub use user::{UserService, VerifyEmailTxParams, VerifyEmailTxResult};
pub use worker::{TaskDistributor, TaskProcessor};
