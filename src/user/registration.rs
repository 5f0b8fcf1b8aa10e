//! User registration with an outbox-style follow-up task
//!
//! The user row and the enqueue of `task:send_verify_email` share one unit of
//! work: the enqueue runs as the last step inside the transaction, and an
//! enqueue failure rolls the user back. The reverse gap remains: if the
//! commit fails after a successful enqueue, the task is orphaned and the
//! handler archives it because the user does not exist.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::password::hash_password;
use crate::store::{BoxError, CreateUserParams, Store, StoreError, User};
use crate::worker::{PayloadSendVerifyEmail, QueueClass, TaskDistributor, TaskOptions};

/// Verification emails get a short delay so the commit lands first
pub fn verify_email_task_options() -> TaskOptions {
    TaskOptions::default()
        .max_retry(10)
        .process_in(Duration::from_secs(10))
        .queue(QueueClass::Critical)
}

/// Insert a user and run `after_create` inside the same transaction.
///
/// The callback sees the inserted row. If it fails, the user is rolled back
/// and the callback's error comes back as [`StoreError::Callback`].
pub async fn create_user_tx<F>(
    store: &Store,
    arg: CreateUserParams,
    after_create: F,
) -> Result<User, StoreError>
where
    F: FnOnce(User) -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static,
{
    store
        .exec_tx(move |q| {
            Box::pin(async move {
                let user = q.create_user(arg).await?;
                after_create(user.clone())
                    .await
                    .map_err(StoreError::Callback)?;
                Ok(user)
            })
        })
        .await
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistrationError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::InvalidPassword(_) => "INVALID_PASSWORD",
            RegistrationError::Store(e) => e.code(),
        }
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            RegistrationError::Store(e) => Some(e),
            RegistrationError::InvalidPassword(_) => None,
        }
    }
}

/// User Service - registration and email verification
#[derive(Clone)]
pub struct UserService {
    store: Store,
    distributor: Arc<dyn TaskDistributor>,
}

impl UserService {
    pub fn new(store: Store, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self { store, distributor }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create the user and enqueue its verification email atomically
    pub async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        let distributor = self.distributor.clone();
        let username = arg.username.clone();

        let result = create_user_tx(&self.store, arg, move |user| {
            Box::pin(async move {
                let payload = PayloadSendVerifyEmail {
                    username: user.username,
                };
                distributor
                    .distribute_task_send_verify_email(&payload, verify_email_task_options())
                    .await
                    .map(|_| ())
                    .map_err(BoxError::from)
            })
        })
        .await;

        match &result {
            Ok(user) => info!(username = %user.username, "User registered"),
            Err(e) => warn!(username = %username, error = %e, code = e.code(), "User registration failed"),
        }
        result
    }

    /// Hash the password, then [`UserService::create_user`]
    pub async fn register(&self, req: RegisterUserRequest) -> Result<User, RegistrationError> {
        let hashed_password = hash_password(&req.password)
            .map_err(|e| RegistrationError::InvalidPassword(e.to_string()))?;

        let user = self
            .create_user(CreateUserParams {
                username: req.username,
                full_name: req.full_name,
                hashed_password,
                email: req.email,
            })
            .await?;
        Ok(user)
    }
}
