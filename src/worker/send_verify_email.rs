//! `task:send_verify_email` - issue a verification code and email it
//!
//! Delivery is at-least-once, so the handler is idempotent: under the user's
//! row lock it reuses the newest unused, unexpired code and only creates one
//! when none exists. Re-delivery may send the email again but never creates
//! a second live code.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::HandlerError;
use super::processor::TaskHandler;
use super::task::TaskInfo;
use crate::config::VerifyEmailConfig;
use crate::mail::{EmailMessage, EmailSender};
use crate::store::{CreateVerifyEmailParams, Store, User, VerifyEmail};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

const SECRET_CODE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Random alphanumeric verification secret
pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

pub struct SendVerifyEmailHandler {
    store: Store,
    mailer: Arc<dyn EmailSender>,
    config: VerifyEmailConfig,
}

impl SendVerifyEmailHandler {
    pub fn new(store: Store, mailer: Arc<dyn EmailSender>, config: VerifyEmailConfig) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    fn verify_url(&self, verify_email: &VerifyEmail) -> String {
        format!(
            "{}?email_id={}&secret_code={}",
            self.config.url_base, verify_email.id, verify_email.secret_code
        )
    }

    fn message(&self, user: &User, verify_email: &VerifyEmail) -> EmailMessage {
        EmailMessage {
            subject: "Welcome to Simple Bank".to_string(),
            html: format!(
                "Hello {},<br/>\
                 Thank you for registering with us!<br/>\
                 Please <a href=\"{}\">click here</a> to verify your email address.<br/>",
                user.full_name,
                self.verify_url(verify_email)
            ),
            to: vec![verify_email.email.clone()],
            ..Default::default()
        }
    }

    /// Find or create the live code for `username` under its row lock.
    /// `None` when the email is already verified.
    async fn issue_code(
        &self,
        username: String,
    ) -> Result<(User, Option<VerifyEmail>), HandlerError> {
        self.store
            .exec_tx(move |q| {
                Box::pin(async move {
                    let user = q.get_user_for_update(&username).await?;
                    if user.is_email_verified {
                        return Ok((user, None));
                    }
                    if let Some(existing) = q.get_unused_verify_email(&user.username).await? {
                        return Ok((user, Some(existing)));
                    }
                    let created = q
                        .create_verify_email(CreateVerifyEmailParams {
                            username: user.username.clone(),
                            email: user.email.clone(),
                            secret_code: random_secret_code(),
                        })
                        .await?;
                    Ok((user, Some(created)))
                })
            })
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    HandlerError::skip_retry(format!("user doesn't exist: {}", e))
                } else {
                    HandlerError::Failed(
                        anyhow::Error::new(e).context("failed to create verify email"),
                    )
                }
            })
    }
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn handle(&self, task: &TaskInfo) -> Result<(), HandlerError> {
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload)
            .map_err(|e| HandlerError::skip_retry(format!("failed to unmarshal payload: {}", e)))?;

        let (user, verify_email) = self.issue_code(payload.username).await?;
        let Some(verify_email) = verify_email else {
            info!(username = %user.username, "Email already verified, nothing to send");
            return Ok(());
        };

        self.mailer
            .send_email(&self.message(&user, &verify_email))
            .await?;

        info!(
            task_id = task.id,
            username = %user.username,
            email = %user.email,
            verify_email_id = verify_email.id,
            "Processed task"
        );
        Ok(())
    }
}
