//! Redeeming an email verification code

use serde::{Deserialize, Serialize};
use tracing::info;

use super::registration::UserService;
use crate::store::{Store, StoreError, UpdateUserParams, User, VerifyEmail};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

/// Mark the code used and the user's email verified, in one transaction.
///
/// A wrong, used or expired code is [`StoreError::NotFound`] and changes
/// nothing.
pub async fn verify_email_tx(
    store: &Store,
    params: VerifyEmailTxParams,
) -> Result<VerifyEmailTxResult, StoreError> {
    let VerifyEmailTxParams {
        email_id,
        secret_code,
    } = params;

    let result = store
        .exec_tx(move |q| {
            Box::pin(async move {
                let verify_email = q.consume_verify_email(email_id, &secret_code).await?;
                let user = q
                    .update_user(UpdateUserParams {
                        username: verify_email.username.clone(),
                        is_email_verified: Some(true),
                        ..Default::default()
                    })
                    .await?;
                Ok(VerifyEmailTxResult { user, verify_email })
            })
        })
        .await?;

    info!(
        username = %result.user.username,
        email_id,
        "Email verified"
    );
    Ok(result)
}

impl UserService {
    pub async fn verify_email(
        &self,
        params: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        verify_email_tx(self.store(), params).await
    }
}
