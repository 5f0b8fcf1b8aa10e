//! Users: registration, password hashing and email verification

pub mod password;
pub mod registration;
pub mod verify_email;

pub use password::{check_password, hash_password};
pub use registration::{
    RegisterUserRequest, RegistrationError, UserService, create_user_tx,
    verify_email_task_options,
};
pub use verify_email::{VerifyEmailTxParams, VerifyEmailTxResult, verify_email_tx};

