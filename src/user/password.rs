//! Password hashing (Argon2id, PHC string format)

use anyhow::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

pub const MIN_PASSWORD_LEN: usize = 6;

/// Hash `password` with a fresh random salt
pub fn hash_password(password: &str) -> Result<String> {
    if password.len() < MIN_PASSWORD_LEN {
        anyhow::bail!("password must be at least {} characters", MIN_PASSWORD_LEN);
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored hash
pub fn check_password(password: &str, hashed_password: &str) -> Result<()> {
    let parsed = PasswordHash::new(hashed_password)
        .map_err(|e| anyhow::anyhow!("Invalid hash format: {}", e))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| anyhow::anyhow!("Invalid credentials"))
}
