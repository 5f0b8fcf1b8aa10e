//! Store Error Types
//!
//! Every failure coming out of the data layer is a [`StoreError`]. Callers
//! match on the variant (or on [`StoreError::code`]) to tell a missing row
//! from a constraint violation from an infrastructure failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used for caller-supplied callbacks running inside a unit of work
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Integrity constraint class, derived from the Postgres SQLSTATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintCode {
    /// 23505
    UniqueViolation,
    /// 23503
    ForeignKeyViolation,
    /// 23514
    CheckViolation,
}

impl ConstraintCode {
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23505" => Some(ConstraintCode::UniqueViolation),
            "23503" => Some(ConstraintCode::ForeignKeyViolation),
            "23514" => Some(ConstraintCode::CheckViolation),
            _ => None,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            ConstraintCode::UniqueViolation => "23505",
            ConstraintCode::ForeignKeyViolation => "23503",
            ConstraintCode::CheckViolation => "23514",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintCode::UniqueViolation => "unique_violation",
            ConstraintCode::ForeignKeyViolation => "foreign_key_violation",
            ConstraintCode::CheckViolation => "check_violation",
        }
    }
}

impl fmt::Display for ConstraintCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{code} on {constraint}: {message}")]
    Constraint {
        code: ConstraintCode,
        constraint: String,
        message: String,
    },

    /// Arithmetic left the column's range (Postgres `22003`)
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Lock wait aborted: Postgres deadlock detection or a lock timeout
    #[error("lock conflict on {0}")]
    LockConflict(String),

    #[error("transaction deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("after-create callback failed: {0}")]
    Callback(#[source] BoxError),

    #[error("tx err: {cause}, rollback err: {rollback}")]
    RollbackFailed {
        #[source]
        cause: Box<StoreError>,
        rollback: Box<StoreError>,
    },

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn constraint(code: ConstraintCode, constraint: &str, message: impl Into<String>) -> Self {
        StoreError::Constraint {
            code,
            constraint: constraint.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Constraint { code, .. } => match code {
                ConstraintCode::UniqueViolation => "UNIQUE_VIOLATION",
                ConstraintCode::ForeignKeyViolation => "FOREIGN_KEY_VIOLATION",
                ConstraintCode::CheckViolation => "CHECK_VIOLATION",
            },
            StoreError::OutOfRange(_) => "OUT_OF_RANGE",
            StoreError::LockConflict(_) => "LOCK_CONFLICT",
            StoreError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            StoreError::Callback(_) => "CALLBACK_FAILED",
            StoreError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            StoreError::Migration(_) => "MIGRATION_FAILED",
            StoreError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// True if this error, or the cause behind a failed rollback, is a missing row
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::RollbackFailed { cause, .. } => cause.is_not_found(),
            _ => false,
        }
    }

    pub fn constraint_code(&self) -> Option<ConstraintCode> {
        match self {
            StoreError::Constraint { code, .. } => Some(*code),
            StoreError::RollbackFailed { cause, .. } => cause.constraint_code(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            let sqlstate = db_err.code();
            let sqlstate = sqlstate.as_deref().unwrap_or_default();
            if let Some(code) = ConstraintCode::from_sqlstate(sqlstate) {
                return StoreError::Constraint {
                    code,
                    constraint: db_err.constraint().unwrap_or_default().to_string(),
                    message: db_err.message().to_string(),
                };
            }
            // numeric_value_out_of_range
            if sqlstate == "22003" {
                return StoreError::OutOfRange(db_err.message().to_string());
            }
            // deadlock_detected, lock_not_available
            if sqlstate == "40P01" || sqlstate == "55P03" {
                return StoreError::LockConflict(db_err.message().to_string());
            }
        }
        StoreError::Database(e)
    }
}
