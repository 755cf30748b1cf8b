use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable error taxonomy surfaced on every abort (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCode {
    /// Routing: no candidate route.
    E001,
    /// Routing: insufficient capacity on a segment.
    E002,
    /// TrustLine: limit exceeded.
    E003,
    /// TrustLine: not active.
    E004,
    /// Auth: invalid signature.
    E005,
    /// Auth: insufficient permissions.
    E006,
    /// Timeout: operation timeout.
    E007,
    /// Conflict: state conflict (includes invariant violations).
    E008,
    /// Validation: invalid input.
    E009,
    /// Internal: internal error.
    E010,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::E001 => "Route not found",
            ErrorCode::E002 => "Insufficient capacity",
            ErrorCode::E003 => "Trust line limit exceeded",
            ErrorCode::E004 => "Trust line not active",
            ErrorCode::E005 => "Invalid signature",
            ErrorCode::E006 => "Insufficient permissions",
            ErrorCode::E007 => "Operation timeout",
            ErrorCode::E008 => "State conflict",
            ErrorCode::E009 => "Validation error",
            ErrorCode::E010 => "Internal server error",
        }
    }

    /// Permanent failures a client should not blindly retry (E002-E005, E008-E009).
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorCode::E002
                | ErrorCode::E003
                | ErrorCode::E004
                | ErrorCode::E005
                | ErrorCode::E008
                | ErrorCode::E009
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Structured error object persisted on an aborted Transaction row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            details: Value::Null,
        }
    }
}

/// The ledger core's single error type. Every fallible operation returns
/// `Result<T, LedgerError>`; the payment/clearing engines translate any
/// non-transport error into an `ErrorObject` before persisting an abort.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("routing failure: {message}")]
    Routing {
        message: String,
        insufficient_capacity: bool,
        details: Value,
    },

    #[error("{message}")]
    Invalid { message: String, details: Value },

    #[error("invariant violation [{code}]: {message}")]
    IntegrityViolation {
        code: &'static str,
        message: String,
        details: Value,
    },

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Maps any internal error onto the stable E001-E010 taxonomy for the
    /// abort path (spec §7 propagation policy).
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            LedgerError::NotFound(m) => {
                ErrorObject::new(ErrorCode::E009, m.clone(), Value::Null)
            }
            LedgerError::Conflict(m) => ErrorObject::new(ErrorCode::E008, m.clone(), Value::Null),
            LedgerError::Routing {
                message,
                insufficient_capacity,
                details,
            } => {
                let code = if *insufficient_capacity {
                    ErrorCode::E002
                } else {
                    ErrorCode::E001
                };
                ErrorObject::new(code, message.clone(), details.clone())
            }
            LedgerError::Invalid { message, details } => {
                ErrorObject::new(ErrorCode::E009, message.clone(), details.clone())
            }
            LedgerError::IntegrityViolation {
                message, details, ..
            } => ErrorObject::new(ErrorCode::E008, message.clone(), details.clone()),
            LedgerError::InvalidSignature(m) => {
                ErrorObject::new(ErrorCode::E005, m.clone(), Value::Null)
            }
            LedgerError::Database(e) => {
                ErrorObject::new(ErrorCode::E010, e.to_string(), Value::Null)
            }
            LedgerError::Serialization(e) => {
                ErrorObject::new(ErrorCode::E009, e.to_string(), Value::Null)
            }
            LedgerError::Internal(m) => ErrorObject::new(ErrorCode::E010, m.clone(), Value::Null),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.to_error_object().code
    }

    pub fn integrity(invariant: &'static str, message: impl Into<String>, details: Value) -> Self {
        LedgerError::IntegrityViolation {
            code: invariant,
            message: message.into(),
            details,
        }
    }

    /// True for a Postgres serialization-failure or deadlock SQLSTATE (40001/40P01).
    pub fn is_retryable_db_error(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::Database(db_err)) => {
                matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }

    pub fn pgcode(&self) -> Option<String> {
        match self {
            LedgerError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().map(|c| c.to_string())
            }
            _ => None,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
