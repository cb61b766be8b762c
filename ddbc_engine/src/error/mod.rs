use crate::driver::HandleKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message reported when a driver call fails without leaving any diagnostic record.
pub const NO_DIAGNOSTICS_MESSAGE: &str = "No diagnostic information available";

/// Error category for decision-making (retry, abort, reconnect, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry may resolve
    Transient,
    /// Fatal error - should abort operation
    Fatal,
    /// Validation error - invalid user input
    Validation,
    /// Connection lost - should reconnect
    ConnectionLost,
}

/// One diagnostic record as returned by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub sql_state: String,
    pub native_error: i32,
    pub message: String,
}

/// SQL state plus message text attached to every driver-originated error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub sql_state: String,
    pub native_error: i32,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql_state: sql_state.into(),
            native_error: 0,
            message: message.into(),
        }
    }

    /// Info without a SQL state, for failures detected before any driver call.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(String::new(), message)
    }

    /// Folds diagnostic records into one info. The first record supplies the
    /// SQL state and native code, messages are joined with `"; "`.
    pub fn from_records(records: &[DiagnosticRecord]) -> Self {
        let Some(first) = records.first() else {
            return Self::message(NO_DIAGNOSTICS_MESSAGE);
        };
        let message = records
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            sql_state: first.sql_state.clone(),
            native_error: first.native_error,
            message,
        }
    }

    fn sql_state_class(&self) -> &str {
        self.sql_state.get(..2).unwrap_or("")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.sql_state, self.message)
        }
    }
}

fn row_suffix(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!(" (row {row})"),
        None => String::new(),
    }
}

#[derive(Error, Debug, Clone)]
pub enum DdbcError {
    #[error("Failed to allocate {kind} handle: {info}")]
    Allocation { kind: HandleKind, info: ErrorInfo },

    #[error("Connection error: {0}")]
    Connection(ErrorInfo),

    #[error("Transaction error: {0}")]
    Transaction(ErrorInfo),

    #[error("Configuration error: {0}")]
    Config(ErrorInfo),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Execution error{}: {info}", row_suffix(.row))]
    Execution { info: ErrorInfo, row: Option<usize> },

    #[error(
        "Parameter's object type does not match parameter's C type. paramIndex - {param_index}, C type - {c_type}{}",
        row_suffix(.row)
    )]
    TypeMismatch {
        param_index: usize,
        c_type: &'static str,
        row: Option<usize>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Bulk copy error: {0}")]
    BulkCopy(ErrorInfo),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DdbcError {
    pub fn info(&self) -> Option<&ErrorInfo> {
        match self {
            DdbcError::Allocation { info, .. }
            | DdbcError::Execution { info, .. }
            | DdbcError::Connection(info)
            | DdbcError::Transaction(info)
            | DdbcError::Config(info)
            | DdbcError::BulkCopy(info) => Some(info),
            _ => None,
        }
    }

    /// Five-character SQL state, empty when the error did not come from the driver.
    pub fn sql_state(&self) -> &str {
        self.info().map(|i| i.sql_state.as_str()).unwrap_or("")
    }

    pub fn native_error(&self) -> i32 {
        self.info().map(|i| i.native_error).unwrap_or(0)
    }

    /// Tags an execution or type-mismatch error with the 1-based row of an
    /// `executemany` batch.
    pub(crate) fn at_row(self, row_number: usize) -> Self {
        match self {
            DdbcError::Execution { info, .. } => DdbcError::Execution {
                info,
                row: Some(row_number),
            },
            DdbcError::TypeMismatch {
                param_index,
                c_type,
                ..
            } => DdbcError::TypeMismatch {
                param_index,
                c_type,
                row: Some(row_number),
            },
            other => other,
        }
    }

    /// Returns true if the error is transient and may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            DdbcError::PoolExhausted(_) => true,
            other => other
                .info()
                .map(|i| i.sql_state_class() == "08" || i.sql_state == "HYT00")
                .unwrap_or(false),
        }
    }

    /// Returns true if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        match self {
            DdbcError::Connection(_) => true,
            other => other
                .info()
                .map(|i| i.sql_state_class() == "08")
                .unwrap_or(false),
        }
    }

    /// Returns the error category for decision-making
    pub fn error_category(&self) -> ErrorCategory {
        if matches!(
            self,
            DdbcError::InvalidArgument(_) | DdbcError::TypeMismatch { .. } | DdbcError::State(_)
        ) {
            return ErrorCategory::Validation;
        }
        if self.is_connection_error() {
            return ErrorCategory::ConnectionLost;
        }
        if self.is_retryable() {
            return ErrorCategory::Transient;
        }
        ErrorCategory::Fatal
    }
}

pub type Result<T> = std::result::Result<T, DdbcError>;
