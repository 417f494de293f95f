//! Error types for Basalt
//!
//! Every failure falls into one of three classes, and callers are expected to
//! branch on [`BasaltError::class`]:
//!
//! - **Conflict**: retry the whole transaction. The engine has already aborted it.
//! - **Logical**: the single operation was invalid; the transaction is untouched.
//! - **Fatal**: durability can no longer be guaranteed. The engine halts.

use std::fmt;
use std::io;

use crate::types::{Lsn, RowKey, TxnId};

/// Coarse classification of an error, used to pick a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with a fresh transaction
    Conflict,
    /// The operation is invalid; transaction state is unchanged
    Logical,
    /// The system is down; operator-driven recovery required
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Logical => write!(f, "logical"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Unified error type for Basalt operations
#[derive(Debug)]
pub enum BasaltError {
    /// I/O error on the log or page store
    Io(io::Error),
    /// Binary encoding/decoding of a page or log frame failed
    Codec(String),
    /// JSON error in the checkpoint marker
    Json(String),
    /// A live committed version already exists for the key
    KeyConflict(RowKey),
    /// Snapshot isolation or serializability would be violated
    SerializationFailure(String),
    /// The transaction was chosen as a deadlock victim
    Deadlock(TxnId),
    /// Waiting for a row lock exceeded the configured timeout
    LockTimeout(RowKey),
    /// No version of the key is visible to the transaction
    NotFound(RowKey),
    /// Unknown transaction, or one that is no longer active
    InvalidTransaction(String),
    /// Operation not allowed in the engine's current state
    InvalidState(String),
    /// The log could not be read past `last_good_lsn`
    CorruptLog { last_good_lsn: Lsn, reason: String },
    /// A previous fatal error stopped the engine
    Halted(String),
    /// Internal invariant broken (poisoned lock, missing log record)
    Internal(String),
}

impl BasaltError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            BasaltError::KeyConflict(_)
            | BasaltError::SerializationFailure(_)
            | BasaltError::Deadlock(_)
            | BasaltError::LockTimeout(_) => ErrorClass::Conflict,
            BasaltError::NotFound(_)
            | BasaltError::InvalidTransaction(_)
            | BasaltError::InvalidState(_) => ErrorClass::Logical,
            BasaltError::Io(_)
            | BasaltError::Codec(_)
            | BasaltError::Json(_)
            | BasaltError::CorruptLog { .. }
            | BasaltError::Halted(_)
            | BasaltError::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the caller should retry with a fresh transaction
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// SQLSTATE code a query layer would report for this error
    pub fn sql_state(&self) -> &'static str {
        match self {
            BasaltError::KeyConflict(_) => "23505",
            BasaltError::SerializationFailure(_) => "40001",
            BasaltError::Deadlock(_) => "40P01",
            BasaltError::LockTimeout(_) => "55P03",
            BasaltError::NotFound(_) => "02000",
            BasaltError::InvalidTransaction(_) => "25P01",
            BasaltError::InvalidState(_) => "55000",
            BasaltError::CorruptLog { .. } => "XX001",
            _ => "XX000",
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        BasaltError::Internal(format!("{} lock poisoned", what))
    }
}

impl fmt::Display for BasaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasaltError::Io(e) => write!(f, "I/O error: {}", e),
            BasaltError::Codec(msg) => write!(f, "encoding error: {}", msg),
            BasaltError::Json(msg) => write!(f, "checkpoint marker error: {}", msg),
            BasaltError::KeyConflict(key) => write!(f, "duplicate key {}", key),
            BasaltError::SerializationFailure(msg) => {
                write!(f, "could not serialize access: {}", msg)
            }
            BasaltError::Deadlock(txn) => {
                write!(f, "deadlock detected, transaction {} chosen as victim", txn)
            }
            BasaltError::LockTimeout(key) => write!(f, "lock wait timeout on {}", key),
            BasaltError::NotFound(key) => write!(f, "no visible version of {}", key),
            BasaltError::InvalidTransaction(msg) => write!(f, "{}", msg),
            BasaltError::InvalidState(msg) => write!(f, "{}", msg),
            BasaltError::CorruptLog { last_good_lsn, reason } => write!(
                f,
                "log corrupted after LSN {}: {}",
                last_good_lsn, reason
            ),
            BasaltError::Halted(msg) => write!(f, "engine halted: {}", msg),
            BasaltError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BasaltError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BasaltError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BasaltError {
    fn from(e: io::Error) -> Self {
        BasaltError::Io(e)
    }
}

impl From<bincode::Error> for BasaltError {
    fn from(e: bincode::Error) -> Self {
        BasaltError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for BasaltError {
    fn from(e: serde_json::Error) -> Self {
        BasaltError::Json(e.to_string())
    }
}

/// Result type alias for Basalt operations
pub type Result<T> = std::result::Result<T, BasaltError>;
