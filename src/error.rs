//! Error types for the ledger service.

use crate::config::ConfigError;
use crate::ids::{AccountId, UserId};
use crate::money::Money;
use crate::store::StorageFault;
use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur during ledger operation.
///
/// Every variant except [`LedgerError::Storage`] is raised before any balance
/// is touched. A storage fault rolls the enclosing unit back, so no variant
/// ever leaves partial state behind.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Deposit or transfer amount (before or after conversion) is not positive
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Money),

    /// Transfer source and destination are the same account
    #[error("Source and destination account are the same: {0}")]
    SameAccount(AccountId),

    /// Email is empty or lacks a local part or domain
    #[error("Invalid email: {0:?}")]
    InvalidEmail(String),

    /// Currency code is not three ASCII letters
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// Currency code is well formed but has no configured rate
    #[error("Currency not supported: {0}")]
    UnsupportedCurrency(String),

    /// Account id does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Authenticated user has no account
    #[error("Sender account not found for user {0}")]
    SenderAccountNotFound(UserId),

    /// Acting user's email is not registered
    #[error("No user registered with email: {0}")]
    UserNotFound(String),

    /// Transfer recipient's email is not registered
    #[error("Recipient account not found for email: {0}")]
    RecipientNotFound(String),

    /// Source balance is below the converted transfer amount
    #[error(
        "Insufficient funds in account {account}: available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account: AccountId,
        available: Money,
        requested: Money,
    },

    /// Email belongs to an existing user
    #[error("Email already registered: {0}")]
    EmailTaken(String),

    /// Idempotency key was first used with different transfer parameters
    #[error("Idempotency key {0:?} was already used for a different transfer")]
    IdempotencyConflict(String),

    /// Store failure; the enclosing unit was rolled back
    #[error("Storage fault: {0}")]
    Storage(#[from] StorageFault),

    /// Batch row could not be parsed into a command
    #[error("Invalid command at row {row}: {message}")]
    InvalidCommand { row: usize, message: String },

    /// Configuration or rate table could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error reading input or writing output
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing or writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Missing command-line argument
    #[error(
        "Missing input file argument. Usage: ledger-service <commands.csv> [--history <email>]"
    )]
    MissingArgument,
}

/// Coarse classification of [`LedgerError`], for callers mapping failures
/// onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientFunds,
    UnsupportedCurrency,
    Conflict,
    StorageFault,
    Environment,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SameAccount(_)
            | LedgerError::InvalidEmail(_)
            | LedgerError::InvalidCurrency(_)
            | LedgerError::InvalidCommand { .. } => ErrorKind::Validation,
            LedgerError::AccountNotFound(_)
            | LedgerError::SenderAccountNotFound(_)
            | LedgerError::UserNotFound(_)
            | LedgerError::RecipientNotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::UnsupportedCurrency(_) => ErrorKind::UnsupportedCurrency,
            LedgerError::EmailTaken(_) | LedgerError::IdempotencyConflict(_) => {
                ErrorKind::Conflict
            }
            LedgerError::Storage(_) => ErrorKind::StorageFault,
            LedgerError::Config(_)
            | LedgerError::Io(_)
            | LedgerError::Csv(_)
            | LedgerError::MissingArgument => ErrorKind::Environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            LedgerError::InvalidAmount(Money::ZERO).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LedgerError::RecipientNotFound("x@y".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LedgerError::Storage(StorageFault::LockTimeout(AccountId::generate())).kind(),
            ErrorKind::StorageFault
        );
        assert_eq!(
            LedgerError::UnsupportedCurrency("GBP".into()).kind(),
            ErrorKind::UnsupportedCurrency
        );
    }

    #[test]
    fn test_insufficient_funds_message() {
        let err = LedgerError::InsufficientFunds {
            account: AccountId::generate(),
            available: Money::units(100),
            requested: Money::units(200),
        };
        let message = err.to_string();
        assert!(message.contains("available 100.00"));
        assert!(message.contains("requested 200.00"));
    }
}
