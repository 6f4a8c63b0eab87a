//! Batch command models for CSV parsing.

use crate::money::Money;
use serde::Deserialize;
use std::str::FromStr;

/// Raw command record as read from CSV.
///
/// Every field after `type` is optional so that rows can omit trailing
/// columns that do not apply to them.
#[derive(Debug, Deserialize)]
pub struct CommandRecord {
    /// Command type: register, deposit, transfer
    #[serde(rename = "type")]
    pub kind: String,

    /// Email of the acting user
    pub user: String,

    /// Recipient email for transfers; display name for registrations
    #[serde(default)]
    pub recipient: Option<String>,

    #[serde(default)]
    pub amount: Option<String>,

    /// Requested currency for transfers; empty means the base currency
    #[serde(default)]
    pub currency: Option<String>,
}

impl CommandRecord {
    /// Parses the raw CSV record into a typed command.
    ///
    /// Returns an error message for unknown types and missing or malformed
    /// fields. Email and currency syntax are left to the engine.
    pub fn parse(&self) -> Result<Command, String> {
        let user = self.user.trim().to_string();
        if user.is_empty() {
            return Err("missing user".to_string());
        }

        match self.kind.trim().to_lowercase().as_str() {
            "register" => Ok(Command::Register {
                email: user,
                full_name: field(&self.recipient).unwrap_or_default(),
            }),
            "deposit" => Ok(Command::Deposit {
                email: user,
                amount: self.parse_amount()?,
            }),
            "transfer" => Ok(Command::Transfer {
                from: user,
                to: field(&self.recipient).ok_or("missing recipient")?,
                amount: self.parse_amount()?,
                currency: field(&self.currency),
            }),
            other => Err(format!("unknown command type {:?}", other)),
        }
    }

    fn parse_amount(&self) -> Result<Money, String> {
        let raw = field(&self.amount).ok_or("missing amount")?;
        Money::from_str(&raw).map_err(|e| format!("invalid amount {:?}: {}", raw, e))
    }
}

/// Trimmed, non-empty field value.
fn field(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A parsed command ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a user and their zero-balance account.
    Register { email: String, full_name: String },

    /// Credit the user's account.
    Deposit { email: String, amount: Money },

    /// Move funds to the account registered under `to`.
    Transfer {
        from: String,
        to: String,
        amount: Money,
        currency: Option<String>,
    },
}
