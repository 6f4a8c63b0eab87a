//! Currency codes.

use crate::error::LedgerError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An uppercase alphabetic currency code such as `RUB` or `USD`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(String);

impl Currency {
    /// For codes known to be well-formed at compile time.
    pub(crate) fn known(code: &'static str) -> Self {
        Currency(code.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    /// Accepts 3 ASCII letters in any case, surrounded by optional whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(LedgerError::InvalidCurrency(code.to_string()));
        }
        Ok(Currency(code.to_ascii_uppercase()))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Currency {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}
