//! Opaque identifiers for users, accounts and transfers.
//!
//! All identifiers are UUID v7, so they are time-ordered and totally ordered.
//! The engine relies on the ordering of [`AccountId`] to lock rows in a fixed
//! sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh time-ordered identifier.
            pub fn generate() -> Self {
                $name(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                $name(value)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

define_id!(
    /// Identity of an account row.
    AccountId
);

define_id!(
    /// Identity of a registered user.
    UserId
);

define_id!(
    /// Identity of a ledger record.
    TransferId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_ordered() {
        let first = AccountId::generate();
        let second = AccountId::generate();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_parse_round_trips_display() {
        let id = UserId::generate();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("not-a-uuid".parse::<TransferId>().is_err());
    }
}
