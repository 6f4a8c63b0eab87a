//! Account model.
//!
//! Maintains the invariant: `balance >= 0` at all times.

use crate::ids::{AccountId, UserId};
use crate::money::Money;
use serde::Serialize;

/// A user's account, denominated in the base currency.
///
/// # Invariants
///
/// - `balance` is never negative, neither inside a unit of work nor between
///   them
/// - Staged changes are checked with [`Account::preview`] and published with
///   [`Account::apply`]; the store does both on behalf of the engine's debit
///   and credit steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,

    /// The user this account belongs to (1:1).
    pub owner: UserId,

    pub balance: Money,
}

impl Account {
    /// Creates a new account for a user with a zero balance.
    pub fn open(owner: UserId) -> Self {
        Account {
            id: AccountId::generate(),
            owner,
            balance: Money::ZERO,
        }
    }

    /// Returns the balance after applying `delta`, without changing `self`.
    ///
    /// Returns `None` if the result would be negative or overflow.
    pub fn preview(&self, delta: Money) -> Option<Money> {
        self.balance
            .checked_add(delta)
            .filter(|balance| !balance.is_negative())
    }

    /// Applies a signed delta to the balance.
    ///
    /// Returns `false` and leaves the balance unchanged if the result would
    /// be negative.
    pub fn apply(&mut self, delta: Money) -> bool {
        match self.preview(delta) {
            Some(balance) => {
                self.balance = balance;
                true
            }
            None => false,
        }
    }
}
