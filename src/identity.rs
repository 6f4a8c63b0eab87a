//! Users and the authenticated principal handed to the core.

use crate::error::{LedgerError, Result};
use crate::ids::UserId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A registered user. Owns exactly one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,

    /// Normalized (trimmed, lowercase) and unique across users.
    pub email: String,

    pub full_name: String,

    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new user record. The email must already be normalized.
    pub fn new(email: String, full_name: String) -> Self {
        User {
            id: UserId::generate(),
            email,
            full_name,
            created_at: Utc::now(),
        }
    }
}

/// An already-authenticated caller.
///
/// The core performs no authentication; whoever constructs a `Principal` is
/// vouching for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
}

impl Principal {
    pub fn new(user_id: UserId) -> Self {
        Principal { user_id }
    }
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Principal::new(user.id)
    }
}

/// Normalizes an email for storage and lookup.
///
/// Rejects empty input and input without an `@` between non-empty parts.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(LedgerError::InvalidEmail(raw.trim().to_string())),
    }
}
