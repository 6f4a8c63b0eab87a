//! Account store and transfer ledger persistence.
//!
//! The engine only ever talks to these traits. A [`Store`] serves read-only
//! lookups and opens units of work; a [`UnitOfWork`] is the atomic unit in
//! which every balance mutation happens.
//!
//! # Isolation contract
//!
//! - Reads inside a unit see committed data plus the unit's own writes
//! - [`UnitOfWork::lock_for_update`] and [`UnitOfWork::apply_delta`] hold an
//!   exclusive row lock until the unit commits or is dropped
//! - A waiter blocks until the holder finishes, up to the store's lock timeout
//! - Dropping a unit without committing discards every staged write

pub mod memory;

pub use memory::{FaultPoint, MemoryStore};

use crate::account::Account;
use crate::identity::User;
use crate::ids::{AccountId, UserId};
use crate::ledger::{HistoryCursor, HistoryPage, IdempotencyKey, TransferRecord};
use crate::money::Money;
use thiserror::Error;

/// Failures of the underlying store.
///
/// Any of these aborts the enclosing unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageFault {
    #[error("timed out waiting for row lock on account {0}")]
    LockTimeout(AccountId),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Unique-email constraint on the users relation.
    #[error("duplicate email {0}")]
    DuplicateEmail(String),

    #[error("row not found: account {0}")]
    MissingRow(AccountId),

    #[error("store state poisoned by a panicked writer")]
    Poisoned,

    #[error("injected fault at {0:?}")]
    Injected(FaultPoint),
}

/// Read-only lookups plus the entry point to atomic units.
///
/// Lookups return `Ok(None)` for absent rows; only store failures are errors.
pub trait Store: Send + Sync {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageFault>;

    fn account(&self, id: AccountId) -> Result<Option<Account>, StorageFault>;

    fn account_by_owner(&self, owner: UserId) -> Result<Option<Account>, StorageFault>;

    fn account_by_owner_email(&self, email: &str) -> Result<Option<Account>, StorageFault>;

    fn user(&self, id: UserId) -> Result<Option<User>, StorageFault>;

    fn user_by_email(&self, email: &str) -> Result<Option<User>, StorageFault>;

    /// Transfers involving `account`, newest first, starting strictly after
    /// `before` (or at the newest record when `before` is `None`).
    fn history_page(
        &self,
        account: AccountId,
        before: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage, StorageFault>;
}

/// One atomic unit of store mutations.
pub trait UnitOfWork {
    /// Takes an exclusive lock on the account row and returns its balance as
    /// seen by this unit. Returns `Ok(None)` if the account does not exist.
    fn lock_for_update(&mut self, id: AccountId) -> Result<Option<Money>, StorageFault>;

    /// Adjusts a balance by a signed amount, locking the row if needed.
    ///
    /// Fails with [`StorageFault::ConstraintViolation`] if the balance would
    /// go negative.
    fn apply_delta(&mut self, id: AccountId, delta: Money) -> Result<(), StorageFault>;

    /// Stages a user row. Fails with [`StorageFault::DuplicateEmail`] if the
    /// email is taken, here or again at commit.
    fn create_user(&mut self, user: User) -> Result<(), StorageFault>;

    /// Creates an account with a zero balance for an existing (or staged) user.
    fn create_account(&mut self, owner: UserId) -> Result<Account, StorageFault>;

    /// Appends a ledger record in this unit.
    fn append_transfer(&mut self, record: TransferRecord) -> Result<(), StorageFault>;

    fn find_transfer_by_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransferRecord>, StorageFault>;

    /// Makes all staged writes visible together and releases the locks.
    fn commit(self: Box<Self>) -> Result<(), StorageFault>;
}
