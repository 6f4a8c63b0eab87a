//! In-process transactional store.
//!
//! Committed state lives in [`Tables`] behind one mutex. Row locks live in a
//! separate lock table with a condition variable that is notified whenever a
//! unit releases its locks. Units stage their writes privately and publish
//! them in a single critical section at commit, so readers observe either all
//! of a unit's writes or none of them.

use super::{StorageFault, Store, UnitOfWork};
use crate::account::Account;
use crate::identity::User;
use crate::ids::{AccountId, UserId};
use crate::ledger::{HistoryCursor, HistoryPage, IdempotencyKey, TransferRecord};
use crate::money::Money;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Operations at which a one-shot fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    LockForUpdate,
    ApplyDelta,
    AppendTransfer,
    Commit,
}

type UnitId = u64;

/// Committed rows, mirroring the `users`, `accounts` and `transfers` relations.
#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    emails: HashMap<String, UserId>,
    accounts: HashMap<AccountId, Account>,
    owners: HashMap<UserId, AccountId>,
    /// Append-only, in commit order.
    transfers: Vec<TransferRecord>,
    keys: HashMap<IdempotencyKey, usize>,
}

/// Thread-safe store with row-level locking and read-committed isolation.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, UnitId>>,
    released: Condvar,
    lock_timeout: Duration,
    next_unit: AtomicU64,
    faults: Mutex<Vec<FaultPoint>>,
}

impl MemoryStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a store whose row-lock waits give up after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        MemoryStore {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            lock_timeout,
            next_unit: AtomicU64::new(1),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Arms a fault that fires the next time any unit reaches `point`.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point);
    }

    /// Sum of all committed balances.
    pub fn total_balance(&self) -> Result<Money, StorageFault> {
        Ok(self.tables()?.accounts.values().map(|a| a.balance).sum())
    }

    /// Number of committed ledger records.
    pub fn transfer_count(&self) -> Result<usize, StorageFault> {
        Ok(self.tables()?.transfers.len())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageFault> {
        self.tables.lock().map_err(|_| StorageFault::Poisoned)
    }

    fn trip(&self, point: FaultPoint) -> Result<(), StorageFault> {
        let mut faults = self.faults.lock().map_err(|_| StorageFault::Poisoned)?;
        if let Some(pos) = faults.iter().position(|p| *p == point) {
            faults.remove(pos);
            debug!("Injected fault fired at {:?}", point);
            return Err(StorageFault::Injected(point));
        }
        Ok(())
    }

    /// Blocks until `unit` holds the row lock on `id`, or the timeout expires.
    fn acquire(&self, unit: UnitId, id: AccountId) -> Result<(), StorageFault> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut locks = self.row_locks.lock().map_err(|_| StorageFault::Poisoned)?;

        loop {
            match locks.get(&id).copied() {
                None => {
                    locks.insert(id, unit);
                    trace!("Unit {} locked account {}", unit, id);
                    return Ok(());
                }
                Some(holder) if holder == unit => return Ok(()),
                Some(holder) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(
                            "Unit {} timed out waiting for account {} held by unit {}",
                            unit, id, holder
                        );
                        return Err(StorageFault::LockTimeout(id));
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(locks, deadline - now)
                        .map_err(|_| StorageFault::Poisoned)?;
                    locks = guard;
                }
            }
        }
    }

    fn release(&self, unit: UnitId, ids: &[AccountId]) {
        if ids.is_empty() {
            return;
        }
        let mut locks = self
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if locks.get(id) == Some(&unit) {
                locks.remove(id);
            }
        }
        drop(locks);
        self.released.notify_all();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StorageFault> {
        let id = self.next_unit.fetch_add(1, Ordering::Relaxed);
        trace!("Unit {} started", id);
        Ok(Box::new(MemoryUnit {
            store: self,
            id,
            held: Vec::new(),
            deltas: HashMap::new(),
            users: Vec::new(),
            accounts: Vec::new(),
            transfers: Vec::new(),
            committed: false,
        }))
    }

    fn account(&self, id: AccountId) -> Result<Option<Account>, StorageFault> {
        Ok(self.tables()?.accounts.get(&id).cloned())
    }

    fn account_by_owner(&self, owner: UserId) -> Result<Option<Account>, StorageFault> {
        let tables = self.tables()?;
        Ok(tables
            .owners
            .get(&owner)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    fn account_by_owner_email(&self, email: &str) -> Result<Option<Account>, StorageFault> {
        let tables = self.tables()?;
        Ok(tables
            .emails
            .get(email)
            .and_then(|user| tables.owners.get(user))
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    fn user(&self, id: UserId) -> Result<Option<User>, StorageFault> {
        Ok(self.tables()?.users.get(&id).cloned())
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>, StorageFault> {
        let tables = self.tables()?;
        Ok(tables
            .emails
            .get(email)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    fn history_page(
        &self,
        account: AccountId,
        before: Option<HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage, StorageFault> {
        let tables = self.tables()?;
        let end = before
            .map(|cursor| cursor.0 as usize)
            .unwrap_or(tables.transfers.len())
            .min(tables.transfers.len());

        let mut records = Vec::with_capacity(limit.min(end));
        let mut last = None;
        for index in (0..end).rev() {
            if records.len() == limit {
                break;
            }
            let record = &tables.transfers[index];
            if record.involves(account) {
                records.push(record.clone());
                last = Some(index);
            }
        }

        let next = match last {
            Some(index) if records.len() == limit && index > 0 => {
                Some(HistoryCursor(index as u64))
            }
            _ => None,
        };
        Ok(HistoryPage { records, next })
    }
}

fn balance_violation(id: AccountId, delta: Money) -> StorageFault {
    StorageFault::ConstraintViolation(format!(
        "balance of account {} cannot take a change of {}",
        id, delta
    ))
}

/// A unit of work over [`MemoryStore`]. Rolls back on drop unless committed.
struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    id: UnitId,
    held: Vec<AccountId>,
    deltas: HashMap<AccountId, Money>,
    users: Vec<User>,
    accounts: Vec<Account>,
    transfers: Vec<TransferRecord>,
    committed: bool,
}

impl MemoryUnit<'_> {
    fn lock(&mut self, id: AccountId) -> Result<(), StorageFault> {
        self.store.acquire(self.id, id)?;
        if !self.held.contains(&id) {
            self.held.push(id);
        }
        Ok(())
    }

    fn account_exists(&self, tables: &Tables, id: AccountId) -> bool {
        tables.accounts.contains_key(&id) || self.accounts.iter().any(|a| a.id == id)
    }

    /// The committed row, or the row this unit created.
    fn visible_row<'t>(&'t self, tables: &'t Tables, id: AccountId) -> Option<&'t Account> {
        tables
            .accounts
            .get(&id)
            .or_else(|| self.accounts.iter().find(|a| a.id == id))
    }

    fn staged_delta(&self, id: AccountId) -> Money {
        self.deltas.get(&id).copied().unwrap_or(Money::ZERO)
    }

    /// Balance as seen by this unit: committed value plus staged delta.
    fn visible_balance(&self, tables: &Tables, id: AccountId) -> Option<Money> {
        self.visible_row(tables, id)?
            .balance
            .checked_add(self.staged_delta(id))
    }

    fn has_writes(&self) -> bool {
        !(self.deltas.is_empty()
            && self.users.is_empty()
            && self.accounts.is_empty()
            && self.transfers.is_empty())
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn lock_for_update(&mut self, id: AccountId) -> Result<Option<Money>, StorageFault> {
        self.store.trip(FaultPoint::LockForUpdate)?;

        let exists = {
            let tables = self.store.tables()?;
            self.account_exists(&tables, id)
        };
        if !exists {
            return Ok(None);
        }
        self.lock(id)?;

        let tables = self.store.tables()?;
        Ok(self.visible_balance(&tables, id))
    }

    fn apply_delta(&mut self, id: AccountId, delta: Money) -> Result<(), StorageFault> {
        self.store.trip(FaultPoint::ApplyDelta)?;
        self.lock(id)?;

        let tables = self.store.tables()?;
        let row = self
            .visible_row(&tables, id)
            .ok_or(StorageFault::MissingRow(id))?;
        let staged = self
            .staged_delta(id)
            .checked_add(delta)
            .filter(|staged| row.preview(*staged).is_some())
            .ok_or_else(|| balance_violation(id, delta))?;
        drop(tables);

        self.deltas.insert(id, staged);
        Ok(())
    }

    fn create_user(&mut self, user: User) -> Result<(), StorageFault> {
        let tables = self.store.tables()?;
        let taken = tables.emails.contains_key(&user.email)
            || self.users.iter().any(|u| u.email == user.email);
        if taken {
            return Err(StorageFault::DuplicateEmail(user.email));
        }
        drop(tables);

        self.users.push(user);
        Ok(())
    }

    fn create_account(&mut self, owner: UserId) -> Result<Account, StorageFault> {
        let tables = self.store.tables()?;
        let owner_exists =
            tables.users.contains_key(&owner) || self.users.iter().any(|u| u.id == owner);
        if !owner_exists {
            return Err(StorageFault::ConstraintViolation(format!(
                "account owner {} does not exist",
                owner
            )));
        }
        let has_account =
            tables.owners.contains_key(&owner) || self.accounts.iter().any(|a| a.owner == owner);
        if has_account {
            return Err(StorageFault::ConstraintViolation(format!(
                "user {} already owns an account",
                owner
            )));
        }
        drop(tables);

        let account = Account::open(owner);
        self.accounts.push(account.clone());
        Ok(account)
    }

    fn append_transfer(&mut self, record: TransferRecord) -> Result<(), StorageFault> {
        self.store.trip(FaultPoint::AppendTransfer)?;

        let tables = self.store.tables()?;
        for id in [record.from, record.to] {
            if !self.account_exists(&tables, id) {
                return Err(StorageFault::ConstraintViolation(format!(
                    "transfer references unknown account {}",
                    id
                )));
            }
        }
        if let Some(key) = &record.idempotency_key {
            let duplicate = tables.keys.contains_key(key)
                || self
                    .transfers
                    .iter()
                    .any(|t| t.idempotency_key.as_ref() == Some(key));
            if duplicate {
                return Err(StorageFault::ConstraintViolation(format!(
                    "duplicate idempotency key {}",
                    key.as_str()
                )));
            }
        }
        drop(tables);

        self.transfers.push(record);
        Ok(())
    }

    fn find_transfer_by_key(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransferRecord>, StorageFault> {
        let tables = self.store.tables()?;
        let committed = tables
            .keys
            .get(key)
            .and_then(|&index| tables.transfers.get(index))
            .cloned();
        Ok(committed.or_else(|| {
            self.transfers
                .iter()
                .find(|t| t.idempotency_key.as_ref() == Some(key))
                .cloned()
        }))
    }

    fn commit(self: Box<Self>) -> Result<(), StorageFault> {
        let mut unit = self;
        let store = unit.store;
        store.trip(FaultPoint::Commit)?;

        let mut tables = store.tables()?;

        // Re-check every constraint before publishing anything.
        for user in &unit.users {
            if tables.emails.contains_key(&user.email) {
                return Err(StorageFault::DuplicateEmail(user.email.clone()));
            }
        }
        for account in &unit.accounts {
            if tables.owners.contains_key(&account.owner) {
                return Err(StorageFault::ConstraintViolation(format!(
                    "user {} already owns an account",
                    account.owner
                )));
            }
        }
        for record in &unit.transfers {
            if let Some(key) = &record.idempotency_key {
                if tables.keys.contains_key(key) {
                    return Err(StorageFault::ConstraintViolation(format!(
                        "duplicate idempotency key {}",
                        key.as_str()
                    )));
                }
            }
        }
        let mut updated = Vec::with_capacity(unit.deltas.len());
        for (&id, &delta) in &unit.deltas {
            let mut row = unit
                .visible_row(&tables, id)
                .ok_or(StorageFault::MissingRow(id))?
                .clone();
            if !row.apply(delta) {
                return Err(balance_violation(id, delta));
            }
            trace!("Unit {} sets account {} to {} ({})", unit.id, id, row.balance, delta);
            updated.push(row);
        }

        for user in std::mem::take(&mut unit.users) {
            tables.emails.insert(user.email.clone(), user.id);
            tables.users.insert(user.id, user);
        }
        for account in std::mem::take(&mut unit.accounts) {
            tables.owners.insert(account.owner, account.id);
            tables.accounts.insert(account.id, account);
        }
        for row in updated {
            tables.accounts.insert(row.id, row);
        }
        for record in std::mem::take(&mut unit.transfers) {
            if let Some(key) = &record.idempotency_key {
                let index = tables.transfers.len();
                tables.keys.insert(key.clone(), index);
            }
            tables.transfers.push(record);
        }
        drop(tables);

        unit.deltas.clear();
        unit.committed = true;
        debug!("Unit {} committed", unit.id);
        Ok(())
    }
}

impl Drop for MemoryUnit<'_> {
    fn drop(&mut self) {
        if !self.committed && self.has_writes() {
            debug!("Unit {} rolled back", self.id);
        }
        self.store.release(self.id, &self.held);
    }
}
