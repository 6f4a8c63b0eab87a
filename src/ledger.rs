//! Transfer ledger: immutable records of completed transfers and the lazy
//! history reader over them.

use crate::currency::Currency;
use crate::error::Result;
use crate::ids::{AccountId, TransferId};
use crate::money::Money;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// A caller-supplied token that deduplicates transfer retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        IdempotencyKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One completed transfer. Never mutated or deleted after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub id: TransferId,

    #[serde(rename = "from_account_id")]
    pub from: AccountId,

    #[serde(rename = "to_account_id")]
    pub to: AccountId,

    /// Amount moved, in the base currency. Always positive.
    pub amount: Money,

    /// Amount the caller asked for, in `currency`.
    pub requested_amount: Money,

    /// The currency the caller asked for, before conversion.
    pub currency: Currency,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl TransferRecord {
    pub fn new(
        from: AccountId,
        to: AccountId,
        amount: Money,
        requested_amount: Money,
        currency: Currency,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Self {
        TransferRecord {
            id: TransferId::generate(),
            from,
            to,
            amount,
            requested_amount,
            currency,
            created_at: Utc::now(),
            idempotency_key,
        }
    }

    /// Returns `true` if `account` is the source or the destination.
    pub fn involves(&self, account: AccountId) -> bool {
        self.from == account || self.to == account
    }
}

/// Opaque position in an account's history, as handed out by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HistoryCursor(pub(crate) u64);

/// One page of an account's history, newest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub records: Vec<TransferRecord>,

    /// Where the next (older) page starts. `None` once the history is exhausted.
    pub next: Option<HistoryCursor>,
}

/// Lazy, restartable iterator over an account's transfers, newest first.
///
/// Records are fetched from the store a page at a time. A storage fault is
/// yielded once as an `Err`, after which the iterator ends.
pub struct History<'a, S: Store + ?Sized> {
    store: &'a S,
    account: AccountId,
    page_size: usize,
    buffer: VecDeque<TransferRecord>,
    cursor: Option<HistoryCursor>,
    exhausted: bool,
}

impl<'a, S: Store + ?Sized> History<'a, S> {
    pub(crate) fn new(store: &'a S, account: AccountId, page_size: usize) -> Self {
        History {
            store,
            account,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    /// A fresh iterator positioned at the newest record.
    pub fn restart(&self) -> Self {
        History::new(self.store, self.account, self.page_size)
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = self
            .store
            .history_page(self.account, self.cursor, self.page_size)?;
        self.buffer.extend(page.records);
        self.cursor = page.next;
        self.exhausted = page.next.is_none();
        Ok(())
    }
}

impl<'a, S: Store + ?Sized> Iterator for History<'a, S> {
    type Item = Result<TransferRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.buffer.pop_front() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }
        if let Err(e) = self.fetch_page() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_involves_both_sides() {
        let from = AccountId::generate();
        let to = AccountId::generate();
        let record = TransferRecord::new(
            from,
            to,
            Money::units(5),
            Money::units(5),
            "RUB".parse().unwrap(),
            None,
        );

        assert!(record.involves(from));
        assert!(record.involves(to));
        assert!(!record.involves(AccountId::generate()));
    }
}
