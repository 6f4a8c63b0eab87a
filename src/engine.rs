//! Core ledger engine.
//!
//! Every balance mutation runs inside one store unit of work. The engine
//! itself holds no locks; isolation between concurrent transfers comes
//! entirely from the store's row locks, which the engine always takes in
//! ascending [`AccountId`] order so that opposite-direction transfers cannot
//! deadlock.

use crate::account::Account;
use crate::currency::Currency;
use crate::error::{LedgerError, Result};
use crate::identity::{normalize_email, Principal, User};
use crate::ids::AccountId;
use crate::ledger::{History, IdempotencyKey, TransferRecord};
use crate::money::Money;
use crate::rates::{ExchangeRateResolver, RateCache, TtlRateCache};
use crate::store::{StorageFault, Store};
use log::{debug, warn};
use std::fmt;

/// Default number of records fetched per history page.
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;

/// Progress of a single transfer.
///
/// `Started → FundsChecked → Debited → Credited → Recorded → Committed`,
/// with `Aborted` reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Started,
    FundsChecked,
    Debited,
    Credited,
    Recorded,
    Committed,
    Aborted,
}

impl TransferStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStage::Committed | TransferStage::Aborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: TransferStage) -> bool {
        use TransferStage::*;
        match (self, next) {
            (Committed, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Started, FundsChecked)
            | (FundsChecked, Debited)
            | (Debited, Credited)
            | (Credited, Recorded)
            | (Recorded, Committed) => true,
            _ => false,
        }
    }

    fn advance(&mut self, next: TransferStage) {
        debug_assert!(
            self.can_advance_to(next),
            "illegal transfer stage transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Started => "started",
            TransferStage::FundsChecked => "funds_checked",
            TransferStage::Debited => "debited",
            TransferStage::Credited => "credited",
            TransferStage::Recorded => "recorded",
            TransferStage::Committed => "committed",
            TransferStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A request to move funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,

    /// Amount in `currency`, before conversion.
    pub amount: Money,

    pub currency: Currency,

    /// Deduplicates retries when present. Without one, every call transfers.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Money, currency: Currency) -> Self {
        TransferRequest {
            from,
            to,
            amount,
            currency,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub record: TransferRecord,

    /// `true` when an earlier transfer with the same idempotency key was
    /// returned instead of moving funds again.
    pub replayed: bool,
}

/// A freshly registered user and their empty account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user: User,
    pub account: Account,
}

/// The balance-mutation core.
///
/// `LedgerEngine` is `Sync`; share it by reference (or `Arc`) across the
/// threads serving requests.
pub struct LedgerEngine<S: Store, C: RateCache = TtlRateCache> {
    store: S,
    rates: ExchangeRateResolver<C>,
    history_page_size: usize,
}

impl<S: Store, C: RateCache> LedgerEngine<S, C> {
    pub fn new(store: S, rates: ExchangeRateResolver<C>) -> Self {
        LedgerEngine {
            store,
            rates,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }

    pub fn with_history_page_size(mut self, page_size: usize) -> Self {
        self.history_page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn rates(&self) -> &ExchangeRateResolver<C> {
        &self.rates
    }

    pub fn base_currency(&self) -> Currency {
        self.rates.base_currency()
    }

    /// Creates a user and their zero-balance account in one unit.
    ///
    /// A concurrent registration of the same email that commits first makes
    /// this one fail with `EmailTaken` as well.
    pub fn register(&self, email: &str, full_name: &str) -> Result<Registration> {
        let email = normalize_email(email)?;
        if self.store.user_by_email(&email)?.is_some() {
            return Err(LedgerError::EmailTaken(email));
        }

        let user = User::new(email, full_name.trim().to_string());
        let account = self.insert_user(&user).map_err(|e| match e {
            LedgerError::Storage(StorageFault::DuplicateEmail(email)) => {
                LedgerError::EmailTaken(email)
            }
            other => other,
        })?;

        debug!("Registered {} with account {}", user.email, account.id);
        Ok(Registration { user, account })
    }

    fn insert_user(&self, user: &User) -> Result<Account> {
        let mut unit = self.store.begin()?;
        unit.create_user(user.clone())?;
        let account = unit.create_account(user.id)?;
        unit.commit()?;
        Ok(account)
    }

    /// Credits `amount` to an account. Returns the new balance.
    ///
    /// Deposits are not written to the transfer ledger.
    pub fn deposit(&self, account: AccountId, amount: Money) -> Result<Money> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut unit = self.store.begin()?;
        let balance = unit
            .lock_for_update(account)?
            .ok_or(LedgerError::AccountNotFound(account))?;
        unit.apply_delta(account, amount)?;
        unit.commit()?;

        let updated = balance + amount;
        debug!("Deposited {} to account {}, balance {}", amount, account, updated);
        Ok(updated)
    }

    /// Moves `amount` of `currency` from one account to another.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        currency: &Currency,
    ) -> Result<TransferReceipt> {
        self.transfer_request(TransferRequest::new(from, to, amount, currency.clone()))
    }

    /// Executes a transfer as one atomic unit.
    ///
    /// Validation and currency conversion happen before the unit opens. Inside
    /// the unit both rows are locked in ascending id order, the source balance
    /// is checked, the debit, credit and ledger append are staged, and the
    /// unit commits. Any failure drops the unit, which undoes every staged
    /// write.
    pub fn transfer_request(&self, request: TransferRequest) -> Result<TransferReceipt> {
        if !request.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(request.amount));
        }
        if request.from == request.to {
            return Err(LedgerError::SameAccount(request.from));
        }

        let base_amount = self.rates.to_base(request.amount, &request.currency)?;
        if !base_amount.is_positive() {
            return Err(LedgerError::InvalidAmount(base_amount));
        }

        let mut stage = TransferStage::Started;
        let result = self.run_transfer(&request, base_amount, &mut stage);
        match &result {
            Ok(receipt) if receipt.replayed => debug!(
                "Transfer {} replayed for key {:?}",
                receipt.record.id, request.idempotency_key
            ),
            Ok(receipt) => debug!(
                "Transfer {} committed: {} -> {}, {} ({} {})",
                receipt.record.id,
                request.from,
                request.to,
                base_amount,
                request.amount,
                request.currency
            ),
            Err(e) => {
                let failed_at = stage;
                stage.advance(TransferStage::Aborted);
                warn!(
                    "Transfer {} -> {} of {} {} aborted after {}: {}",
                    request.from, request.to, request.amount, request.currency, failed_at, e
                );
            }
        }
        result
    }

    fn run_transfer(
        &self,
        request: &TransferRequest,
        amount: Money,
        stage: &mut TransferStage,
    ) -> Result<TransferReceipt> {
        let mut unit = self.store.begin()?;

        let (first, second) = if request.from < request.to {
            (request.from, request.to)
        } else {
            (request.to, request.from)
        };
        let first_balance = unit
            .lock_for_update(first)?
            .ok_or(LedgerError::AccountNotFound(first))?;
        let second_balance = unit
            .lock_for_update(second)?
            .ok_or(LedgerError::AccountNotFound(second))?;
        let available = if first == request.from {
            first_balance
        } else {
            second_balance
        };

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = unit.find_transfer_by_key(key)? {
                return replay(request, key, existing);
            }
        }

        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: request.from,
                available,
                requested: amount,
            });
        }
        stage.advance(TransferStage::FundsChecked);

        unit.apply_delta(request.from, -amount)?;
        stage.advance(TransferStage::Debited);

        unit.apply_delta(request.to, amount)?;
        stage.advance(TransferStage::Credited);

        let record = TransferRecord::new(
            request.from,
            request.to,
            amount,
            request.amount,
            request.currency.clone(),
            request.idempotency_key.clone(),
        );
        unit.append_transfer(record.clone())?;
        stage.advance(TransferStage::Recorded);

        unit.commit()?;
        stage.advance(TransferStage::Committed);

        Ok(TransferReceipt {
            record,
            replayed: false,
        })
    }

    /// Transfers from the principal's account to the account registered
    /// under `to_email`.
    pub fn transfer_by_email(
        &self,
        principal: &Principal,
        to_email: &str,
        amount: Money,
        currency: &Currency,
    ) -> Result<TransferReceipt> {
        let from = self.account_of(principal)?;
        let email = normalize_email(to_email)?;
        let to = self
            .store
            .account_by_owner_email(&email)?
            .ok_or(LedgerError::RecipientNotFound(email))?;

        self.transfer(from.id, to.id, amount, currency)
    }

    /// Transfers involving `account`, newest first.
    pub fn history(&self, account: AccountId) -> Result<History<'_, S>> {
        if self.store.account(account)?.is_none() {
            return Err(LedgerError::AccountNotFound(account));
        }
        Ok(History::new(&self.store, account, self.history_page_size))
    }

    /// The principal's account, including its current balance.
    pub fn account_of(&self, principal: &Principal) -> Result<Account> {
        self.store
            .account_by_owner(principal.user_id)?
            .ok_or(LedgerError::SenderAccountNotFound(principal.user_id))
    }

    pub fn deposit_for(&self, principal: &Principal, amount: Money) -> Result<Money> {
        let account = self.account_of(principal)?;
        self.deposit(account.id, amount)
    }

    pub fn history_for(&self, principal: &Principal) -> Result<History<'_, S>> {
        let account = self.account_of(principal)?;
        self.history(account.id)
    }
}

fn replay(
    request: &TransferRequest,
    key: &IdempotencyKey,
    existing: TransferRecord,
) -> Result<TransferReceipt> {
    let same = existing.from == request.from
        && existing.to == request.to
        && existing.requested_amount == request.amount
        && existing.currency == request.currency;
    if !same {
        return Err(LedgerError::IdempotencyConflict(key.as_str().to_string()));
    }
    Ok(TransferReceipt {
        record: existing,
        replayed: true,
    })
}
