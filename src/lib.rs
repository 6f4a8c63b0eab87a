//! # Ledger Service
//!
//! A multi-currency account ledger: users hold one account in the base
//! currency, deposit into it, and transfer funds to each other by account id
//! or by recipient email. Transfers in a foreign currency are converted into
//! the base currency before any balance moves.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: Uses 2 decimal places via `rust_decimal`
//! - **All-or-nothing transfers**: debit, credit and the ledger record commit
//!   together or not at all
//! - **Deadlock-free locking**: row locks are always taken in ascending
//!   account id order
//! - **Conservation**: transfers never change the sum of all balances
//!
//! ## Example
//!
//! ```no_run
//! use ledger_service::{
//!     ExchangeRateResolver, LedgerEngine, MemoryStore, Money, RateTable, TtlRateCache,
//! };
//!
//! let engine = LedgerEngine::new(
//!     MemoryStore::new(),
//!     ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default()),
//! );
//! let alice = engine.register("alice@example.com", "Alice").unwrap();
//! let bob = engine.register("bob@example.com", "Bob").unwrap();
//! engine.deposit(alice.account.id, Money::units(100)).unwrap();
//! engine
//!     .transfer(alice.account.id, bob.account.id, Money::units(50), &engine.base_currency())
//!     .unwrap();
//! ```

pub mod account;
pub mod batch;
pub mod command;
pub mod config;
pub mod currency;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ids;
pub mod ledger;
pub mod money;
pub mod rates;
pub mod store;

pub use account::Account;
pub use batch::{BatchRunner, BatchSummary};
pub use command::{Command, CommandRecord};
pub use config::{ConfigError, LedgerConfig};
pub use currency::Currency;
pub use engine::{
    LedgerEngine, Registration, TransferReceipt, TransferRequest, TransferStage,
    DEFAULT_HISTORY_PAGE_SIZE,
};
pub use error::{ErrorKind, LedgerError, Result};
pub use identity::{Principal, User};
pub use ids::{AccountId, TransferId, UserId};
pub use ledger::{History, IdempotencyKey, TransferRecord};
pub use money::Money;
pub use rates::{CacheFault, ExchangeRateResolver, RateCache, RateTable, TtlRateCache};
pub use store::{FaultPoint, MemoryStore, StorageFault, Store, UnitOfWork};
