//! Concurrent transfers against a shared engine.

use ledger_service::{
    AccountId, Currency, ExchangeRateResolver, LedgerEngine, LedgerError, MemoryStore, Money,
    RateTable, Store, TtlRateCache,
};
use proptest::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn engine() -> LedgerEngine<MemoryStore> {
    LedgerEngine::new(
        MemoryStore::with_lock_timeout(Duration::from_secs(10)),
        ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default()),
    )
}

fn rub() -> Currency {
    "RUB".parse().unwrap()
}

/// Opens `count` accounts, each holding `funds`.
fn open_accounts(engine: &LedgerEngine<MemoryStore>, count: usize, funds: i64) -> Vec<AccountId> {
    (0..count)
        .map(|n| {
            let registration = engine
                .register(&format!("user{}@example.com", n), "User")
                .unwrap();
            if funds > 0 {
                engine.deposit(registration.account.id, Money::units(funds)).unwrap();
            }
            registration.account.id
        })
        .collect()
}

fn balance(engine: &LedgerEngine<MemoryStore>, account: AccountId) -> Money {
    engine.store().account(account).unwrap().unwrap().balance
}

#[test]
fn test_opposite_transfers_do_not_deadlock() {
    let engine = Arc::new(engine());
    let accounts = open_accounts(&engine, 2, 100);
    let (a, b) = (accounts[0], accounts[1]);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [(a, b), (b, a)]
        .into_iter()
        .map(|(from, to)| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.transfer(from, to, Money::units(30), &rub())
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(balance(&engine, a), Money::units(100));
    assert_eq!(balance(&engine, b), Money::units(100));
    assert_eq!(engine.store().transfer_count().unwrap(), 2);
}

#[test]
fn test_racing_overdrafts_allow_exactly_one() {
    let engine = Arc::new(engine());
    let accounts = open_accounts(&engine, 3, 0);
    let source = accounts[0];
    engine.deposit(source, Money::units(100)).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [accounts[1], accounts[2]]
        .into_iter()
        .map(|to| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.transfer(source, to, Money::units(80), &rub())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(insufficient, 1);
    assert_eq!(balance(&engine, source), Money::units(20));
    assert_eq!(engine.store().total_balance().unwrap(), Money::units(100));
}

#[test]
fn test_many_concurrent_transfers_conserve_total() {
    const ACCOUNTS: usize = 5;
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let engine = Arc::new(engine());
    let accounts = Arc::new(open_accounts(&engine, ACCOUNTS, 100));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let accounts = Arc::clone(&accounts);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut committed = 0;
                for round in 0..ROUNDS {
                    let from = accounts[(t + round) % ACCOUNTS];
                    let to = accounts[(t + round * 3 + 1) % ACCOUNTS];
                    let amount = Money::units(((t * 7 + round) % 40 + 1) as i64);
                    match engine.transfer(from, to, amount, &rub()) {
                        Ok(_) => committed += 1,
                        Err(LedgerError::InsufficientFunds { .. })
                        | Err(LedgerError::SameAccount(_)) => {}
                        Err(e) => panic!("unexpected failure: {}", e),
                    }
                }
                committed
            })
        })
        .collect();

    let committed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(
        engine.store().total_balance().unwrap(),
        Money::units(100 * ACCOUNTS as i64)
    );
    assert_eq!(engine.store().transfer_count().unwrap(), committed);
    for account in accounts.iter() {
        assert!(!balance(&engine, *account).is_negative());
    }
}

#[test]
fn test_concurrent_registrations_of_one_email() {
    const THREADS: usize = 8;

    let engine = Arc::new(engine());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.register("shared@example.com", &format!("User {}", n))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(
            matches!(result, Err(LedgerError::EmailTaken(email)) if email == "shared@example.com"),
            "{:?}",
            result
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_transfers_conserve_total_and_stay_non_negative(
        deposits in prop::collection::vec(0i64..500, 3),
        transfers in prop::collection::vec((0usize..3, 0usize..3, 1i64..300), 0..30),
    ) {
        let engine = engine();
        let accounts = open_accounts(&engine, 3, 0);
        for (account, amount) in accounts.iter().zip(&deposits) {
            if *amount > 0 {
                engine.deposit(*account, Money::units(*amount)).unwrap();
            }
        }
        let total: i64 = deposits.iter().sum();

        let mut committed = 0;
        for (from, to, amount) in transfers {
            if engine
                .transfer(accounts[from], accounts[to], Money::units(amount), &rub())
                .is_ok()
            {
                committed += 1;
            }
        }

        prop_assert_eq!(engine.store().total_balance().unwrap(), Money::units(total));
        prop_assert_eq!(engine.store().transfer_count().unwrap(), committed);
        for account in &accounts {
            prop_assert!(!balance(&engine, *account).is_negative());
        }
    }
}
