//! Exchange rate resolution into the base currency.
//!
//! Rates come from a configured [`RateTable`] and are fronted by a
//! short-lived [`RateCache`]. The cache is an optimization only: any cache
//! fault is logged and the table is consulted instead.

use crate::config::ConfigError;
use crate::currency::Currency;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use cached::{Cached, TimedCache};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Failure of the rate cache backend. Never surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheFault {
    #[error("rate cache unavailable: {0}")]
    Unavailable(String),
}

/// A keyed cache of base-currency multipliers.
pub trait RateCache: Send + Sync {
    fn get(&self, currency: &Currency) -> std::result::Result<Option<Decimal>, CacheFault>;

    fn put(&self, currency: &Currency, rate: Decimal) -> std::result::Result<(), CacheFault>;

    fn invalidate(&self) -> std::result::Result<(), CacheFault>;
}

/// In-process cache whose entries expire a fixed time after insertion.
pub struct TtlRateCache {
    entries: Mutex<TimedCache<Currency, Decimal>>,
}

impl TtlRateCache {
    /// Default lifetime of a cached rate.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Creates a cache whose entries live for `ttl`, rounded up to whole
    /// seconds and never less than one.
    pub fn new(ttl: Duration) -> Self {
        let seconds = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        TtlRateCache {
            entries: Mutex::new(TimedCache::with_lifespan(seconds.max(1))),
        }
    }

    fn entries(
        &self,
    ) -> std::result::Result<std::sync::MutexGuard<'_, TimedCache<Currency, Decimal>>, CacheFault>
    {
        self.entries
            .lock()
            .map_err(|_| CacheFault::Unavailable("cache lock poisoned".to_string()))
    }
}

impl Default for TtlRateCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

impl RateCache for TtlRateCache {
    fn get(&self, currency: &Currency) -> std::result::Result<Option<Decimal>, CacheFault> {
        Ok(self.entries()?.cache_get(currency).copied())
    }

    fn put(&self, currency: &Currency, rate: Decimal) -> std::result::Result<(), CacheFault> {
        self.entries()?.cache_set(currency.clone(), rate);
        Ok(())
    }

    fn invalidate(&self) -> std::result::Result<(), CacheFault> {
        self.entries()?.cache_clear();
        Ok(())
    }
}

/// Row of a rate file: `currency,rate`.
#[derive(Debug, Deserialize)]
struct RateRecord {
    currency: String,
    rate: String,
}

/// Fixed multipliers from supported currencies into the base currency.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    base: Currency,
    rates: HashMap<Currency, Decimal>,
}

impl RateTable {
    /// An empty table; only the base currency itself is supported.
    pub fn new(base: Currency) -> Self {
        RateTable {
            base,
            rates: HashMap::new(),
        }
    }

    /// The built-in table: RUB base, 1 USD = 90 RUB, 1 EUR = 100 RUB.
    pub fn standard() -> Self {
        let mut rates = HashMap::new();
        rates.insert(Currency::known("USD"), Decimal::from(90));
        rates.insert(Currency::known("EUR"), Decimal::from(100));
        RateTable {
            base: Currency::known("RUB"),
            rates,
        }
    }

    /// Same rates as [`RateTable::standard`] unless `base` differs, in which
    /// case the table starts empty.
    pub fn standard_for(base: Currency) -> Self {
        let standard = Self::standard();
        if standard.base == base {
            standard
        } else {
            Self::new(base)
        }
    }

    /// Loads a table from CSV with a `currency,rate` header.
    pub fn from_csv<R: Read>(base: Currency, reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = RateTable::new(base);
        for (row_idx, result) in csv_reader.deserialize::<RateRecord>().enumerate() {
            let row = row_idx + 2; // 1-indexed, accounting for header row
            let record = result?;

            let currency = Currency::from_str(&record.currency).map_err(|e| {
                ConfigError::InvalidRate {
                    row,
                    message: e.to_string(),
                }
            })?;
            let rate = Decimal::from_str(&record.rate).map_err(|e| ConfigError::InvalidRate {
                row,
                message: format!("rate {:?}: {}", record.rate, e),
            })?;
            table.insert(currency, rate).map_err(|e| match e {
                LedgerError::Config(ConfigError::InvalidRate { message, .. }) => {
                    ConfigError::InvalidRate { row, message }.into()
                }
                other => other,
            })?;
        }
        Ok(table)
    }

    /// Adds or replaces a rate. Rates must be positive and the base currency
    /// cannot be re-rated.
    pub fn insert(&mut self, currency: Currency, rate: Decimal) -> Result<()> {
        if currency == self.base {
            return Err(ConfigError::InvalidRate {
                row: 0,
                message: format!("base currency {} cannot carry a rate", currency),
            }
            .into());
        }
        if rate <= Decimal::ZERO {
            return Err(ConfigError::InvalidRate {
                row: 0,
                message: format!("rate for {} must be positive, got {}", currency, rate),
            }
            .into());
        }
        self.rates.insert(currency, rate);
        Ok(())
    }

    pub fn base(&self) -> &Currency {
        &self.base
    }

    /// The multiplier for `currency`; the base currency is always 1.
    pub fn get(&self, currency: &Currency) -> Option<Decimal> {
        if *currency == self.base {
            Some(Decimal::ONE)
        } else {
            self.rates.get(currency).copied()
        }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Converts foreign-currency amounts into the base currency.
///
/// The table can be swapped at runtime with [`ExchangeRateResolver::reload`].
/// Concurrent refreshes of the cache race harmlessly; the last writer wins.
pub struct ExchangeRateResolver<C: RateCache = TtlRateCache> {
    table: RwLock<Arc<RateTable>>,
    cache: C,
}

impl<C: RateCache> ExchangeRateResolver<C> {
    pub fn new(table: RateTable, cache: C) -> Self {
        ExchangeRateResolver {
            table: RwLock::new(Arc::new(table)),
            cache,
        }
    }

    /// Snapshot of the current table.
    pub fn table(&self) -> Arc<RateTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn base_currency(&self) -> Currency {
        self.table().base().clone()
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Multiplier converting 1 unit of `currency` into base-currency units.
    ///
    /// Consults the cache first, then the table, repopulating the cache on
    /// the way out. Fails with `UnsupportedCurrency` for codes not in the
    /// table.
    pub fn rate(&self, currency: &Currency) -> Result<Decimal> {
        // Held until the cache is repopulated, so a reload cannot slip in
        // between the table read and the cache write.
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        if currency == table.base() {
            return Ok(Decimal::ONE);
        }

        match self.cache.get(currency) {
            Ok(Some(rate)) => {
                debug!("Rate cache hit for {}: {}", currency, rate);
                return Ok(rate);
            }
            Ok(None) => debug!("Rate cache miss for {}", currency),
            Err(e) => warn!("Rate cache read failed for {}: {}", currency, e),
        }

        let rate = table
            .get(currency)
            .ok_or_else(|| LedgerError::UnsupportedCurrency(currency.to_string()))?;

        if let Err(e) = self.cache.put(currency, rate) {
            warn!("Rate cache write failed for {}: {}", currency, e);
        }
        Ok(rate)
    }

    /// Converts `amount` of `currency` into the base currency.
    pub fn to_base(&self, amount: Money, currency: &Currency) -> Result<Money> {
        let rate = self.rate(currency)?;
        amount
            .convert(rate)
            .ok_or(LedgerError::InvalidAmount(amount))
    }

    /// Replaces the rate table and drops every cached rate.
    ///
    /// The base currency is fixed for the lifetime of the resolver, since
    /// every balance is denominated in it. Lookups already in flight finish
    /// against the old table before the swap; none run after it against the
    /// old cache contents.
    pub fn reload(&self, table: RateTable) -> Result<()> {
        let mut current = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.base() != current.base() {
            return Err(ConfigError::InvalidValue {
                key: "LEDGER_BASE_CURRENCY".to_string(),
                message: format!(
                    "cannot change base currency from {} to {}",
                    current.base(),
                    table.base()
                ),
            }
            .into());
        }

        *current = Arc::new(table);
        if let Err(e) = self.cache.invalidate() {
            warn!("Rate cache invalidation failed: {}", e);
        }
        drop(current);
        debug!("Rate table reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn code(s: &str) -> Currency {
        s.parse().unwrap()
    }

    /// A cache whose backend is down.
    struct BrokenCache {
        reads: AtomicUsize,
    }

    impl RateCache for BrokenCache {
        fn get(&self, _: &Currency) -> std::result::Result<Option<Decimal>, CacheFault> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(CacheFault::Unavailable("connection refused".into()))
        }

        fn put(&self, _: &Currency, _: Decimal) -> std::result::Result<(), CacheFault> {
            Err(CacheFault::Unavailable("connection refused".into()))
        }

        fn invalidate(&self) -> std::result::Result<(), CacheFault> {
            Err(CacheFault::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_standard_rates() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        assert_eq!(resolver.rate(&code("USD")).unwrap(), Decimal::from(90));
        assert_eq!(resolver.rate(&code("EUR")).unwrap(), Decimal::from(100));
        assert_eq!(resolver.rate(&code("RUB")).unwrap(), Decimal::ONE);
    }

    #[test]
    fn test_unsupported_currency() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        assert!(matches!(
            resolver.rate(&code("GBP")),
            Err(LedgerError::UnsupportedCurrency(c)) if c == "GBP"
        ));
    }

    #[test]
    fn test_miss_populates_cache() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        assert_eq!(resolver.cache().get(&code("USD")).unwrap(), None);

        resolver.rate(&code("USD")).unwrap();
        assert_eq!(
            resolver.cache().get(&code("USD")).unwrap(),
            Some(Decimal::from(90))
        );
    }

    #[test]
    fn test_cache_hit_wins_over_table() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        resolver.cache().put(&code("USD"), Decimal::from(91)).unwrap();
        assert_eq!(resolver.rate(&code("USD")).unwrap(), Decimal::from(91));
    }

    #[test]
    fn test_cache_faults_fall_back_to_table() {
        let resolver = ExchangeRateResolver::new(
            RateTable::standard(),
            BrokenCache {
                reads: AtomicUsize::new(0),
            },
        );
        assert_eq!(resolver.rate(&code("EUR")).unwrap(), Decimal::from(100));
        assert_eq!(resolver.cache().reads.load(Ordering::SeqCst), 1);
        assert!(resolver.reload(RateTable::standard()).is_ok());
    }

    #[test]
    fn test_to_base_converts() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        let converted = resolver.to_base(Money::units(10), &code("USD")).unwrap();
        assert_eq!(converted, Money::units(900));
    }

    #[test]
    fn test_reload_replaces_rates_and_clears_cache() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        resolver.rate(&code("USD")).unwrap();

        let mut table = RateTable::new(code("RUB"));
        table.insert(code("USD"), Decimal::from(95)).unwrap();
        resolver.reload(table).unwrap();

        assert_eq!(resolver.rate(&code("USD")).unwrap(), Decimal::from(95));
        assert!(matches!(
            resolver.rate(&code("EUR")),
            Err(LedgerError::UnsupportedCurrency(_))
        ));
    }

    /// Wakes a reloading thread on the first miss, then behaves like a
    /// normal TTL cache.
    struct ReloadOnMiss {
        inner: TtlRateCache,
        wake: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl RateCache for ReloadOnMiss {
        fn get(&self, currency: &Currency) -> std::result::Result<Option<Decimal>, CacheFault> {
            if let Some(wake) = self.wake.lock().unwrap().take() {
                wake.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            }
            self.inner.get(currency)
        }

        fn put(&self, currency: &Currency, rate: Decimal) -> std::result::Result<(), CacheFault> {
            self.inner.put(currency, rate)
        }

        fn invalidate(&self) -> std::result::Result<(), CacheFault> {
            self.inner.invalidate()
        }
    }

    #[test]
    fn test_reload_during_lookup_does_not_leave_stale_rate() {
        let (wake, woken) = mpsc::channel();
        let resolver = Arc::new(ExchangeRateResolver::new(
            RateTable::standard(),
            ReloadOnMiss {
                inner: TtlRateCache::default(),
                wake: Mutex::new(Some(wake)),
            },
        ));

        let reloader = {
            let resolver = Arc::clone(&resolver);
            thread::spawn(move || {
                woken.recv().unwrap();
                let mut table = RateTable::new(code("RUB"));
                table.insert(code("USD"), Decimal::from(95)).unwrap();
                resolver.reload(table).unwrap();
            })
        };

        assert_eq!(resolver.rate(&code("USD")).unwrap(), Decimal::from(90));
        reloader.join().unwrap();

        assert_eq!(resolver.cache().get(&code("USD")).unwrap(), None);
        assert_eq!(resolver.rate(&code("USD")).unwrap(), Decimal::from(95));
    }

    #[test]
    fn test_sub_second_ttl_still_caches() {
        let cache = TtlRateCache::new(Duration::from_millis(200));
        cache.put(&code("USD"), Decimal::from(90)).unwrap();
        assert_eq!(cache.get(&code("USD")).unwrap(), Some(Decimal::from(90)));

        let cache = TtlRateCache::new(Duration::ZERO);
        cache.put(&code("EUR"), Decimal::from(100)).unwrap();
        assert_eq!(cache.get(&code("EUR")).unwrap(), Some(Decimal::from(100)));
    }

    #[test]
    fn test_reload_rejects_base_change() {
        let resolver = ExchangeRateResolver::new(RateTable::standard(), TtlRateCache::default());
        let err = resolver.reload(RateTable::new(code("USD"))).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_table_from_csv() {
        let csv = "currency, rate\nusd, 90.5\nEUR,100\n";
        let table = RateTable::from_csv(code("RUB"), Cursor::new(csv)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&code("USD")), Some(Decimal::from_str("90.5").unwrap()));
        assert_eq!(table.get(&code("RUB")), Some(Decimal::ONE));
    }

    #[test]
    fn test_table_from_csv_rejects_bad_rows() {
        let negative = "currency,rate\nUSD,-1\n";
        assert!(matches!(
            RateTable::from_csv(code("RUB"), Cursor::new(negative)),
            Err(LedgerError::Config(ConfigError::InvalidRate { row: 2, .. }))
        ));

        let base = "currency,rate\nUSD,90\nRUB,1\n";
        assert!(matches!(
            RateTable::from_csv(code("RUB"), Cursor::new(base)),
            Err(LedgerError::Config(ConfigError::InvalidRate { row: 3, .. }))
        ));

        let garbage = "currency,rate\nUSD,ninety\n";
        assert!(RateTable::from_csv(code("RUB"), Cursor::new(garbage)).is_err());
    }
}
