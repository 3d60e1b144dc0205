//! Rate Converter
//!
//! Currency conversion rates from an external provider, cached per
//! `(from, to)` pair. `from == to` never reaches the provider.

pub mod frankfurter;

pub use frankfurter::HttpRateProvider;

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::money::{Currency, round_money};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    /// Transport failure, bad status, unparseable body or missing pair
    #[error("Exchange rate service unavailable: {0}")]
    ExternalServiceUnavailable(String),
}

/// Provider payload: `{ "base": "USD", "rates": { "EUR": 0.92 } }`
#[derive(Debug, Clone, Deserialize)]
pub struct RateResponse {
    pub base: String,
    pub rates: HashMap<String, Decimal>,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_latest_rate(&self, from: Currency, to: Currency)
    -> Result<RateResponse, RateError>;
}

pub struct RateConverter {
    provider: Arc<dyn RateProvider>,
    cache: Mutex<TimedCache<(Currency, Currency), Decimal>>,
}

impl RateConverter {
    pub fn new(provider: Arc<dyn RateProvider>, ttl_secs: u64) -> Self {
        Self {
            provider,
            cache: Mutex::new(TimedCache::with_lifespan(ttl_secs)),
        }
    }

    /// Rate for one unit of `from` expressed in `to`
    pub async fn get_rate(&self, from: Currency, to: Currency) -> Result<Decimal, RateError> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        if let Some(rate) = self.cache.lock().await.cache_get(&(from, to)) {
            return Ok(*rate);
        }

        // Lock not held across the provider call; two misses may both fetch
        tracing::debug!(from = %from, to = %to, provider = self.provider.name(), "[rates] cache miss");
        let response = self.provider.get_latest_rate(from, to).await?;
        let rate = response.rates.get(to.as_str()).copied().ok_or_else(|| {
            RateError::ExternalServiceUnavailable(format!(
                "No {} rate in {} response",
                to, response.base
            ))
        })?;

        if rate <= Decimal::ZERO {
            return Err(RateError::ExternalServiceUnavailable(format!(
                "Non-positive rate {} for {}->{}",
                rate, from, to
            )));
        }

        self.cache.lock().await.cache_set((from, to), rate);
        Ok(rate)
    }

    /// `amount * rate`, two decimals, half-up
    pub fn convert(&self, amount: Decimal, rate: Decimal) -> Decimal {
        round_money(amount * rate)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fixed-rate provider with a call counter and a failure switch
    pub struct FixedRateProvider {
        rates: HashMap<(Currency, Currency), Decimal>,
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl FixedRateProvider {
        pub fn new() -> Self {
            Self {
                rates: HashMap::new(),
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        pub fn with_rate(mut self, from: Currency, to: Currency, rate: Decimal) -> Self {
            self.rates.insert((from, to), rate);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RateProvider for FixedRateProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn get_latest_rate(
            &self,
            from: Currency,
            to: Currency,
        ) -> Result<RateResponse, RateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RateError::ExternalServiceUnavailable(
                    "connection refused".to_string(),
                ));
            }

            let mut rates = HashMap::new();
            if let Some(rate) = self.rates.get(&(from, to)) {
                rates.insert(to.as_str().to_string(), *rate);
            }
            Ok(RateResponse {
                base: from.as_str().to_string(),
                rates,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::FixedRateProvider;
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_identity_rate_skips_provider() {
        let provider = Arc::new(FixedRateProvider::new());
        let converter = RateConverter::new(provider.clone(), 1800);

        let rate = converter.get_rate(Currency::Usd, Currency::Usd).await.unwrap();
        assert_eq!(rate, Decimal::ONE);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_is_cached_per_pair() {
        let provider = Arc::new(
            FixedRateProvider::new()
                .with_rate(Currency::Usd, Currency::Eur, dec("0.92"))
                .with_rate(Currency::Eur, Currency::Usd, dec("1.087")),
        );
        let converter = RateConverter::new(provider.clone(), 1800);

        assert_eq!(converter.get_rate(Currency::Usd, Currency::Eur).await.unwrap(), dec("0.92"));
        assert_eq!(converter.get_rate(Currency::Usd, Currency::Eur).await.unwrap(), dec("0.92"));
        assert_eq!(provider.call_count(), 1);

        assert_eq!(converter.get_rate(Currency::Eur, Currency::Usd).await.unwrap(), dec("1.087"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cached_rate_expires_after_lifespan() {
        let provider = Arc::new(
            FixedRateProvider::new().with_rate(Currency::Usd, Currency::Eur, dec("0.92")),
        );
        let converter = RateConverter::new(provider.clone(), 1);

        converter.get_rate(Currency::Usd, Currency::Eur).await.unwrap();
        converter.get_rate(Currency::Usd, Currency::Eur).await.unwrap();
        assert_eq!(provider.call_count(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        assert_eq!(converter.get_rate(Currency::Usd, Currency::Eur).await.unwrap(), dec("0.92"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_is_unavailable_and_not_cached() {
        let provider = Arc::new(
            FixedRateProvider::new().with_rate(Currency::Usd, Currency::Pln, dec("4.01")),
        );
        provider.fail.store(true, Ordering::SeqCst);
        let converter = RateConverter::new(provider.clone(), 1800);

        assert!(matches!(
            converter.get_rate(Currency::Usd, Currency::Pln).await,
            Err(RateError::ExternalServiceUnavailable(_))
        ));

        provider.fail.store(false, Ordering::SeqCst);
        assert_eq!(converter.get_rate(Currency::Usd, Currency::Pln).await.unwrap(), dec("4.01"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_pair_is_unavailable() {
        let converter = RateConverter::new(Arc::new(FixedRateProvider::new()), 1800);
        let err = converter
            .get_rate(Currency::Gbp, Currency::Uah)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No UAH rate"));
    }

    #[test]
    fn test_convert_rounds_half_up() {
        let converter = RateConverter::new(Arc::new(FixedRateProvider::new()), 1800);
        assert_eq!(converter.convert(dec("100"), dec("0.92345")), dec("92.35"));
        assert_eq!(converter.convert(dec("10"), dec("1.0005")), dec("10.01"));
        assert_eq!(converter.convert(dec("50"), Decimal::ONE), dec("50"));
    }
}
