//! Money Module
//!
//! Currency codes and the decimal rules shared by the ledger, the rate
//! converter and the orchestrator.
//!
//! ## Representation
//! - Amounts are `rust_decimal::Decimal`, never floats
//! - Caller-supplied amounts carry at most [`MONEY_SCALE`] fractional digits
//! - Converted amounts are rounded half-up to [`MONEY_SCALE`]

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fractional digits of caller-facing amounts
pub const MONEY_SCALE: u32 = 2;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must be greater than zero")]
    NotPositive,

    #[error("Amount has {provided} decimal places, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),
}

// ============================================================================
// Currency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Pln,
    Uah,
    Chf,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Pln => "PLN",
            Currency::Uah => "UAH",
            Currency::Chf => "CHF",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "PLN" => Ok(Currency::Pln),
            "UAH" => Ok(Currency::Uah),
            "CHF" => Ok(Currency::Chf),
            other => Err(MoneyError::UnknownCurrency(other.to_string())),
        }
    }
}

// ============================================================================
// Amount rules
// ============================================================================

/// Validate a caller-supplied amount: strictly positive, at most 2 decimals.
pub fn validate_amount(amount: Decimal) -> Result<Decimal, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }

    // 10.50 has scale 2 but 10.500 also normalizes to 10.5
    let scale = amount.normalize().scale();
    if scale > MONEY_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: scale,
            max: MONEY_SCALE,
        });
    }

    Ok(amount)
}

/// Round to [`MONEY_SCALE`] decimals, half-up.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_validate_amount() {
        assert_eq!(validate_amount(dec("100")), Ok(dec("100")));
        assert_eq!(validate_amount(dec("0.01")), Ok(dec("0.01")));
        assert_eq!(validate_amount(dec("10.500")), Ok(dec("10.500")));
        assert_eq!(validate_amount(Decimal::ZERO), Err(MoneyError::NotPositive));
        assert_eq!(validate_amount(dec("-5")), Err(MoneyError::NotPositive));
        assert_eq!(
            validate_amount(dec("1.001")),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(dec("1.005")), dec("1.01"));
        assert_eq!(round_money(dec("1.004")), dec("1.00"));
        assert_eq!(round_money(dec("92.345")), dec("92.35"));
        assert_eq!(round_money(dec("100")), dec("100"));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("usd".parse::<Currency>(), Ok(Currency::Usd));
        assert_eq!("EUR".parse::<Currency>(), Ok(Currency::Eur));
        assert!(matches!(
            "XYZ".parse::<Currency>(),
            Err(MoneyError::UnknownCurrency(_))
        ));
        assert_eq!(Currency::Pln.to_string(), "PLN");
    }

    #[test]
    fn test_currency_serde_uppercase() {
        let json = serde_json::to_string(&Currency::Gbp).unwrap();
        assert_eq!(json, "\"GBP\"");
        let back: Currency = serde_json::from_str("\"CHF\"").unwrap();
        assert_eq!(back, Currency::Chf);
    }
}
