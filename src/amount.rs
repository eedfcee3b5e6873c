//! Validated payment amounts.
//!
//! An [`Amount`] is the triple `(amount, currency, denomination)` carried by
//! every payment entity. The amount is kept as a decimal string to preserve
//! exactly what the caller supplied; arithmetic happens in integer base units
//! only. Converting between `BASE` and `MAIN` is a payment-method concern and
//! is never done here.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default currency tag when a payload omits one.
pub const DEFAULT_CURRENCY: &str = "BTC";

/// Amount validation errors.
#[derive(Debug, Error)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("currency must be a non-empty tag")]
    EmptyCurrency,
}

/// Unit the amount string is expressed in.
///
/// `Base` is the indivisible unit (e.g. satoshi); `Main` is the
/// human-facing unit (e.g. whole coin). The engine only ever compares and
/// adds `Base` amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Denomination {
    #[default]
    Base,
    Main,
}

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denomination::Base => write!(f, "BASE"),
            Denomination::Main => write!(f, "MAIN"),
        }
    }
}

/// Validated amount triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Decimal string, non-negative.
    pub amount: String,
    /// Currency tag (ISO-4217-like, defaults to `BTC`).
    pub currency: String,
    /// Unit of `amount`.
    pub denomination: Denomination,
}

impl Amount {
    /// Validate and build an amount. `currency`/`denomination` fall back to
    /// `BTC`/`BASE` when absent.
    pub fn new(
        amount: impl Into<String>,
        currency: Option<String>,
        denomination: Option<Denomination>,
    ) -> Result<Self, AmountError> {
        let amount = amount.into();
        validate_amount_str(&amount)?;

        let currency = currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        if currency.trim().is_empty() {
            return Err(AmountError::EmptyCurrency);
        }

        Ok(Self {
            amount,
            currency,
            denomination: denomination.unwrap_or_default(),
        })
    }

    /// Base-unit amount in satoshis (a whole `BASE` amount).
    ///
    /// Only meaningful for `BASE`-denominated amounts; the engine never sums
    /// `MAIN` amounts.
    pub fn base_units(&self) -> Result<u64, AmountError> {
        self.amount
            .parse::<u64>()
            .map_err(|_| AmountError::InvalidAmount(self.amount.clone()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.amount, self.currency, self.denomination)
    }
}

fn validate_amount_str(s: &str) -> Result<(), AmountError> {
    if s.is_empty() {
        return Err(AmountError::InvalidAmount(s.to_string()));
    }
    // Non-negative decimal string: digits with at most one fractional point.
    let mut dots = 0;
    for c in s.chars() {
        match c {
            '0'..='9' => {}
            '.' => dots += 1,
            _ => return Err(AmountError::InvalidAmount(s.to_string())),
        }
    }
    if dots > 1 || s.starts_with('.') || s.ends_with('.') {
        return Err(AmountError::InvalidAmount(s.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied() {
        let amt = Amount::new("100", None, None).unwrap();
        assert_eq!(amt.currency, "BTC");
        assert_eq!(amt.denomination, Denomination::Base);
        assert_eq!(amt.base_units().unwrap(), 100);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert!(Amount::new("-1", None, None).is_err());
        assert!(Amount::new("1e5", None, None).is_err());
        assert!(Amount::new("", None, None).is_err());
        assert!(Amount::new("1.2.3", None, None).is_err());
        assert!(Amount::new(".5", None, None).is_err());
    }

    #[test]
    fn rejects_empty_currency() {
        assert!(matches!(
            Amount::new("1", Some("  ".to_string()), None),
            Err(AmountError::EmptyCurrency)
        ));
    }

    #[test]
    fn serializes_to_three_fields() {
        let amt = Amount::new("42", Some("BTC".into()), Some(Denomination::Main)).unwrap();
        let json = serde_json::to_value(&amt).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"amount": "42", "currency": "BTC", "denomination": "MAIN"})
        );
    }
}
