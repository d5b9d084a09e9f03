//! Token rate, currency conversion, and token quantity rounding.

use std::{fmt, sync::Arc};

use hashbrown::HashMap;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use tracing::warn;

use crate::error::WalletError;

/// Decimal places kept from `amount / rate` before rounding to whole tokens.
///
/// Prices entered as "tokens per unit" are stored as `1 / tokens`, which is not exact in base 10;
/// anything finer than this is treated as representation noise.
pub const QUOTIENT_SCALE: u32 = 9;

/// Price of one token in the reference currency. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate(Decimal);

impl Default for Rate {
    fn default() -> Self {
        Rate(Decimal::ONE)
    }
}

impl Rate {
    /// Wraps `price`, falling back to 1 when it is not positive.
    pub fn new(price: Decimal) -> Self {
        if price > Decimal::ZERO {
            Rate(price)
        } else {
            warn!(%price, "token price must be positive, using 1");
            Rate::default()
        }
    }

    /// Parses the "tokens per one reference unit" form used by shop administrators.
    ///
    /// Accepts `digits` or `digits.digits`; anything else, or zero, yields rate 1.
    pub fn from_tokens_per_unit(raw: &str) -> Self {
        let raw = raw.trim();
        let well_formed = match raw.split_once('.') {
            Some((int, frac)) => is_digits(int) && is_digits(frac),
            None => is_digits(raw),
        };
        if !well_formed {
            if !raw.is_empty() {
                warn!(raw, "malformed tokens-per-unit setting, using rate 1");
            }
            return Rate::default();
        }

        match raw.parse::<Decimal>() {
            Ok(tokens) if tokens > Decimal::ZERO => Decimal::ONE
                .checked_div(tokens)
                .map(Rate::new)
                .unwrap_or_default(),
            _ => Rate::default(),
        }
    }

    /// Currency per token.
    pub fn price(self) -> Decimal {
        self.0
    }

    /// Tokens per one unit of reference currency, for display.
    pub fn tokens_per_unit(self) -> Decimal {
        (Decimal::ONE / self.0).round_dp(QUOTIENT_SCALE).normalize()
    }

    /// Tokens required to pay `amount`, rounded up.
    pub fn tokens_needed(self, amount: Decimal) -> Result<i64, WalletError> {
        self.quotient(amount)?
            .ceil()
            .to_i64()
            .ok_or_else(|| WalletError::InvalidInput(format!("token amount out of range for {amount}")))
    }

    /// Tokens granted for `amount`, rounded down.
    pub fn tokens_granted(self, amount: Decimal) -> Result<i64, WalletError> {
        self.quotient(amount)?
            .floor()
            .to_i64()
            .ok_or_else(|| WalletError::InvalidInput(format!("token amount out of range for {amount}")))
    }

    /// Reference-currency price of `tokens`.
    pub fn cost_of(self, tokens: i64) -> Result<Decimal, WalletError> {
        Decimal::from(tokens)
            .checked_mul(self.0)
            .ok_or_else(|| WalletError::InvalidInput(format!("price of {tokens} tokens out of range")))
    }

    fn quotient(self, amount: Decimal) -> Result<Decimal, WalletError> {
        amount
            .checked_div(self.0)
            .map(|q| q.round_dp(QUOTIENT_SCALE))
            .ok_or_else(|| WalletError::InvalidInput(format!("cannot convert {amount} to tokens")))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Pluggable lookup of exchange factors into the reference currency.
pub trait ConversionSource: Send + Sync {
    /// Multiplier turning one unit of `from` into `reference`, or `None` when unknown.
    fn factor(&self, from: &str, reference: &str) -> Option<Decimal>;
}

impl<F> ConversionSource for F
where
    F: Fn(&str, &str) -> Option<Decimal> + Send + Sync,
{
    fn factor(&self, from: &str, reference: &str) -> Option<Decimal> {
        self(from, reference)
    }
}

/// Source that knows no foreign currencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConversion;

impl ConversionSource for NoConversion {
    fn factor(&self, _from: &str, _reference: &str) -> Option<Decimal> {
        None
    }
}

/// Fixed table of "foreign units per one reference unit", as multi-currency shop plugins store it.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    per_reference: HashMap<String, Decimal>,
}

impl RateTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that one reference unit buys `units` of `currency`.
    pub fn with_rate(mut self, currency: impl Into<String>, units: Decimal) -> Self {
        self.per_reference.insert(currency.into(), units);
        self
    }
}

impl ConversionSource for RateTable {
    fn factor(&self, from: &str, _reference: &str) -> Option<Decimal> {
        let units = self.per_reference.get(from)?;
        if *units <= Decimal::ZERO {
            return None;
        }
        Decimal::ONE.checked_div(*units)
    }
}

/// Rate plus currency context: everything needed to turn money into tokens.
#[derive(Clone)]
pub struct Pricing {
    rate: Rate,
    reference_currency: String,
    conversion: Arc<dyn ConversionSource>,
}

impl fmt::Debug for Pricing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pricing")
            .field("rate", &self.rate)
            .field("reference_currency", &self.reference_currency)
            .finish_non_exhaustive()
    }
}

impl Pricing {
    /// Pricing without foreign-currency support.
    pub fn new(rate: Rate, reference_currency: impl Into<String>) -> Self {
        Self {
            rate,
            reference_currency: reference_currency.into(),
            conversion: Arc::new(NoConversion),
        }
    }

    /// Replaces the conversion source.
    pub fn with_conversion(mut self, conversion: Arc<dyn ConversionSource>) -> Self {
        self.conversion = conversion;
        self
    }

    /// Configured rate.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// Currency the rate is expressed in.
    pub fn reference_currency(&self) -> &str {
        &self.reference_currency
    }

    /// Factor turning one unit of `from` into the reference currency.
    ///
    /// Unknown currencies and non-positive factors count as 1.
    pub fn conversion_factor(&self, from: &str) -> Decimal {
        if from == self.reference_currency {
            return Decimal::ONE;
        }
        match self.conversion.factor(from, &self.reference_currency) {
            Some(factor) if factor > Decimal::ZERO => factor,
            _ => {
                warn!(from, reference = %self.reference_currency, "no conversion factor, treating as 1");
                Decimal::ONE
            }
        }
    }

    /// `amount` expressed in the reference currency.
    pub fn convert_to_reference(&self, amount: Decimal, from: &str) -> Result<Decimal, WalletError> {
        if from == self.reference_currency {
            return Ok(amount);
        }
        amount
            .checked_mul(self.conversion_factor(from))
            .ok_or_else(|| WalletError::InvalidInput(format!("cannot convert {amount} {from}")))
    }

    /// Tokens needed to pay `amount` in the reference currency; rounds up.
    pub fn tokens_needed(&self, amount: Decimal) -> Result<i64, WalletError> {
        self.rate.tokens_needed(amount)
    }

    /// Tokens granted for `amount` in the reference currency; rounds down.
    pub fn tokens_granted(&self, amount: Decimal) -> Result<i64, WalletError> {
        self.rate.tokens_granted(amount)
    }

    /// Tokens needed to pay `amount` in `currency`.
    pub fn quote_spend(&self, amount: Decimal, currency: &str) -> Result<i64, WalletError> {
        self.tokens_needed(self.convert_to_reference(amount, currency)?)
    }

    /// Tokens granted for paying `amount` in `currency`.
    pub fn quote_topup(&self, amount: Decimal, currency: &str) -> Result<i64, WalletError> {
        self.tokens_granted(self.convert_to_reference(amount, currency)?)
    }
}
