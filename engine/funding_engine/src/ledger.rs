//! # Ledger primitives
//!
//! Value objects shared by every component. None of them perform I/O.
//!
//! | Type           | Range / scale                 | Used for                              |
//! |----------------|-------------------------------|---------------------------------------|
//! | [`Money`]      | fixed-point, 2 decimal places | donation amounts, campaign totals     |
//! | [`Percentage`] | decimal ratio (1.00 = 100%)   | expiry completion threshold, coverage |
//! | [`Score`]      | clamped to `[0.00, 100.00]`   | transparency score                    |
//!
//! All three wrap [`rust_decimal::Decimal`] so that sums never pick up binary
//! floating-point drift.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const SCALE: u32 = 2;

/// Largest amount accepted from callers, in minor units (one trillion).
const MAX_MINOR_UNITS: i64 = 100_000_000_000_000;

fn normalise(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(SCALE);
    rounded
}

// ─────────────────────────────────────────────────────────
// Money
// ─────────────────────────────────────────────────────────

/// A monetary amount with exactly two decimal places.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub fn new(value: Decimal) -> Self {
        Money(normalise(value))
    }

    /// Build from minor units, e.g. `Money::from_minor(100_050)` is `1000.50`.
    pub fn from_minor(units: i64) -> Self {
        Money(Decimal::new(units, SCALE))
    }

    pub fn zero() -> Self {
        Money::from_minor(0)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Decimal::from_str(raw.trim())
            .map(Money::new)
            .map_err(|_| Error::InvalidAmount(format!("{raw:?} is not a decimal amount")))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money::new)
    }

    /// Subtract, flooring the result at zero.
    pub fn saturating_sub(self, other: Money) -> Money {
        if other.0 >= self.0 {
            Money::zero()
        } else {
            Money::new(self.0 - other.0)
        }
    }

    /// Upper bound for any single amount entering the engine.
    pub fn max_accepted() -> Self {
        Money::from_minor(MAX_MINOR_UNITS)
    }

    /// Reject amounts above [`Money::max_accepted`]; `what` names the field.
    pub fn ensure_accepted(self, what: &str) -> Result<Money> {
        if self > Money::max_accepted() {
            return Err(Error::InvalidAmount(format!(
                "{what} {self} exceeds the maximum of {}",
                Money::max_accepted()
            )));
        }
        Ok(self)
    }

    /// Overflow-checked sum.
    pub fn try_sum<I: IntoIterator<Item = Money>>(items: I) -> Result<Money> {
        items
            .into_iter()
            .try_fold(Money::zero(), |total, item| total.checked_add(item))
            .ok_or_else(|| Error::InvalidAmount("sum of amounts overflows".into()))
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Money::parse(s)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────
// Percentage
// ─────────────────────────────────────────────────────────

/// A ratio where `1.00` means 100%.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Percentage(Decimal);

impl Percentage {
    /// `Percentage::from_percent(80)` is a ratio of `0.80`.
    pub fn from_percent(percent: i64) -> Self {
        Percentage(Decimal::new(percent, 2))
    }

    pub fn ratio(&self) -> Decimal {
        self.0
    }

    /// The share `part` represents of `whole`. Zero when `whole` is zero,
    /// saturates when the quotient does not fit.
    pub fn between(part: Money, whole: Money) -> Self {
        if whole.is_zero() {
            return Percentage(Decimal::ZERO);
        }
        let ratio = part
            .amount()
            .checked_div(whole.amount())
            .map(|r| r.round_dp(4))
            .unwrap_or(Decimal::MAX);
        Percentage(ratio)
    }

    /// Apply the ratio to an amount, saturating on overflow.
    pub fn of(&self, amount: Money) -> Money {
        amount
            .amount()
            .checked_mul(self.0)
            .map(Money::new)
            .unwrap_or(Money(Decimal::MAX))
    }

    /// Display value in percent, e.g. `80.00`.
    pub fn as_percent(&self) -> Decimal {
        normalise(
            self.0
                .checked_mul(Decimal::ONE_HUNDRED)
                .unwrap_or(Decimal::MAX),
        )
    }
}

// ─────────────────────────────────────────────────────────
// Score
// ─────────────────────────────────────────────────────────

/// A transparency score, always within `[0.00, 100.00]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Decimal", into = "Decimal")]
pub struct Score(Decimal);

impl Score {
    pub fn min() -> Self {
        Score(normalise(Decimal::ZERO))
    }

    pub fn max() -> Self {
        Score(normalise(Decimal::ONE_HUNDRED))
    }

    /// Clamp an arbitrary decimal into the valid range.
    pub fn clamped(raw: Decimal) -> Self {
        let value = normalise(raw);
        if value < Decimal::ZERO {
            Score::min()
        } else if value > Decimal::ONE_HUNDRED {
            Score::max()
        } else {
            Score(value)
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Decimal::from_str(raw.trim())
            .map(Score::clamped)
            .map_err(|_| Error::Validation(format!("{raw:?} is not a score")))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `clamp(self + delta, 0.00, 100.00)`.
    pub fn apply(self, delta: Decimal) -> Score {
        Score::clamped(self.0 + delta)
    }
}

impl From<Decimal> for Score {
    fn from(value: Decimal) -> Self {
        Score::clamped(value)
    }
}

impl From<Score> for Decimal {
    fn from(value: Score) -> Self {
        value.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
