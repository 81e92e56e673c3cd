//! Divergence signal
//!
//! The leveraged instrument reprices faster than the 1x one. While the base
//! price stands still, the relative move of the leveraged price since the base
//! last changed is the divergence the bot trades on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Reference point the divergence is measured against.
///
/// Both reference prices are the ones observed at `time_last_base_change`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalReference {
    pub time_last_base_change: DateTime<Utc>,
    pub base_value_at_last_change: f64,
    pub lev_value_at_last_change: f64,
    /// Price paid for the instrument currently held
    pub position_entry_price: f64,
}

impl SignalReference {
    pub fn new(base_price: f64, lev_price: f64, entry_price: f64, now: DateTime<Utc>) -> Self {
        Self {
            time_last_base_change: now,
            base_value_at_last_change: base_price,
            lev_value_at_last_change: lev_price,
            position_entry_price: entry_price,
        }
    }

    /// True when the observed base price differs from the reference
    pub fn base_changed(&self, base_price: f64) -> bool {
        base_price != self.base_value_at_last_change
    }

    /// Restart the reference at the current prices, keeping the entry price
    pub fn reset(&self, base_price: f64, lev_price: f64, now: DateTime<Utc>) -> Self {
        Self::new(base_price, lev_price, self.position_entry_price, now)
    }

    /// Relative move of the leveraged price since the reference was taken
    pub fn divergence(&self, lev_price: f64) -> f64 {
        if self.lev_value_at_last_change <= 0.0 {
            return 0.0;
        }
        (lev_price - self.lev_value_at_last_change) / self.lev_value_at_last_change
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.time_last_base_change
    }

    /// Evaluate the signal against `thresholds`
    pub fn read(&self, lev_price: f64, now: DateTime<Utc>, thresholds: &SignalThresholds) -> DivergenceReading {
        let divergence = self.divergence(lev_price);
        let age = self.age(now);
        let mature = divergence.abs() > thresholds.divergence_threshold && age > thresholds.min_hold;
        DivergenceReading {
            divergence,
            age,
            mature,
        }
    }
}

/// When a divergence counts as a signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    /// Absolute relative divergence that must be exceeded
    pub divergence_threshold: f64,
    /// Time the base price must have stood still
    pub min_hold: Duration,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            divergence_threshold: 0.004,
            min_hold: Duration::minutes(2),
        }
    }
}

/// One evaluation of the divergence signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceReading {
    pub divergence: f64,
    pub age: Duration,
    pub mature: bool,
}

impl DivergenceReading {
    /// Leveraged ran ahead: rotate into the base instrument
    pub fn mature_positive(&self) -> bool {
        self.mature && self.divergence > 0.0
    }

    /// Leveraged fell behind: rotate back into leverage
    pub fn mature_negative(&self) -> bool {
        self.mature && self.divergence < 0.0
    }
}
