//! Per-tick decision rules
//!
//! Pure mapping from (state, observed prices, time) to what the trader should
//! do. No broker access happens here.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use super::TraderState;
use crate::signal::{SignalReference, SignalThresholds};
use crate::types::Instrument;

/// Strategy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyParams {
    /// Divergence size and age that make a signal
    pub thresholds: SignalThresholds,
    /// Relative drop below entry that forces a return to leverage (e.g., 0.005 = 0.5%)
    pub stop_loss_pct: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            thresholds: SignalThresholds::default(),
            stop_loss_pct: 0.005,
        }
    }
}

/// Why a swap was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapReason {
    /// Leveraged ran ahead of a still base price
    PositiveDivergence,
    /// Base price rose above the entry price
    TakeProfit,
    /// Leveraged fell behind a still base price
    NegativeDivergence,
    /// Base price fell too far below the entry price
    StopLoss,
}

impl fmt::Display for SwapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapReason::PositiveDivergence => write!(f, "POSITIVE_DIVERGENCE"),
            SwapReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            SwapReason::NegativeDivergence => write!(f, "NEGATIVE_DIVERGENCE"),
            SwapReason::StopLoss => write!(f, "STOP_LOSS"),
        }
    }
}

/// What a tick should do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Re-derive the holding from the account
    Initialize,
    Stay,
    /// Base price moved: restart the reference, keep the holding
    ResetReference(SignalReference),
    /// Rotate out of `from` into the other instrument
    Swap { from: Instrument, reason: SwapReason },
}

/// Decide the action for one tick
pub fn decide(
    state: &TraderState,
    base_price: f64,
    lev_price: f64,
    now: DateTime<Utc>,
    params: &StrategyParams,
) -> Decision {
    match state {
        TraderState::Initializing => Decision::Initialize,

        TraderState::HoldingLeveraged(reference) => {
            if reference.base_changed(base_price) {
                return Decision::ResetReference(reference.reset(base_price, lev_price, now));
            }
            let reading = reference.read(lev_price, now, &params.thresholds);
            if reading.mature_positive() {
                Decision::Swap {
                    from: Instrument::Leveraged,
                    reason: SwapReason::PositiveDivergence,
                }
            } else {
                Decision::Stay
            }
        }

        TraderState::HoldingNonLeveraged(reference) => {
            let entry = reference.position_entry_price;
            // A moved base restarts the reference, so the old divergence is void
            let base_changed = reference.base_changed(base_price);
            let diverged = !base_changed
                && reference
                    .read(lev_price, now, &params.thresholds)
                    .mature_negative();

            let reason = if base_price > entry {
                Some(SwapReason::TakeProfit)
            } else if diverged {
                Some(SwapReason::NegativeDivergence)
            } else if entry > 0.0 && (entry - base_price) / entry > params.stop_loss_pct {
                Some(SwapReason::StopLoss)
            } else {
                None
            };

            match reason {
                Some(reason) => Decision::Swap {
                    from: Instrument::Base,
                    reason,
                },
                None if base_changed => {
                    Decision::ResetReference(reference.reset(base_price, lev_price, now))
                }
                None => Decision::Stay,
            }
        }
    }
}

/// Minimum hold as configured in seconds
pub fn min_hold_from_secs(secs: u64) -> Duration {
    Duration::seconds(secs as i64)
}
