//! Error taxonomy for the game core.
//!
//! Variants group into the families the components care about:
//! resource exhaustion (surfaced, not retried), conflicts (surfaced, caller
//! may retry with different input), not-found, transient upstream failures
//! (retried by the batch driver with per-item isolation), and invariant
//! violations (logged, absorbed as no-ops where idempotence requires it).

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no slots remaining for user {user_id} on {trading_day}")]
    SlotsExhausted { user_id: i64, trading_day: NaiveDate },

    #[error("duplicate forecast for user {user_id} on {trading_day}: {detail}")]
    DuplicateForecast {
        user_id: i64,
        trading_day: NaiveDate,
        detail: String,
    },

    #[error("forecast {id} is locked for settlement")]
    ForecastLocked { id: Uuid },

    #[error("market is closed on {trading_day}")]
    MarketClosed { trading_day: NaiveDate },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("choice does not match forecast kind {expected}")]
    KindMismatch { expected: String },

    #[error("invalid range bounds: low {low} > high {high}")]
    InvalidBounds { low: f64, high: f64 },

    #[error("forecast {id} not found")]
    ForecastNotFound { id: Uuid },

    #[error("symbol {symbol} is not in the tradable set")]
    SymbolNotTradable { symbol: String },

    #[error("no open forecast window right now")]
    NoOpenWindow,

    #[error("price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("scheduler unavailable: {reason}")]
    SchedulerUnavailable { reason: String },

    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl CoreError {
    /// Whether a retry against the same input can reasonably succeed.
    /// Used by the settlement batch driver: transient failures leave the
    /// affected window PENDING for the next run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::PriceUnavailable { .. } | CoreError::SchedulerUnavailable { .. }
        )
    }
}
