//! Forecast lifecycle: submission, edits, locking, cancellation.
//!
//! A forecast moves PENDING -> {CORRECT, INCORRECT, VOID, CANCELLED}; all
//! terminal states are final. Locking is a side transition that freezes
//! edits without changing the status; once `locked_at` is set only the
//! settlement engine transitions the record.
//!
//! Submission is the multi-step operation with compensation: slot consume +
//! forecast insert commit as one store transaction, the fee debit follows
//! with a deterministic idempotency key, and a debit failure deletes the
//! forecast and refunds the slot before surfacing the error.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::cooldown::CooldownTimers;
use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::price::PriceSource;
use crate::session::SessionAuthority;
use crate::slots::SlotTracker;
use crate::store::GameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecastKind {
    Direction,
    Range,
}

impl ForecastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastKind::Direction => "DIRECTION",
            ForecastKind::Range => "RANGE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "DIRECTION" => Ok(ForecastKind::Direction),
            "RANGE" => Ok(ForecastKind::Range),
            other => Err(CoreError::InvariantViolation {
                detail: format!("unknown forecast kind {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            other => Err(CoreError::InvariantViolation {
                detail: format!("unknown direction {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecastStatus {
    Pending,
    Correct,
    Incorrect,
    Void,
    Cancelled,
}

impl ForecastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastStatus::Pending => "PENDING",
            ForecastStatus::Correct => "CORRECT",
            ForecastStatus::Incorrect => "INCORRECT",
            ForecastStatus::Void => "VOID",
            ForecastStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "PENDING" => Ok(ForecastStatus::Pending),
            "CORRECT" => Ok(ForecastStatus::Correct),
            "INCORRECT" => Ok(ForecastStatus::Incorrect),
            "VOID" => Ok(ForecastStatus::Void),
            "CANCELLED" => Ok(ForecastStatus::Cancelled),
            other => Err(CoreError::InvariantViolation {
                detail: format!("unknown forecast status {other:?}"),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ForecastStatus::Pending)
    }
}

/// What the user predicts: a direction, or an inclusive price range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ForecastChoice {
    Direction(Direction),
    Range { low: f64, high: f64 },
}

impl ForecastChoice {
    pub fn kind(&self) -> ForecastKind {
        match self {
            ForecastChoice::Direction(_) => ForecastKind::Direction,
            ForecastChoice::Range { .. } => ForecastKind::Range,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if let ForecastChoice::Range { low, high } = self {
            if !(low.is_finite() && high.is_finite()) || low > high {
                return Err(CoreError::InvalidBounds {
                    low: *low,
                    high: *high,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub id: Uuid,
    pub user_id: i64,
    pub trading_day: NaiveDate,
    /// Grading window, captured from the session authority at submission.
    pub window_id: String,
    pub symbol: String,
    pub kind: ForecastKind,
    pub direction: Option<Direction>,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub status: ForecastStatus,
    pub submitted_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Price observed at submission time. `None` when the feed had nothing;
    /// such forecasts always settle VOID.
    pub snapshot_price: Option<f64>,
    pub settlement_price: Option<f64>,
    pub points_earned: i64,
}

impl Forecast {
    pub fn new(
        user_id: i64,
        trading_day: NaiveDate,
        window_id: &str,
        symbol: &str,
        choice: ForecastChoice,
        snapshot_price: Option<f64>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let (direction, range_low, range_high) = match choice {
            ForecastChoice::Direction(d) => (Some(d), None, None),
            ForecastChoice::Range { low, high } => (None, Some(low), Some(high)),
        };
        Self {
            id: Uuid::new_v4(),
            user_id,
            trading_day,
            window_id: window_id.to_string(),
            symbol: symbol.to_string(),
            kind: choice.kind(),
            direction,
            range_low,
            range_high,
            status: ForecastStatus::Pending,
            submitted_at,
            locked_at: None,
            snapshot_price,
            settlement_price: None,
            points_earned: 0,
        }
    }

    pub fn new_direction(
        user_id: i64,
        trading_day: NaiveDate,
        window_id: &str,
        symbol: &str,
        direction: Direction,
        snapshot_price: Option<f64>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            user_id,
            trading_day,
            window_id,
            symbol,
            ForecastChoice::Direction(direction),
            snapshot_price,
            submitted_at,
        )
    }

    /// Idempotency key for the submission fee debit.
    pub fn fee_key(&self) -> String {
        format!("forecast:{}:fee", self.id)
    }

    /// Idempotency key for the CORRECT award.
    pub fn award_key(&self) -> String {
        format!("forecast:{}:award", self.id)
    }

    /// Idempotency key for the fee refund. Shared by VOID grading and
    /// cancellation on purpose: a forecast reaches at most one refunding
    /// terminal state, and the shared key guarantees at-most-once refund
    /// even across unexpected paths.
    pub fn refund_key(&self) -> String {
        format!("forecast:{}:refund", self.id)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitForecast {
    pub user_id: i64,
    pub symbol: String,
    pub choice: ForecastChoice,
}

#[derive(Clone)]
pub struct Forecasts {
    store: Arc<GameStore>,
    slots: SlotTracker,
    ledger: Ledger,
    cooldown: CooldownTimers,
    session: Arc<dyn SessionAuthority>,
    price: Arc<dyn PriceSource>,
    config: GameConfig,
}

impl Forecasts {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<GameStore>,
        slots: SlotTracker,
        ledger: Ledger,
        cooldown: CooldownTimers,
        session: Arc<dyn SessionAuthority>,
        price: Arc<dyn PriceSource>,
        config: GameConfig,
    ) -> Self {
        Self {
            store,
            slots,
            ledger,
            cooldown,
            session,
            price,
            config,
        }
    }

    /// Submit a forecast for the current window.
    pub async fn submit(
        &self,
        req: SubmitForecast,
        now: DateTime<Utc>,
    ) -> Result<Forecast, CoreError> {
        req.choice.validate()?;

        let trading_day = now.date_naive();
        if !self.session.is_open(trading_day) {
            return Err(CoreError::MarketClosed { trading_day });
        }
        let window_id = self
            .session
            .current_window(now)
            .ok_or(CoreError::NoOpenWindow)?;
        if !self.store.symbol_is_active(&req.symbol).await? {
            return Err(CoreError::SymbolNotTradable {
                symbol: req.symbol.clone(),
            });
        }

        // Best-effort snapshot: a dead feed never blocks the submission,
        // the forecast just settles VOID later.
        let snapshot_price = match self.price.snapshot(&req.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol = req.symbol, error = %e, "snapshot unavailable at submission");
                None
            }
        };

        let forecast = Forecast::new(
            req.user_id,
            trading_day,
            &window_id,
            &req.symbol,
            req.choice,
            snapshot_price,
            now,
        );

        // Slot consume + insert commit together; duplicates and exhaustion
        // roll back as one unit.
        let state = self
            .store
            .insert_forecast_consuming_slot(&forecast, self.config.slots_per_day)
            .await?;

        if self.config.submission_fee > 0 {
            if let Err(e) = self
                .ledger
                .debit(
                    req.user_id,
                    self.config.submission_fee,
                    "forecast submission fee",
                    &forecast.fee_key(),
                    trading_day,
                )
                .await
            {
                warn!(forecast_id = %forecast.id, error = %e, "fee debit failed, compensating");
                self.store.delete_forecast(forecast.id).await?;
                self.slots.refund(req.user_id, trading_day, 1).await?;
                return Err(e);
            }
        }

        info!(
            forecast_id = %forecast.id,
            user_id = req.user_id,
            symbol = forecast.symbol,
            window = window_id,
            slots_left = state.slots_available,
            "forecast submitted"
        );

        if state.slots_available < self.config.cooldown_threshold {
            if let Err(e) = self.cooldown.arm(req.user_id, trading_day).await {
                // Arming is opportunistic; the submission already stands.
                warn!(user_id = req.user_id, error = %e, "cooldown arm failed");
            }
        }

        Ok(forecast)
    }

    /// Replace the choice of an own, still PENDING and unlocked forecast.
    /// The new choice must match the forecast's kind. Never touches slots.
    pub async fn update(
        &self,
        forecast_id: Uuid,
        user_id: i64,
        choice: ForecastChoice,
    ) -> Result<Forecast, CoreError> {
        choice.validate()?;
        let forecast = self.owned_forecast(forecast_id, user_id).await?;
        Self::ensure_editable(&forecast)?;
        if choice.kind() != forecast.kind {
            return Err(CoreError::KindMismatch {
                expected: forecast.kind.as_str().to_string(),
            });
        }

        if !self.store.update_forecast_choice(forecast_id, &choice).await? {
            // Guard lost a race with locking or settlement.
            return Err(CoreError::ForecastLocked { id: forecast_id });
        }
        debug!(%forecast_id, user_id, "forecast updated");
        self.require(forecast_id).await
    }

    /// Cancel an own, still PENDING and unlocked forecast: refunds the slot
    /// and the submission fee. The status transition and the slot refund
    /// commit as one store transaction; the fee credit follows under the
    /// deterministic refund key, and cancelling an already CANCELLED forecast
    /// re-drives that credit instead of erroring, so a failure after the
    /// commit is healed by retrying.
    pub async fn cancel(&self, forecast_id: Uuid, user_id: i64) -> Result<Forecast, CoreError> {
        let forecast = self.owned_forecast(forecast_id, user_id).await?;
        if forecast.status != ForecastStatus::Cancelled {
            Self::ensure_editable(&forecast)?;
            if !self
                .store
                .cancel_forecast_refunding_slot(forecast_id, user_id, forecast.trading_day)
                .await?
            {
                return Err(CoreError::ForecastLocked { id: forecast_id });
            }
            info!(%forecast_id, user_id, "forecast cancelled");
        }
        if self.config.submission_fee > 0 {
            self.ledger
                .credit(
                    user_id,
                    self.config.submission_fee,
                    "forecast cancelled, fee refunded",
                    &forecast.refund_key(),
                    forecast.trading_day,
                )
                .await?;
        }
        self.require(forecast_id).await
    }

    /// Freeze all PENDING forecasts of a window ahead of grading.
    pub async fn lock_window(
        &self,
        trading_day: NaiveDate,
        window: &str,
    ) -> Result<usize, CoreError> {
        let locked = self.store.lock_window(trading_day, window).await?;
        debug!(%trading_day, window, locked, "window locked");
        Ok(locked)
    }

    pub async fn get(&self, forecast_id: Uuid) -> Result<Option<Forecast>, CoreError> {
        self.store.get_forecast(forecast_id).await
    }

    pub async fn list_for_user(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<Vec<Forecast>, CoreError> {
        self.store.list_forecasts(user_id, trading_day).await
    }

    async fn require(&self, forecast_id: Uuid) -> Result<Forecast, CoreError> {
        self.store
            .get_forecast(forecast_id)
            .await?
            .ok_or(CoreError::ForecastNotFound { id: forecast_id })
    }

    /// Ownership check. Another user's forecast reads as not-found.
    async fn owned_forecast(&self, forecast_id: Uuid, user_id: i64) -> Result<Forecast, CoreError> {
        let forecast = self.require(forecast_id).await?;
        if forecast.user_id != user_id {
            return Err(CoreError::ForecastNotFound { id: forecast_id });
        }
        Ok(forecast)
    }

    fn ensure_editable(forecast: &Forecast) -> Result<(), CoreError> {
        if forecast.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                from: forecast.status.as_str().to_string(),
                to: ForecastStatus::Pending.as_str().to_string(),
            });
        }
        if forecast.locked_at.is_some() {
            return Err(CoreError::ForecastLocked { id: forecast.id });
        }
        Ok(())
    }
}
