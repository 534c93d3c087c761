//! Slot tracker: the scarce resource gating forecast submission.
//!
//! One slot is one unit of daily submission capacity, keyed by
//! `(user_id, trading_day)`. Consumption is linearizable per key because the
//! store implements it as a single conditional decrement, never
//! read-then-write.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GameConfig;
use crate::error::CoreError;
use crate::store::GameStore;

/// Daily slot counters. `0 <= slots_available <= slots_max` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub user_id: i64,
    pub trading_day: NaiveDate,
    /// Count of forecasts submitted today (never decremented).
    pub slots_made: i64,
    pub slots_available: i64,
    pub slots_max: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SlotTracker {
    store: Arc<GameStore>,
    config: GameConfig,
}

impl SlotTracker {
    pub fn new(store: Arc<GameStore>, config: GameConfig) -> Self {
        Self { store, config }
    }

    /// Take one slot, or fail with `SlotsExhausted` if none remain at the
    /// moment of the attempt. Increments `slots_made` on success.
    pub async fn consume(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<SlotState, CoreError> {
        let state = self
            .store
            .consume_slot(user_id, trading_day, self.config.slots_per_day)
            .await?;
        debug!(
            user_id,
            %trading_day,
            available = state.slots_available,
            "slot consumed"
        );
        Ok(state)
    }

    /// Give back `n` slots, saturating at the ceiling. Used as compensation
    /// when a later submission step fails, and on forecast cancellation.
    pub async fn refund(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
    ) -> Result<SlotState, CoreError> {
        let state = self.store.refund_slots(user_id, trading_day, n).await?;
        debug!(
            user_id,
            %trading_day,
            n,
            available = state.slots_available,
            "slots refunded"
        );
        Ok(state)
    }

    /// Cooldown refill: add up to `n` slots but never past `min(cap,
    /// slots_max)`, and never downward. A state already at or above `cap` is
    /// left untouched.
    pub async fn replenish(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
        cap: i64,
    ) -> Result<SlotState, CoreError> {
        let state = self
            .store
            .replenish_slots(user_id, trading_day, n, cap)
            .await?;
        debug!(
            user_id,
            %trading_day,
            n,
            cap,
            available = state.slots_available,
            "slots replenished"
        );
        Ok(state)
    }

    /// Unlock event: grow the ceiling by `n` and grant the same `n`.
    pub async fn raise_ceiling(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
    ) -> Result<SlotState, CoreError> {
        self.store
            .raise_ceiling(user_id, trading_day, n, self.config.slots_per_day)
            .await
    }

    /// Current state, lazily creating the daily row.
    pub async fn state(&self, user_id: i64, trading_day: NaiveDate) -> Result<SlotState, CoreError> {
        self.store
            .slot_state(user_id, trading_day, self.config.slots_per_day)
            .await
    }
}
