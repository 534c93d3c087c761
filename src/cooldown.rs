//! Cooldown timers: scheduled slot replenishment.
//!
//! A timer is armed when a consumption leaves the user's slot count below
//! the low-water threshold. It lives in the store as an ACTIVE row (at most
//! one per `(user, day)`, enforced by a partial unique index) and as a
//! one-shot registration with an external scheduler. The scheduler delivers
//! at-least-once, possibly late and possibly out of order; `complete` checks
//! the persisted status before doing anything, so duplicate and stale
//! deliveries are absorbed as no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::error::CoreError;
use crate::slots::SlotTracker;
use crate::store::GameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerStatus {
    Active,
    Completed,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Active => "ACTIVE",
            TimerStatus::Completed => "COMPLETED",
            TimerStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "ACTIVE" => Ok(TimerStatus::Active),
            "COMPLETED" => Ok(TimerStatus::Completed),
            "CANCELLED" => Ok(TimerStatus::Cancelled),
            other => Err(CoreError::InvariantViolation {
                detail: format!("unknown timer status {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownTimer {
    pub id: Uuid,
    pub user_id: i64,
    pub trading_day: NaiveDate,
    /// When the external callback is due.
    pub scheduled_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub slots_to_refill: i64,
    /// Opaque scheduler-side registration id; `None` until the scheduler
    /// confirms registration.
    pub external_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// External scheduler boundary. Registration happens as the last, possibly
/// failing step of `arm`; delivery is at-least-once.
pub trait OneShotScheduler: Send + Sync {
    /// Register a one-shot callback carrying `timer_id` after `delay`.
    fn register_one_shot(&self, delay: Duration, timer_id: Uuid) -> Result<String, CoreError>;

    /// Best-effort de-registration of a previously returned handle.
    fn cancel(&self, handle: &str) -> Result<(), CoreError>;
}

/// In-process scheduler: one sleeping task per registration, firing onto an
/// mpsc channel that the cooldown driver consumes.
pub struct TokioOneShotScheduler {
    tx: mpsc::UnboundedSender<Uuid>,
    tasks: Arc<parking_lot::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl TokioOneShotScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                tasks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            },
            rx,
        )
    }
}

impl OneShotScheduler for TokioOneShotScheduler {
    fn register_one_shot(&self, delay: Duration, timer_id: Uuid) -> Result<String, CoreError> {
        let handle_id = Uuid::new_v4().to_string();
        let tx = self.tx.clone();
        let tasks = self.tasks.clone();
        let key = handle_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the driver shut down; nothing to deliver to.
            let _ = tx.send(timer_id);
            tasks.lock().remove(&key);
        });
        self.tasks.lock().insert(handle_id.clone(), task);
        Ok(handle_id)
    }

    fn cancel(&self, handle: &str) -> Result<(), CoreError> {
        if let Some(task) = self.tasks.lock().remove(handle) {
            task.abort();
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CooldownTimers {
    store: Arc<GameStore>,
    scheduler: Arc<dyn OneShotScheduler>,
    slots: SlotTracker,
    config: GameConfig,
}

impl CooldownTimers {
    pub fn new(
        store: Arc<GameStore>,
        scheduler: Arc<dyn OneShotScheduler>,
        slots: SlotTracker,
        config: GameConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            slots,
            config,
        }
    }

    /// Arm a timer for the key. No-op returning the existing timer when one
    /// is already ACTIVE; losing an insert race to a concurrent armer takes
    /// the same path. Scheduler registration is the last step: if it fails,
    /// the persisted row is deleted again and the error surfaced.
    pub async fn arm(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<CooldownTimer, CoreError> {
        if let Some(existing) = self.store.active_timer(user_id, trading_day).await? {
            debug!(user_id, %trading_day, timer_id = %existing.id, "timer already active");
            return Ok(existing);
        }

        let state = self.slots.state(user_id, trading_day).await?;
        let slots_to_refill = (self.config.cooldown_threshold - state.slots_available).max(1);
        let now = Utc::now();
        let delay = Duration::from_secs(self.config.cooldown_delay_secs);
        let mut timer = CooldownTimer {
            id: Uuid::new_v4(),
            user_id,
            trading_day,
            scheduled_at: now + chrono::Duration::seconds(self.config.cooldown_delay_secs as i64),
            status: TimerStatus::Active,
            slots_to_refill,
            external_handle: None,
            created_at: now,
            resolved_at: None,
        };

        if !self.store.insert_timer(&timer).await? {
            // A concurrent armer won the partial-index race.
            if let Some(existing) = self.store.active_timer(user_id, trading_day).await? {
                debug!(user_id, %trading_day, timer_id = %existing.id, "lost arm race");
                return Ok(existing);
            }
            return Err(CoreError::InvariantViolation {
                detail: format!(
                    "timer insert rejected for user {user_id} on {trading_day} \
                     but no ACTIVE timer found"
                ),
            });
        }

        match self.scheduler.register_one_shot(delay, timer.id) {
            Ok(handle) => {
                self.store.set_timer_handle(timer.id, &handle).await?;
                info!(
                    user_id,
                    %trading_day,
                    timer_id = %timer.id,
                    slots_to_refill,
                    delay_secs = self.config.cooldown_delay_secs,
                    "cooldown timer armed"
                );
                timer.external_handle = Some(handle);
                Ok(timer)
            }
            Err(e) => {
                warn!(timer_id = %timer.id, error = %e, "scheduler registration failed, rolling back timer");
                self.store.delete_timer(timer.id).await?;
                Err(e)
            }
        }
    }

    /// Callback entry point, idempotent under duplicate and late delivery:
    /// anything other than an ACTIVE timer is absorbed as a no-op. Refills
    /// only while slots are still below the threshold, then re-arms if they
    /// remain below it after the refill.
    pub async fn complete(&self, timer_id: Uuid) -> Result<(), CoreError> {
        let Some(timer) = self.store.get_timer(timer_id).await? else {
            warn!(%timer_id, "completion callback for unknown timer, ignoring");
            return Ok(());
        };
        if timer.status != TimerStatus::Active {
            debug!(%timer_id, status = timer.status.as_str(), "stale or duplicate delivery, ignoring");
            return Ok(());
        }

        // The cap makes "refill only if still below threshold" a property of
        // the store op: a state at or above it is untouched.
        let state = self
            .slots
            .replenish(
                timer.user_id,
                timer.trading_day,
                timer.slots_to_refill,
                self.config.cooldown_threshold,
            )
            .await?;

        if !self.store.finish_timer(timer_id, TimerStatus::Completed).await? {
            debug!(%timer_id, "timer resolved by a concurrent path");
            return Ok(());
        }
        info!(
            %timer_id,
            user_id = timer.user_id,
            trading_day = %timer.trading_day,
            available = state.slots_available,
            "cooldown completed"
        );

        if let Some(handle) = &timer.external_handle {
            if let Err(e) = self.scheduler.cancel(handle) {
                warn!(%timer_id, error = %e, "de-registration failed, leaving stale registration");
            }
        }

        if state.slots_available < self.config.cooldown_threshold {
            if let Err(e) = self.arm(timer.user_id, timer.trading_day).await {
                warn!(
                    user_id = timer.user_id,
                    trading_day = %timer.trading_day,
                    error = %e,
                    "re-arm after completion failed"
                );
            }
        }
        Ok(())
    }

    /// Cancel the ACTIVE timer for a key, if any. Safe to call at any time:
    /// an already fired or already cancelled timer is a no-op.
    pub async fn cancel(&self, user_id: i64, trading_day: NaiveDate) -> Result<(), CoreError> {
        let Some(timer) = self.store.active_timer(user_id, trading_day).await? else {
            return Ok(());
        };
        if let Some(handle) = &timer.external_handle {
            if let Err(e) = self.scheduler.cancel(handle) {
                warn!(timer_id = %timer.id, error = %e, "de-registration failed during cancel");
            }
        }
        if self.store.finish_timer(timer.id, TimerStatus::Cancelled).await? {
            info!(timer_id = %timer.id, user_id, %trading_day, "cooldown cancelled");
        }
        Ok(())
    }

    /// Consume scheduler deliveries and drive `complete`.
    pub fn spawn_driver(
        &self,
        mut rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> tokio::task::JoinHandle<()> {
        let timers = self.clone();
        tokio::spawn(async move {
            while let Some(timer_id) = rx.recv().await {
                if let Err(e) = timers.complete(timer_id).await {
                    error!(%timer_id, error = %e, "cooldown completion failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scheduler double that records registrations instead of sleeping.
    #[derive(Default)]
    struct RecordingScheduler {
        fail_next: AtomicBool,
        registered: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl OneShotScheduler for RecordingScheduler {
        fn register_one_shot(&self, _delay: Duration, timer_id: Uuid) -> Result<String, CoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CoreError::SchedulerUnavailable {
                    reason: "injected failure".to_string(),
                });
            }
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(format!("reg-{timer_id}"))
        }

        fn cancel(&self, _handle: &str) -> Result<(), CoreError> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    fn fixture() -> (CooldownTimers, SlotTracker, Arc<RecordingScheduler>) {
        let store = Arc::new(GameStore::open_in_memory().unwrap());
        let config = GameConfig::default();
        let slots = SlotTracker::new(store.clone(), config.clone());
        let scheduler = Arc::new(RecordingScheduler::default());
        let timers = CooldownTimers::new(store, scheduler.clone(), slots.clone(), config);
        (timers, slots, scheduler)
    }

    #[tokio::test]
    async fn arm_registers_and_persists() {
        let (timers, slots, scheduler) = fixture();
        // available 3 -> 1: refill = threshold(2) - 1 = 1
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();

        let timer = timers.arm(1, day()).await.unwrap();
        assert_eq!(timer.status, TimerStatus::Active);
        assert_eq!(timer.slots_to_refill, 1);
        assert!(timer.external_handle.is_some());
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn arm_is_a_noop_while_active() {
        let (timers, slots, scheduler) = fixture();
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();

        let first = timers.arm(1, day()).await.unwrap();
        let second = timers.arm(1, day()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_failure_leaves_no_row() {
        let (timers, slots, scheduler) = fixture();
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();
        scheduler.fail_next.store(true, Ordering::SeqCst);

        let err = timers.arm(1, day()).await.unwrap_err();
        assert!(matches!(err, CoreError::SchedulerUnavailable { .. }));

        // The compensating delete freed the key: arming again succeeds.
        let timer = timers.arm(1, day()).await.unwrap();
        assert_eq!(timer.status, TimerStatus::Active);
    }

    #[tokio::test]
    async fn complete_refills_and_is_duplicate_safe() {
        let (timers, slots, _) = fixture();
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();
        let timer = timers.arm(1, day()).await.unwrap();

        timers.complete(timer.id).await.unwrap();
        let state = slots.state(1, day()).await.unwrap();
        assert_eq!(state.slots_available, 2);

        // Duplicate delivery: same final state.
        timers.complete(timer.id).await.unwrap();
        let after = slots.state(1, day()).await.unwrap();
        assert_eq!(after.slots_available, 2);
    }

    #[tokio::test]
    async fn complete_at_threshold_does_not_rearm() {
        let (timers, slots, scheduler) = fixture();
        // Burn all three slots: available 0, refill = 2.
        for _ in 0..3 {
            slots.consume(1, day()).await.unwrap();
        }
        let timer = timers.arm(1, day()).await.unwrap();
        assert_eq!(timer.slots_to_refill, 2);

        // Refill lands exactly at the threshold, so no re-arm.
        timers.complete(timer.id).await.unwrap();
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 1);
        assert_eq!(slots.state(1, day()).await.unwrap().slots_available, 2);
    }

    #[tokio::test]
    async fn complete_rearms_while_still_below_threshold() {
        let (timers, slots, scheduler) = fixture();
        // Arm at available 1: refill = 1.
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();
        let timer = timers.arm(1, day()).await.unwrap();
        assert_eq!(timer.slots_to_refill, 1);

        // A submission lands between arm and fire: available drops to 0, so
        // the refill of 1 still leaves the user below the threshold and a
        // fresh timer must be armed.
        slots.consume(1, day()).await.unwrap();
        timers.complete(timer.id).await.unwrap();

        let state = slots.state(1, day()).await.unwrap();
        assert_eq!(state.slots_available, 1);
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 2);
        let rearmed = timers.store.active_timer(1, day()).await.unwrap().unwrap();
        assert_ne!(rearmed.id, timer.id);
    }

    #[tokio::test]
    async fn completion_of_unknown_timer_is_absorbed() {
        let (timers, _, _) = fixture();
        timers.complete(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (timers, slots, scheduler) = fixture();
        slots.consume(1, day()).await.unwrap();
        slots.consume(1, day()).await.unwrap();
        let timer = timers.arm(1, day()).await.unwrap();

        timers.cancel(1, day()).await.unwrap();
        assert_eq!(scheduler.cancelled.load(Ordering::SeqCst), 1);

        // Second cancel: nothing ACTIVE, no-op.
        timers.cancel(1, day()).await.unwrap();
        assert_eq!(scheduler.cancelled.load(Ordering::SeqCst), 1);

        // A stale delivery for the cancelled timer is absorbed.
        let before = slots.state(1, day()).await.unwrap();
        timers.complete(timer.id).await.unwrap();
        let after = slots.state(1, day()).await.unwrap();
        assert_eq!(before.slots_available, after.slots_available);
    }
}
