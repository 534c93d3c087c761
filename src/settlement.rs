//! Settlement engine: batch grading of due windows.
//!
//! Each due `(symbol, trading_day, window)` batch is settled independently;
//! one failing batch never aborts the rest, it is recorded in the report and
//! its forecasts stay PENDING for the next run. Grading is exactly-once:
//! the ledger writes use deterministic idempotency keys derived from the
//! forecast id and the status update is guarded on PENDING, so re-running a
//! settled window changes nothing.
//!
//! Every forecast is classified against its own submission-time snapshot,
//! never a shared symbol-level reference. A forecast without a snapshot is
//! graded VOID and its fee refunded; policy here deliberately favors refund
//! over guesswork.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GameConfig;
use crate::error::CoreError;
use crate::forecast::{Direction, Forecast, ForecastKind, ForecastStatus};
use crate::ledger::Ledger;
use crate::price::PriceSource;
use crate::session::SessionAuthority;
use crate::store::GameStore;

/// How a FLAT settlement (price unchanged vs snapshot) resolves a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlatPolicy {
    AllCorrect,
    AllWrong,
    Void,
}

impl FlatPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlatPolicy::AllCorrect => "ALL_CORRECT",
            FlatPolicy::AllWrong => "ALL_WRONG",
            FlatPolicy::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "ALL_CORRECT" => Ok(FlatPolicy::AllCorrect),
            "ALL_WRONG" => Ok(FlatPolicy::AllWrong),
            "VOID" => Ok(FlatPolicy::Void),
            other => Err(CoreError::InvariantViolation {
                detail: format!("unknown flat policy {other:?}"),
            }),
        }
    }
}

/// Price movement relative to a forecast's own snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Movement {
    Up,
    Down,
    Flat,
}

fn classify(settlement: f64, snapshot: f64) -> Movement {
    if settlement > snapshot {
        Movement::Up
    } else if settlement < snapshot {
        Movement::Down
    } else {
        Movement::Flat
    }
}

/// One due batch of pending forecasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowKey {
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub window_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub correct: u64,
    pub incorrect: u64,
    pub voided: u64,
    pub points_awarded: i64,
    pub points_refunded: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowReport {
    pub key: WindowKey,
    pub settlement_price: f64,
    /// Present when the batch was VOID-graded against bad quote data.
    pub void_reason: Option<String>,
    pub outcome: WindowOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowFailure {
    pub key: WindowKey,
    pub error: String,
}

/// Per-run batch report. Partial failure is a first-class value here, not
/// swallowed control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub started_at: DateTime<Utc>,
    pub windows: Vec<WindowReport>,
    pub failures: Vec<WindowFailure>,
    pub totals: WindowOutcome,
}

impl SettlementReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            windows: Vec::new(),
            failures: Vec::new(),
            totals: WindowOutcome::default(),
        }
    }

    fn record(&mut self, report: WindowReport) {
        self.totals.correct += report.outcome.correct;
        self.totals.incorrect += report.outcome.incorrect;
        self.totals.voided += report.outcome.voided;
        self.totals.points_awarded += report.outcome.points_awarded;
        self.totals.points_refunded += report.outcome.points_refunded;
        self.windows.push(report);
    }
}

#[derive(Clone)]
pub struct SettlementEngine {
    store: Arc<GameStore>,
    ledger: Ledger,
    session: Arc<dyn SessionAuthority>,
    price: Arc<dyn PriceSource>,
    config: GameConfig,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<GameStore>,
        ledger: Ledger,
        session: Arc<dyn SessionAuthority>,
        price: Arc<dyn PriceSource>,
        config: GameConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            session,
            price,
            config,
        }
    }

    /// Settle every batch whose window has closed by `now`. Failures are
    /// isolated per batch and collected into the report.
    pub async fn settle_due(&self, now: DateTime<Utc>) -> Result<SettlementReport, CoreError> {
        let keys = self.store.due_window_keys().await?;
        let mut report = SettlementReport::new(now);

        for key in keys {
            match self.session.window_close(key.trading_day, &key.window_id) {
                Some(close) if close <= now => {}
                Some(_) => continue, // still accepting, not due yet
                None => {
                    warn!(?key, "no close time for window, skipping batch");
                    report.failures.push(WindowFailure {
                        error: format!("unknown window id {:?}", key.window_id),
                        key,
                    });
                    continue;
                }
            }

            match self.settle_window(&key).await {
                Ok(window_report) => report.record(window_report),
                Err(e) => {
                    warn!(?key, error = %e, transient = e.is_transient(), "window settlement failed, left pending");
                    report.failures.push(WindowFailure {
                        error: e.to_string(),
                        key,
                    });
                }
            }
        }

        info!(
            windows = report.windows.len(),
            failures = report.failures.len(),
            correct = report.totals.correct,
            incorrect = report.totals.incorrect,
            voided = report.totals.voided,
            "settlement run finished"
        );
        Ok(report)
    }

    /// Settle one batch: lock, fetch the quote, grade every pending
    /// forecast, and drive awards/refunds through the ledger.
    pub async fn settle_window(&self, key: &WindowKey) -> Result<WindowReport, CoreError> {
        let locked = self
            .store
            .lock_window(key.trading_day, &key.window_id)
            .await?;
        debug!(?key, locked, "window locked for settlement");

        let quote = self
            .price
            .settlement_quote(&key.symbol, key.trading_day, &key.window_id)
            .await?;
        let void_reason = quote.validity_error(self.config.max_plausible_move_pct);
        if let Some(reason) = &void_reason {
            warn!(?key, reason, "settlement quote failed validity, voiding batch");
        }

        let pending = self
            .store
            .pending_for_window(&key.symbol, key.trading_day, &key.window_id)
            .await?;

        let mut outcome = WindowOutcome::default();
        for forecast in &pending {
            let status = if void_reason.is_some() {
                ForecastStatus::Void
            } else {
                self.grade(forecast, quote.price)
            };
            let points = match status {
                ForecastStatus::Correct => self.config.points_per_correct,
                _ => 0,
            };

            // Ledger before status: both are idempotent (key dedupe, PENDING
            // guard), so a crash between the two heals on the next run.
            match status {
                ForecastStatus::Correct => {
                    self.ledger
                        .credit(
                            forecast.user_id,
                            points,
                            "forecast correct",
                            &forecast.award_key(),
                            forecast.trading_day,
                        )
                        .await?;
                    outcome.correct += 1;
                    outcome.points_awarded += points;
                }
                ForecastStatus::Incorrect => {
                    outcome.incorrect += 1;
                }
                ForecastStatus::Void => {
                    if self.config.submission_fee > 0 {
                        self.ledger
                            .credit(
                                forecast.user_id,
                                self.config.submission_fee,
                                "forecast void, fee refunded",
                                &forecast.refund_key(),
                                forecast.trading_day,
                            )
                            .await?;
                        outcome.points_refunded += self.config.submission_fee;
                    }
                    outcome.voided += 1;
                }
                _ => unreachable!("grading only yields terminal grade statuses"),
            }

            self.store
                .grade_forecast(forecast.id, status, Some(quote.price), points)
                .await?;
        }

        info!(
            ?key,
            price = quote.price,
            correct = outcome.correct,
            incorrect = outcome.incorrect,
            voided = outcome.voided,
            "window settled"
        );
        Ok(WindowReport {
            key: key.clone(),
            settlement_price: quote.price,
            void_reason,
            outcome,
        })
    }

    fn grade(&self, forecast: &Forecast, settlement: f64) -> ForecastStatus {
        let Some(snapshot) = forecast.snapshot_price else {
            return ForecastStatus::Void;
        };

        match classify(settlement, snapshot) {
            Movement::Flat => match self.config.flat_policy {
                FlatPolicy::AllCorrect => ForecastStatus::Correct,
                FlatPolicy::AllWrong => ForecastStatus::Incorrect,
                FlatPolicy::Void => ForecastStatus::Void,
            },
            movement => match forecast.kind {
                ForecastKind::Direction => {
                    let predicted_up = forecast.direction == Some(Direction::Up);
                    let moved_up = movement == Movement::Up;
                    if predicted_up == moved_up {
                        ForecastStatus::Correct
                    } else {
                        ForecastStatus::Incorrect
                    }
                }
                ForecastKind::Range => {
                    let low = forecast.range_low.unwrap_or(f64::NEG_INFINITY);
                    let high = forecast.range_high.unwrap_or(f64::INFINITY);
                    if low <= settlement && settlement <= high {
                        ForecastStatus::Correct
                    } else {
                        ForecastStatus::Incorrect
                    }
                }
            },
        }
    }
}
