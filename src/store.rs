//! SQLite persistence for the game core.
//!
//! One `GameStore` owns the connection; every component mutates state only
//! through it. The store is where the concurrency-critical SQL lives:
//!
//! - slot consumption is a single conditional `UPDATE ... WHERE
//!   slots_available > 0`, so the counter can never go negative under races;
//! - the "at most one ACTIVE cooldown timer per (user, day)" invariant is a
//!   partial unique index, not application locking;
//! - slot decrement and forecast insert commit in one transaction;
//! - ledger appends read the latest `balance_after` and insert inside one
//!   transaction, serialized by the connection mutex (last-writer-appends).

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cooldown::{CooldownTimer, TimerStatus};
use crate::error::CoreError;
use crate::forecast::{Direction, Forecast, ForecastChoice, ForecastKind, ForecastStatus};
use crate::ledger::LedgerEntry;
use crate::settlement::WindowKey;
use crate::slots::SlotState;

#[derive(Clone)]
pub struct GameStore {
    conn: Arc<Mutex<Connection>>,
}

impl GameStore {
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        install_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Slot states
    // ------------------------------------------------------------------

    /// Read the daily slot state, lazily creating it at the given ceiling.
    pub async fn slot_state(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        default_max: i64,
    ) -> Result<SlotState, CoreError> {
        let conn = self.conn.lock().await;
        ensure_slot_row(&conn, user_id, trading_day, default_max)?;
        read_slot_state(&conn, user_id, trading_day)
    }

    /// Atomic conditional decrement. Fails with `SlotsExhausted` when
    /// `slots_available` is already zero; never drives it negative.
    pub async fn consume_slot(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        default_max: i64,
    ) -> Result<SlotState, CoreError> {
        let conn = self.conn.lock().await;
        ensure_slot_row(&conn, user_id, trading_day, default_max)?;
        let changed = conn.execute(
            "UPDATE slot_states
             SET slots_available = slots_available - 1,
                 slots_made = slots_made + 1,
                 updated_at = ?1
             WHERE user_id = ?2 AND trading_day = ?3 AND slots_available > 0",
            params![Utc::now().to_rfc3339(), user_id, trading_day.to_string()],
        )?;
        if changed == 0 {
            return Err(CoreError::SlotsExhausted {
                user_id,
                trading_day,
            });
        }
        read_slot_state(&conn, user_id, trading_day)
    }

    /// Additive grant, saturating at `slots_max`.
    pub async fn refund_slots(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
    ) -> Result<SlotState, CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE slot_states
             SET slots_available = MIN(slots_max, slots_available + ?1),
                 updated_at = ?2
             WHERE user_id = ?3 AND trading_day = ?4",
            params![n, Utc::now().to_rfc3339(), user_id, trading_day.to_string()],
        )?;
        read_slot_state(&conn, user_id, trading_day)
    }

    /// Additive grant toward a target level: never raises `slots_available`
    /// above `min(cap, slots_max)`, and never lowers it. A state already at
    /// or above `cap` is untouched.
    pub async fn replenish_slots(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
        cap: i64,
    ) -> Result<SlotState, CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE slot_states
             SET slots_available = MAX(slots_available,
                                       MIN(MIN(?1, slots_max), slots_available + ?2)),
                 updated_at = ?3
             WHERE user_id = ?4 AND trading_day = ?5",
            params![cap, n, Utc::now().to_rfc3339(), user_id, trading_day.to_string()],
        )?;
        read_slot_state(&conn, user_id, trading_day)
    }

    /// Unlock event: grows the ceiling and grants the same amount.
    pub async fn raise_ceiling(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
        n: i64,
        default_max: i64,
    ) -> Result<SlotState, CoreError> {
        let conn = self.conn.lock().await;
        ensure_slot_row(&conn, user_id, trading_day, default_max)?;
        conn.execute(
            "UPDATE slot_states
             SET slots_max = slots_max + ?1,
                 slots_available = slots_available + ?1,
                 updated_at = ?2
             WHERE user_id = ?3 AND trading_day = ?4",
            params![n, Utc::now().to_rfc3339(), user_id, trading_day.to_string()],
        )?;
        read_slot_state(&conn, user_id, trading_day)
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Append a ledger entry, deduplicating on `idempotency_key`. Returns
    /// the entry and whether it was freshly inserted (`false` = key replay,
    /// the existing entry is returned untouched).
    pub async fn append_ledger(
        &self,
        user_id: i64,
        delta: i64,
        reason: &str,
        idempotency_key: &str,
        occurred_on: NaiveDate,
    ) -> Result<(LedgerEntry, bool), CoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT id, user_id, delta, balance_after, reason, idempotency_key,
                        occurred_on, created_at
                 FROM ledger_entries WHERE idempotency_key = ?1",
                params![idempotency_key],
                map_ledger_entry,
            )
            .optional()?;
        if let Some(entry) = existing {
            return Ok((entry, false));
        }

        let prev: i64 = tx
            .query_row(
                "SELECT balance_after FROM ledger_entries
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO ledger_entries
                 (user_id, delta, balance_after, reason, idempotency_key, occurred_on, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                delta,
                prev + delta,
                reason,
                idempotency_key,
                occurred_on.to_string(),
                created_at.to_rfc3339()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok((
            LedgerEntry {
                id,
                user_id,
                delta,
                balance_after: prev + delta,
                reason: reason.to_string(),
                idempotency_key: idempotency_key.to_string(),
                occurred_on,
                created_at,
            },
            true,
        ))
    }

    pub async fn latest_balance(&self, user_id: i64) -> Result<i64, CoreError> {
        let conn = self.conn.lock().await;
        let balance = conn
            .query_row(
                "SELECT balance_after FROM ledger_entries
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(balance)
    }

    /// Newest-first history page.
    pub async fn ledger_history(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, delta, balance_after, reason, idempotency_key,
                    occurred_on, created_at
             FROM ledger_entries WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit as i64], map_ledger_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// All entries for a user in insertion order, for chain verification.
    pub async fn ledger_chain(&self, user_id: i64) -> Result<Vec<LedgerEntry>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, delta, balance_after, reason, idempotency_key,
                    occurred_on, created_at
             FROM ledger_entries WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![user_id], map_ledger_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Cooldown timers
    // ------------------------------------------------------------------

    /// Insert an ACTIVE timer. Returns `false` when the partial unique index
    /// rejects it because another ACTIVE timer already holds the key.
    pub async fn insert_timer(&self, timer: &CooldownTimer) -> Result<bool, CoreError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO cooldown_timers
                 (id, user_id, trading_day, scheduled_at, status, slots_to_refill,
                  external_handle, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
            params![
                timer.id.to_string(),
                timer.user_id,
                timer.trading_day.to_string(),
                timer.scheduled_at.to_rfc3339(),
                timer.status.as_str(),
                timer.slots_to_refill,
                timer.external_handle,
                timer.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_timer_handle(&self, id: Uuid, handle: &str) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE cooldown_timers SET external_handle = ?1 WHERE id = ?2",
            params![handle, id.to_string()],
        )?;
        Ok(())
    }

    /// Compensating deletion after a failed scheduler registration.
    pub async fn delete_timer(&self, id: Uuid) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM cooldown_timers WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub async fn get_timer(&self, id: Uuid) -> Result<Option<CooldownTimer>, CoreError> {
        let conn = self.conn.lock().await;
        let timer = conn
            .query_row(
                "SELECT id, user_id, trading_day, scheduled_at, status, slots_to_refill,
                        external_handle, created_at, resolved_at
                 FROM cooldown_timers WHERE id = ?1",
                params![id.to_string()],
                map_timer,
            )
            .optional()?;
        Ok(timer)
    }

    pub async fn active_timer(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<Option<CooldownTimer>, CoreError> {
        let conn = self.conn.lock().await;
        let timer = conn
            .query_row(
                "SELECT id, user_id, trading_day, scheduled_at, status, slots_to_refill,
                        external_handle, created_at, resolved_at
                 FROM cooldown_timers
                 WHERE user_id = ?1 AND trading_day = ?2 AND status = 'ACTIVE'",
                params![user_id, trading_day.to_string()],
                map_timer,
            )
            .optional()?;
        Ok(timer)
    }

    /// Move an ACTIVE timer to a terminal status. Returns `false` when the
    /// timer was not ACTIVE anymore (duplicate delivery, lost race).
    pub async fn finish_timer(&self, id: Uuid, status: TimerStatus) -> Result<bool, CoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE cooldown_timers SET status = ?1, resolved_at = ?2
             WHERE id = ?3 AND status = 'ACTIVE'",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Forecasts
    // ------------------------------------------------------------------

    /// One atomic unit of work: conditional slot decrement plus forecast
    /// insert. Any failure rolls both back, leaving neither a consumed slot
    /// nor an orphan forecast. Returns the post-consumption slot state.
    pub async fn insert_forecast_consuming_slot(
        &self,
        forecast: &Forecast,
        default_max: i64,
    ) -> Result<SlotState, CoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        ensure_slot_row(&tx, forecast.user_id, forecast.trading_day, default_max)?;
        let changed = tx.execute(
            "UPDATE slot_states
             SET slots_available = slots_available - 1,
                 slots_made = slots_made + 1,
                 updated_at = ?1
             WHERE user_id = ?2 AND trading_day = ?3 AND slots_available > 0",
            params![
                Utc::now().to_rfc3339(),
                forecast.user_id,
                forecast.trading_day.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::SlotsExhausted {
                user_id: forecast.user_id,
                trading_day: forecast.trading_day,
            });
        }

        let inserted = tx.execute(
            "INSERT INTO forecasts
                 (id, user_id, trading_day, window_id, symbol, kind, direction,
                  range_low, range_high, status, submitted_at, locked_at,
                  snapshot_price, settlement_price, points_earned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, NULL, 0)",
            params![
                forecast.id.to_string(),
                forecast.user_id,
                forecast.trading_day.to_string(),
                forecast.window_id,
                forecast.symbol,
                forecast.kind.as_str(),
                forecast.direction.map(|d| d.as_str()),
                forecast.range_low,
                forecast.range_high,
                forecast.status.as_str(),
                forecast.submitted_at.to_rfc3339(),
                forecast.snapshot_price,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(CoreError::DuplicateForecast {
                    user_id: forecast.user_id,
                    trading_day: forecast.trading_day,
                    detail: format!(
                        "symbol {} already forecast in window {}",
                        forecast.symbol, forecast.window_id
                    ),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let state = read_slot_state(&tx, forecast.user_id, forecast.trading_day)?;
        tx.commit()?;
        Ok(state)
    }

    pub async fn get_forecast(&self, id: Uuid) -> Result<Option<Forecast>, CoreError> {
        let conn = self.conn.lock().await;
        let forecast = conn
            .query_row(
                &format!("{FORECAST_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                map_forecast,
            )
            .optional()?;
        Ok(forecast)
    }

    pub async fn list_forecasts(
        &self,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<Vec<Forecast>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{FORECAST_SELECT} WHERE user_id = ?1 AND trading_day = ?2 ORDER BY submitted_at ASC"
        ))?;
        let forecasts = stmt
            .query_map(params![user_id, trading_day.to_string()], map_forecast)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(forecasts)
    }

    /// Replace the choice while still PENDING and unlocked. The kind never
    /// changes. Returns `false` when the guard rejected the edit.
    pub async fn update_forecast_choice(
        &self,
        id: Uuid,
        choice: &ForecastChoice,
    ) -> Result<bool, CoreError> {
        let conn = self.conn.lock().await;
        let (direction, range_low, range_high) = match choice {
            ForecastChoice::Direction(d) => (Some(d.as_str()), None, None),
            ForecastChoice::Range { low, high } => (None, Some(*low), Some(*high)),
        };
        let changed = conn.execute(
            "UPDATE forecasts SET direction = ?1, range_low = ?2, range_high = ?3
             WHERE id = ?4 AND status = 'PENDING' AND locked_at IS NULL",
            params![direction, range_low, range_high, id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// PENDING + unlocked -> CANCELLED, giving the slot back in the same
    /// transaction so a crash cannot strand a cancelled forecast with a
    /// consumed slot. Returns `false` when the guard rejected the transition.
    pub async fn cancel_forecast_refunding_slot(
        &self,
        id: Uuid,
        user_id: i64,
        trading_day: NaiveDate,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE forecasts SET status = 'CANCELLED'
             WHERE id = ?1 AND status = 'PENDING' AND locked_at IS NULL",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE slot_states
             SET slots_available = MIN(slots_max, slots_available + 1),
                 updated_at = ?1
             WHERE user_id = ?2 AND trading_day = ?3",
            params![Utc::now().to_rfc3339(), user_id, trading_day.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Compensating deletion when a step after the submit transaction fails.
    pub async fn delete_forecast(&self, id: Uuid) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM forecasts WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Freeze late edits: set `locked_at` on every PENDING, unlocked
    /// forecast of the window. Returns how many were locked.
    pub async fn lock_window(
        &self,
        trading_day: NaiveDate,
        window: &str,
    ) -> Result<usize, CoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE forecasts SET locked_at = ?1
             WHERE trading_day = ?2 AND window_id = ?3
               AND status = 'PENDING' AND locked_at IS NULL",
            params![Utc::now().to_rfc3339(), trading_day.to_string(), window],
        )?;
        Ok(changed)
    }

    /// Distinct (symbol, day, window) keys that still hold PENDING forecasts.
    pub async fn due_window_keys(&self) -> Result<Vec<WindowKey>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT symbol, trading_day, window_id FROM forecasts
             WHERE status = 'PENDING' ORDER BY trading_day, window_id, symbol",
        )?;
        let keys = stmt
            .query_map([], |row| {
                let symbol: String = row.get(0)?;
                let day: String = row.get(1)?;
                let window_id: String = row.get(2)?;
                Ok((symbol, day, window_id))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        keys.into_iter()
            .map(|(symbol, day, window_id)| {
                Ok(WindowKey {
                    symbol,
                    trading_day: parse_day(&day)?,
                    window_id,
                })
            })
            .collect()
    }

    pub async fn pending_for_window(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        window: &str,
    ) -> Result<Vec<Forecast>, CoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{FORECAST_SELECT}
             WHERE symbol = ?1 AND trading_day = ?2 AND window_id = ?3 AND status = 'PENDING'
             ORDER BY submitted_at ASC"
        ))?;
        let forecasts = stmt
            .query_map(
                params![symbol, trading_day.to_string(), window],
                map_forecast,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(forecasts)
    }

    /// Grade a PENDING forecast. The status guard makes grading exactly-once:
    /// a rerun sees zero affected rows and returns `false`.
    pub async fn grade_forecast(
        &self,
        id: Uuid,
        status: ForecastStatus,
        settlement_price: Option<f64>,
        points_earned: i64,
    ) -> Result<bool, CoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE forecasts SET status = ?1, settlement_price = ?2, points_earned = ?3
             WHERE id = ?4 AND status = 'PENDING'",
            params![
                status.as_str(),
                settlement_price,
                points_earned,
                id.to_string()
            ],
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    pub async fn upsert_symbol(
        &self,
        symbol: &str,
        name: &str,
        active: bool,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO symbols (symbol, name, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![symbol, name, active as i64],
        )?;
        Ok(())
    }

    pub async fn set_symbol_active(&self, symbol: &str, active: bool) -> Result<(), CoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE symbols SET active = ?1 WHERE symbol = ?2",
            params![active as i64, symbol],
        )?;
        Ok(())
    }

    pub async fn symbol_is_active(&self, symbol: &str) -> Result<bool, CoreError> {
        let conn = self.conn.lock().await;
        let active: Option<i64> = conn
            .query_row(
                "SELECT active FROM symbols WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active == Some(1))
    }
}

const FORECAST_SELECT: &str = "SELECT id, user_id, trading_day, window_id, symbol, kind, direction,
        range_low, range_high, status, submitted_at, locked_at,
        snapshot_price, settlement_price, points_earned
 FROM forecasts";

fn install_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            delta INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reason TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            occurred_on TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS slot_states (
            user_id INTEGER NOT NULL,
            trading_day TEXT NOT NULL,
            slots_made INTEGER NOT NULL DEFAULT 0,
            slots_available INTEGER NOT NULL,
            slots_max INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, trading_day),
            CHECK (slots_available >= 0 AND slots_available <= slots_max)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cooldown_timers (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            trading_day TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            status TEXT NOT NULL,
            slots_to_refill INTEGER NOT NULL,
            external_handle TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        )",
        [],
    )?;
    // The at-most-one-ACTIVE invariant, enforced by the database.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_timers_one_active
         ON cooldown_timers(user_id, trading_day) WHERE status = 'ACTIVE'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS forecasts (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            trading_day TEXT NOT NULL,
            window_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            kind TEXT NOT NULL,
            direction TEXT,
            range_low REAL,
            range_high REAL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            locked_at TEXT,
            snapshot_price REAL,
            settlement_price REAL,
            points_earned INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Duplicate guards; cancelled forecasts do not block a resubmission.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_forecasts_user_day_symbol
         ON forecasts(user_id, trading_day, symbol) WHERE status <> 'CANCELLED'",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_forecasts_user_window_symbol
         ON forecasts(user_id, trading_day, window_id, symbol) WHERE status <> 'CANCELLED'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_forecasts_pending
         ON forecasts(status, trading_day, window_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS symbols (
            symbol TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    Ok(())
}

fn ensure_slot_row(
    conn: &Connection,
    user_id: i64,
    trading_day: NaiveDate,
    default_max: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO slot_states (user_id, trading_day, slots_made, slots_available, slots_max, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3, ?4)
         ON CONFLICT(user_id, trading_day) DO NOTHING",
        params![user_id, trading_day.to_string(), default_max, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn read_slot_state(
    conn: &Connection,
    user_id: i64,
    trading_day: NaiveDate,
) -> Result<SlotState, CoreError> {
    let state = conn.query_row(
        "SELECT user_id, trading_day, slots_made, slots_available, slots_max, updated_at
         FROM slot_states WHERE user_id = ?1 AND trading_day = ?2",
        params![user_id, trading_day.to_string()],
        |row| {
            Ok(SlotState {
                user_id: row.get(0)?,
                trading_day: parse_day_col(row, 1)?,
                slots_made: row.get(2)?,
                slots_available: row.get(3)?,
                slots_max: row.get(4)?,
                updated_at: parse_ts_col(row, 5)?,
            })
        },
    )?;
    Ok(state)
}

fn map_ledger_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        delta: row.get(2)?,
        balance_after: row.get(3)?,
        reason: row.get(4)?,
        idempotency_key: row.get(5)?,
        occurred_on: parse_day_col(row, 6)?,
        created_at: parse_ts_col(row, 7)?,
    })
}

fn map_timer(row: &Row<'_>) -> rusqlite::Result<CooldownTimer> {
    let status: String = row.get(4)?;
    Ok(CooldownTimer {
        id: parse_uuid_col(row, 0)?,
        user_id: row.get(1)?,
        trading_day: parse_day_col(row, 2)?,
        scheduled_at: parse_ts_col(row, 3)?,
        status: TimerStatus::parse(&status).map_err(|e| conv_err(4, e))?,
        slots_to_refill: row.get(5)?,
        external_handle: row.get(6)?,
        created_at: parse_ts_col(row, 7)?,
        resolved_at: parse_opt_ts_col(row, 8)?,
    })
}

fn map_forecast(row: &Row<'_>) -> rusqlite::Result<Forecast> {
    let kind: String = row.get(5)?;
    let direction: Option<String> = row.get(6)?;
    let status: String = row.get(9)?;
    Ok(Forecast {
        id: parse_uuid_col(row, 0)?,
        user_id: row.get(1)?,
        trading_day: parse_day_col(row, 2)?,
        window_id: row.get(3)?,
        symbol: row.get(4)?,
        kind: ForecastKind::parse(&kind).map_err(|e| conv_err(5, e))?,
        direction: direction
            .map(|d| Direction::parse(&d).map_err(|e| conv_err(6, e)))
            .transpose()?,
        range_low: row.get(7)?,
        range_high: row.get(8)?,
        status: ForecastStatus::parse(&status).map_err(|e| conv_err(9, e))?,
        submitted_at: parse_ts_col(row, 10)?,
        locked_at: parse_opt_ts_col(row, 11)?,
        snapshot_price: row.get(12)?,
        settlement_price: row.get(13)?,
        points_earned: row.get(14)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conv_err<E: std::error::Error + Send + Sync + 'static>(idx: usize, e: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_day(s: &str) -> Result<NaiveDate, CoreError> {
    s.parse::<NaiveDate>()
        .map_err(|e| CoreError::InvariantViolation {
            detail: format!("unparseable trading day {s:?}: {e}"),
        })
}

fn parse_day_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    s.parse::<NaiveDate>().map_err(|e| conv_err(idx, e))
}

fn parse_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, e))
}

fn parse_opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conv_err(idx, e))
    })
    .transpose()
}

fn parse_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conv_err(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastStatus;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    fn sample_timer(user_id: i64) -> CooldownTimer {
        CooldownTimer {
            id: Uuid::new_v4(),
            user_id,
            trading_day: day(),
            scheduled_at: Utc::now(),
            status: TimerStatus::Active,
            slots_to_refill: 1,
            external_handle: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn slot_row_is_created_lazily() {
        let store = GameStore::open_in_memory().unwrap();
        let state = store.slot_state(1, day(), 3).await.unwrap();
        assert_eq!(state.slots_available, 3);
        assert_eq!(state.slots_max, 3);
        assert_eq!(state.slots_made, 0);
    }

    #[tokio::test]
    async fn consume_never_goes_negative() {
        let store = GameStore::open_in_memory().unwrap();
        for _ in 0..2 {
            store.consume_slot(1, day(), 2).await.unwrap();
        }
        let err = store.consume_slot(1, day(), 2).await.unwrap_err();
        assert!(matches!(err, CoreError::SlotsExhausted { .. }));
        let state = store.slot_state(1, day(), 2).await.unwrap();
        assert_eq!(state.slots_available, 0);
        assert_eq!(state.slots_made, 2);
    }

    #[tokio::test]
    async fn only_one_active_timer_per_key() {
        let store = GameStore::open_in_memory().unwrap();
        assert!(store.insert_timer(&sample_timer(7)).await.unwrap());
        // Second ACTIVE insert for the same key hits the partial index.
        assert!(!store.insert_timer(&sample_timer(7)).await.unwrap());
        // A different user is unaffected.
        assert!(store.insert_timer(&sample_timer(8)).await.unwrap());
    }

    #[tokio::test]
    async fn finished_timer_frees_the_key() {
        let store = GameStore::open_in_memory().unwrap();
        let timer = sample_timer(7);
        assert!(store.insert_timer(&timer).await.unwrap());
        assert!(store
            .finish_timer(timer.id, TimerStatus::Completed)
            .await
            .unwrap());
        // Terminal timers do not hold the ACTIVE slot.
        assert!(store.insert_timer(&sample_timer(7)).await.unwrap());
        // Finishing again is a no-op.
        assert!(!store
            .finish_timer(timer.id, TimerStatus::Cancelled)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ledger_append_dedupes_on_key() {
        let store = GameStore::open_in_memory().unwrap();
        let (first, inserted) = store
            .append_ledger(1, 50, "award", "k1", day())
            .await
            .unwrap();
        assert!(inserted);
        let (replay, inserted) = store
            .append_ledger(1, 50, "award", "k1", day())
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(replay.id, first.id);
        assert_eq!(store.latest_balance(1).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn grade_guard_fires_once() {
        let store = GameStore::open_in_memory().unwrap();
        let forecast = crate::forecast::Forecast::new_direction(
            1,
            day(),
            "am",
            "ACME",
            Direction::Up,
            Some(100.0),
            Utc::now(),
        );
        store
            .insert_forecast_consuming_slot(&forecast, 3)
            .await
            .unwrap();
        assert!(store
            .grade_forecast(forecast.id, ForecastStatus::Correct, Some(101.0), 100)
            .await
            .unwrap());
        assert!(!store
            .grade_forecast(forecast.id, ForecastStatus::Incorrect, Some(99.0), 0)
            .await
            .unwrap());
        let stored = store.get_forecast(forecast.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ForecastStatus::Correct);
        assert_eq!(stored.points_earned, 100);
    }
}
