//! End-to-end game flow over a file-backed database.
//!
//! Drives a full trading day through the library: submissions down to slot
//! exhaustion, a cooldown cycle restoring capacity, settlement of the due
//! window, and an idempotent settlement rerun — asserting slot counts,
//! forecast statuses, and the ledger chain at each step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use streetcall_core::config::GameConfig;
use streetcall_core::cooldown::{CooldownTimers, TokioOneShotScheduler};
use streetcall_core::error::CoreError;
use streetcall_core::forecast::{Direction, ForecastChoice, ForecastStatus, Forecasts, SubmitForecast};
use streetcall_core::ledger::Ledger;
use streetcall_core::price::{PriceSource, SettlementQuote};
use streetcall_core::session::SessionAuthority;
use streetcall_core::settlement::SettlementEngine;
use streetcall_core::slots::SlotTracker;
use streetcall_core::store::GameStore;

const USER: i64 = 42;

fn day() -> NaiveDate {
    // A Monday.
    NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    day()
        .and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
        .and_utc()
}

/// One morning window, closing at 12:30.
struct MorningSession;

impl SessionAuthority for MorningSession {
    fn is_open(&self, trading_day: NaiveDate) -> bool {
        trading_day == day()
    }
    fn current_window(&self, now: DateTime<Utc>) -> Option<String> {
        (now < at(12, 30)).then(|| "am".to_string())
    }
    fn window_close(&self, _trading_day: NaiveDate, window: &str) -> Option<DateTime<Utc>> {
        (window == "am").then(|| at(12, 30))
    }
}

/// Symbol -> (snapshot price, settlement price). A symbol with no snapshot
/// entry simulates a feed outage at submission time.
struct TestFeed {
    snapshots: Mutex<HashMap<String, f64>>,
    settlements: Mutex<HashMap<String, f64>>,
}

impl TestFeed {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(HashMap::new()),
            settlements: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl PriceSource for TestFeed {
    async fn snapshot(&self, symbol: &str) -> Result<Option<f64>, CoreError> {
        Ok(self.snapshots.lock().get(symbol).copied())
    }
    async fn settlement_quote(
        &self,
        symbol: &str,
        _trading_day: NaiveDate,
        _window: &str,
    ) -> Result<SettlementQuote, CoreError> {
        self.settlements
            .lock()
            .get(symbol)
            .map(|price| SettlementQuote {
                price: *price,
                volume: 50_000.0,
                prev_close: None,
            })
            .ok_or_else(|| CoreError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: "no settlement quote".to_string(),
            })
    }
}

struct Game {
    store: Arc<GameStore>,
    slots: SlotTracker,
    ledger: Ledger,
    cooldown: CooldownTimers,
    forecasts: Forecasts,
    engine: SettlementEngine,
    _dir: tempfile::TempDir,
}

async fn build_game() -> (Game, tokio::sync::mpsc::UnboundedReceiver<uuid::Uuid>) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("game.db");

    let config = GameConfig {
        database_path: db_path.to_string_lossy().into_owned(),
        slots_per_day: 3,
        cooldown_threshold: 2,
        cooldown_delay_secs: 0, // fire immediately once the driver runs
        submission_fee: 10,
        points_per_correct: 100,
        ..GameConfig::default()
    };

    let store = Arc::new(GameStore::open(&config.database_path).unwrap());
    let slots = SlotTracker::new(store.clone(), config.clone());
    let ledger = Ledger::new(store.clone());
    let (scheduler, rx) = TokioOneShotScheduler::new();
    let cooldown = CooldownTimers::new(
        store.clone(),
        Arc::new(scheduler),
        slots.clone(),
        config.clone(),
    );
    let session = Arc::new(MorningSession);
    let feed = TestFeed::new();
    let forecasts = Forecasts::new(
        store.clone(),
        slots.clone(),
        ledger.clone(),
        cooldown.clone(),
        session.clone(),
        feed.clone(),
        config.clone(),
    );
    let engine = SettlementEngine::new(
        store.clone(),
        ledger.clone(),
        session,
        feed.clone(),
        config,
    );

    for symbol in ["ACME", "GLOBEX", "INITECH", "HOOLI"] {
        store.upsert_symbol(symbol, symbol, true).await.unwrap();
    }
    feed.snapshots.lock().insert("ACME".to_string(), 100.0);
    feed.snapshots.lock().insert("GLOBEX".to_string(), 50.0);
    feed.snapshots.lock().insert("INITECH".to_string(), 95.0);
    // HOOLI: no snapshot, feed is down for it.
    feed.settlements.lock().insert("ACME".to_string(), 105.0);
    feed.settlements.lock().insert("GLOBEX".to_string(), 55.0);
    feed.settlements.lock().insert("INITECH".to_string(), 100.0);
    feed.settlements.lock().insert("HOOLI".to_string(), 10.0);

    // The receiver is handed back unconsumed so the test decides when
    // cooldown completions start flowing.
    let game = Game {
        store,
        slots,
        ledger,
        cooldown,
        forecasts,
        engine,
        _dir: dir,
    };
    (game, rx)
}

fn submit(symbol: &str, choice: ForecastChoice) -> SubmitForecast {
    SubmitForecast {
        user_id: USER,
        symbol: symbol.to_string(),
        choice,
    }
}

async fn wait_for_refill(game: &Game, target: i64) {
    for _ in 0..200 {
        let state = game.slots.state(USER, day()).await.unwrap();
        let idle = game.store.active_timer(USER, day()).await.unwrap().is_none();
        if state.slots_available >= target && idle {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("cooldown never restored {target} slots");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_day_flow() {
    let (game, rx) = build_game().await;
    let morning = at(10, 0);

    // --- Phase 1: submit to exhaustion (cooldown driver not running yet).
    game.forecasts
        .submit(submit("ACME", ForecastChoice::Direction(Direction::Up)), morning)
        .await
        .unwrap();
    assert!(game.store.active_timer(USER, day()).await.unwrap().is_none());

    game.forecasts
        .submit(submit("GLOBEX", ForecastChoice::Direction(Direction::Down)), morning)
        .await
        .unwrap();
    // Crossing below the threshold armed a timer.
    assert!(game.store.active_timer(USER, day()).await.unwrap().is_some());

    game.forecasts
        .submit(
            submit(
                "INITECH",
                ForecastChoice::Range {
                    low: 90.0,
                    high: 110.0,
                },
            ),
            morning,
        )
        .await
        .unwrap();

    let err = game
        .forecasts
        .submit(submit("HOOLI", ForecastChoice::Direction(Direction::Up)), morning)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SlotsExhausted { .. }));

    let state = game.slots.state(USER, day()).await.unwrap();
    assert_eq!(state.slots_available, 0);
    assert_eq!(state.slots_made, 3);
    // Three fees paid so far.
    assert_eq!(game.ledger.balance(USER).await.unwrap(), -30);

    // --- Phase 2: let the cooldown cycle run; it refills one slot per
    // completion and re-arms until the threshold is reached.
    let driver = game.cooldown.spawn_driver(rx);
    wait_for_refill(&game, 2).await;

    // --- Phase 3: capacity is back, the HOOLI forecast goes through, with
    // no snapshot price because its feed is down.
    let hooli = game
        .forecasts
        .submit(submit("HOOLI", ForecastChoice::Direction(Direction::Up)), morning)
        .await
        .unwrap();
    assert_eq!(hooli.snapshot_price, None);
    assert_eq!(game.ledger.balance(USER).await.unwrap(), -40);

    // --- Phase 4: settle after the window closes.
    let report = game.engine.settle_due(at(17, 0)).await.unwrap();
    assert_eq!(report.failures.len(), 0);
    assert_eq!(report.totals.correct, 2); // ACME up 100->105, INITECH in range
    assert_eq!(report.totals.incorrect, 1); // GLOBEX predicted down, went up
    assert_eq!(report.totals.voided, 1); // HOOLI had no snapshot

    let statuses: HashMap<String, ForecastStatus> = game
        .forecasts
        .list_for_user(USER, day())
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.symbol.clone(), f.status))
        .collect();
    assert_eq!(statuses["ACME"], ForecastStatus::Correct);
    assert_eq!(statuses["GLOBEX"], ForecastStatus::Incorrect);
    assert_eq!(statuses["INITECH"], ForecastStatus::Correct);
    assert_eq!(statuses["HOOLI"], ForecastStatus::Void);

    // 4 fees (-40), 2 awards (+200), 1 void refund (+10).
    assert_eq!(game.ledger.balance(USER).await.unwrap(), 170);
    game.ledger.verify_user_chain(USER).await.unwrap();

    // --- Phase 5: a rerun is a no-op.
    let rerun = game.engine.settle_due(at(17, 0)).await.unwrap();
    assert_eq!(rerun.windows.len(), 0);
    assert_eq!(rerun.failures.len(), 0);
    assert_eq!(game.ledger.balance(USER).await.unwrap(), 170);
    assert_eq!(game.ledger.history(USER, 100).await.unwrap().len(), 7);
    game.ledger.verify_user_chain(USER).await.unwrap();

    driver.abort();
}
