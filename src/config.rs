//! Game configuration.
//!
//! Everything tunable lives in one struct injected into each component at
//! construction. No process-wide mutable state: `from_env()` builds a value
//! once at startup and the services clone it.

use std::env;

use crate::settlement::FlatPolicy;

#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Path to the SQLite database file.
    pub database_path: String,

    /// Daily slot ceiling for a fresh `(user, trading_day)` state.
    pub slots_per_day: i64,

    /// Low-water mark: a cooldown timer is armed when a consumption leaves
    /// `slots_available` strictly below this, and `complete` refills back up
    /// to it (never past it).
    pub cooldown_threshold: i64,

    /// Delay before the external scheduler fires the cooldown callback.
    pub cooldown_delay_secs: u64,

    /// Points debited from the ledger on every submission.
    pub submission_fee: i64,

    /// Points credited for a CORRECT forecast.
    pub points_per_correct: i64,

    /// How a FLAT settlement (price unchanged vs snapshot) grades a batch.
    pub flat_policy: FlatPolicy,

    /// Settlement quotes moving more than this fraction against the prior
    /// close are treated as bad data and the batch is VOID-graded.
    pub max_plausible_move_pct: f64,

    /// Base URL of the quote endpoint used by `HttpPriceSource`.
    pub price_base_url: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            database_path: "streetcall.db".to_string(),
            slots_per_day: 3,
            cooldown_threshold: 2,
            cooldown_delay_secs: 600,
            submission_fee: 10,
            points_per_correct: 100,
            flat_policy: FlatPolicy::Void,
            max_plausible_move_pct: 0.25,
            price_base_url: "https://quotes.streetcall.app".to_string(),
        }
    }
}

impl GameConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        cfg.database_path = env::var("STREETCALL_DB").unwrap_or(cfg.database_path);

        cfg.slots_per_day = env::var("STREETCALL_SLOTS_PER_DAY")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.slots_per_day);

        cfg.cooldown_threshold = env::var("STREETCALL_COOLDOWN_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.cooldown_threshold);

        cfg.cooldown_delay_secs = env::var("STREETCALL_COOLDOWN_DELAY_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.cooldown_delay_secs);

        cfg.submission_fee = env::var("STREETCALL_SUBMISSION_FEE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(cfg.submission_fee);

        cfg.points_per_correct = env::var("STREETCALL_POINTS_PER_CORRECT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(cfg.points_per_correct);

        cfg.flat_policy = env::var("STREETCALL_FLAT_POLICY")
            .ok()
            .and_then(|v| FlatPolicy::parse(&v).ok())
            .unwrap_or(cfg.flat_policy);

        cfg.max_plausible_move_pct = env::var("STREETCALL_MAX_PLAUSIBLE_MOVE_PCT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(cfg.max_plausible_move_pct);

        cfg.price_base_url = env::var("STREETCALL_PRICE_BASE_URL").unwrap_or(cfg.price_base_url);

        cfg
    }
}
