//! Streetcall core
//!
//! Library for the daily prediction game: users spend a limited,
//! replenishable number of slots to submit directional or price-range
//! forecasts on symbols; forecasts are graded against observed settlement
//! prices; correct forecasts earn points in an append-only ledger.
//!
//! The crate is consumed by a thin request layer; no HTTP surface lives
//! here. External collaborators (price feed, session calendar, one-shot
//! scheduler) are traits with shipped production implementations.

pub mod config;
pub mod cooldown;
pub mod error;
pub mod forecast;
pub mod ledger;
pub mod price;
pub mod session;
pub mod settlement;
pub mod slots;
pub mod store;

pub use config::GameConfig;
pub use cooldown::{CooldownTimers, OneShotScheduler, TokioOneShotScheduler};
pub use error::CoreError;
pub use forecast::{Forecasts, SubmitForecast};
pub use ledger::Ledger;
pub use price::{HttpPriceSource, PriceSource};
pub use session::{FixedWindowSchedule, SessionAuthority};
pub use settlement::{SettlementEngine, SettlementReport};
pub use slots::SlotTracker;
pub use store::GameStore;
