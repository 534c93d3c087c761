//! Session/window authority.
//!
//! The game accepts forecasts only while a trading session is open, and
//! grades them per time-window. The authority is a trait so request handlers
//! and tests can substitute their own calendars; the shipped implementation
//! is a fixed daily window schedule with weekends closed.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};

/// Identifier of a grading window within a trading day (e.g. "am").
pub type WindowId = String;

pub trait SessionAuthority: Send + Sync {
    /// Whether the session accepts new forecasts on this trading day.
    fn is_open(&self, trading_day: NaiveDate) -> bool;

    /// The window currently accepting forecasts, if any.
    fn current_window(&self, now: DateTime<Utc>) -> Option<WindowId>;

    /// When a window of the given day stops accepting forecasts and becomes
    /// eligible for settlement. `None` for unknown window ids.
    fn window_close(&self, trading_day: NaiveDate, window: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone)]
struct SessionWindow {
    id: WindowId,
    open: NaiveTime,
    close: NaiveTime,
}

/// Fixed schedule of N windows per trading day, all times UTC.
#[derive(Debug, Clone)]
pub struct FixedWindowSchedule {
    windows: Vec<SessionWindow>,
}

impl Default for FixedWindowSchedule {
    fn default() -> Self {
        // Two windows: a morning and an afternoon session.
        Self::new(vec![
            ("am", NaiveTime::from_hms_opt(9, 0, 0).unwrap(), NaiveTime::from_hms_opt(12, 30, 0).unwrap()),
            ("pm", NaiveTime::from_hms_opt(12, 30, 0).unwrap(), NaiveTime::from_hms_opt(16, 0, 0).unwrap()),
        ])
    }
}

impl FixedWindowSchedule {
    pub fn new(windows: Vec<(&str, NaiveTime, NaiveTime)>) -> Self {
        Self {
            windows: windows
                .into_iter()
                .map(|(id, open, close)| SessionWindow {
                    id: id.to_string(),
                    open,
                    close,
                })
                .collect(),
        }
    }
}

impl SessionAuthority for FixedWindowSchedule {
    fn is_open(&self, trading_day: NaiveDate) -> bool {
        !matches!(trading_day.weekday(), Weekday::Sat | Weekday::Sun)
    }

    fn current_window(&self, now: DateTime<Utc>) -> Option<WindowId> {
        if !self.is_open(now.date_naive()) {
            return None;
        }
        let t = now.time();
        self.windows
            .iter()
            .find(|w| w.open <= t && t < w.close)
            .map(|w| w.id.clone())
    }

    fn window_close(&self, trading_day: NaiveDate, window: &str) -> Option<DateTime<Utc>> {
        let w = self.windows.iter().find(|w| w.id == window)?;
        Some(trading_day.and_time(w.close).and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    #[test]
    fn weekends_are_closed() {
        let schedule = FixedWindowSchedule::default();
        let saturday = NaiveDate::from_ymd_opt(2026, 1, 3).unwrap();
        assert!(!schedule.is_open(saturday));
        assert!(schedule.is_open(monday()));
    }

    #[test]
    fn current_window_follows_the_clock() {
        let schedule = FixedWindowSchedule::default();
        let at = |h, m| monday().and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()).and_utc();

        assert_eq!(schedule.current_window(at(8, 0)), None);
        assert_eq!(schedule.current_window(at(10, 0)), Some("am".to_string()));
        assert_eq!(schedule.current_window(at(13, 0)), Some("pm".to_string()));
        assert_eq!(schedule.current_window(at(16, 30)), None);
    }

    #[test]
    fn window_close_is_the_settlement_cutoff() {
        let schedule = FixedWindowSchedule::default();
        let close = schedule.window_close(monday(), "am").unwrap();
        assert_eq!(close.time(), NaiveTime::from_hms_opt(12, 30, 0).unwrap());
        assert!(schedule.window_close(monday(), "overnight").is_none());
    }
}
