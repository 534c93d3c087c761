//! Price source boundary.
//!
//! Two distinct reads feed the game: a best-effort snapshot at submission
//! time (unavailability must not block a submission) and an authoritative
//! settlement quote per window (unavailability is a retryable condition,
//! never a grading outcome). `SettlementQuote` carries enough context to
//! reject implausible data before it grades anyone.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;

/// Observed settlement data for one (symbol, day, window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementQuote {
    pub price: f64,
    pub volume: f64,
    /// Prior session close, when the upstream knows it. Used for the
    /// implausible-move sanity check.
    pub prev_close: Option<f64>,
}

impl SettlementQuote {
    /// Returns why this quote must not be settled against, or `None` if it
    /// is usable. A bad quote VOID-grades the whole batch rather than
    /// settling forecasts against bad data.
    pub fn validity_error(&self, max_plausible_move_pct: f64) -> Option<String> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Some(format!("non-positive settlement price {}", self.price));
        }
        if !self.volume.is_finite() || self.volume <= 0.0 {
            return Some(format!("zero or negative volume {}", self.volume));
        }
        if let Some(prev) = self.prev_close {
            if prev > 0.0 {
                let move_pct = (self.price / prev - 1.0).abs();
                if move_pct > max_plausible_move_pct {
                    return Some(format!(
                        "implausible move {:.1}% vs prev close {} (limit {:.1}%)",
                        move_pct * 100.0,
                        prev,
                        max_plausible_move_pct * 100.0
                    ));
                }
            }
        }
        None
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current price of a symbol, captured onto a forecast at submission.
    /// `Ok(None)` means no price is known right now; the forecast still
    /// submits and later settles VOID.
    async fn snapshot(&self, symbol: &str) -> Result<Option<f64>, CoreError>;

    /// Settlement quote for a finished window. Errors with
    /// `CoreError::PriceUnavailable` when the upstream cannot answer yet.
    async fn settlement_quote(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        window: &str,
    ) -> Result<SettlementQuote, CoreError>;
}

/// Production price source against a JSON quote endpoint.
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
    volume: f64,
    prev_close: Option<f64>,
}

impl HttpPriceSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn unavailable(symbol: &str, err: impl ToString) -> CoreError {
        CoreError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn snapshot(&self, symbol: &str) -> Result<Option<f64>, CoreError> {
        let url = format!("{}/v1/price/{}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unavailable(symbol, e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(symbol, "no snapshot price for symbol");
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| Self::unavailable(symbol, e))?;
        let body: PriceResponse = resp.json().await.map_err(|e| Self::unavailable(symbol, e))?;
        Ok(Some(body.price))
    }

    async fn settlement_quote(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        window: &str,
    ) -> Result<SettlementQuote, CoreError> {
        let url = format!(
            "{}/v1/settlement/{}?day={}&window={}",
            self.base_url, symbol, trading_day, window
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unavailable(symbol, e))?
            .error_for_status()
            .map_err(|e| Self::unavailable(symbol, e))?;

        let body: QuoteResponse = resp.json().await.map_err(|e| Self::unavailable(symbol, e))?;
        Ok(SettlementQuote {
            price: body.price,
            volume: body.volume,
            prev_close: body.prev_close,
        })
    }
}
