//! Historical bars client for seeding a bar store before live ticks arrive.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::bars::Bar;
use crate::bucket::Resolution;
use crate::error::EngineError;

/// Row shape of the historical `/ohlc` endpoint; bucket time in unix seconds.
#[derive(Debug, Deserialize)]
struct OhlcRow {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

/// Thin client for the historical-data collaborator.
///
/// The endpoint returns bucket-aligned bars sorted oldest first; the store
/// handles the (documented) newest-first case on load, so no ordering work
/// happens here.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetches the lookback window of bars for one (symbol, resolution).
    pub async fn fetch_bars(
        &self,
        symbol: &str,
        resolution: Resolution,
        lookback_minutes: u32,
    ) -> Result<Vec<Bar>, EngineError> {
        let url = format!("{}/ohlc", self.base_url);
        let rows: Vec<OhlcRow> = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("resolution", &resolution.to_string()),
                ("lookback_minutes", &lookback_minutes.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let bars = rows_to_bars(rows);
        info!(symbol, count = bars.len(), "fetched historical bars");
        Ok(bars)
    }
}

fn rows_to_bars(rows: Vec<OhlcRow>) -> Vec<Bar> {
    rows.into_iter()
        .filter_map(|row| {
            // Rows with out-of-range timestamps are unrepresentable; skip them.
            let bucket_start = DateTime::<Utc>::from_timestamp(row.time, 0)?;
            Some(Bar {
                bucket_start,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: None,
            })
        })
        .collect()
}
