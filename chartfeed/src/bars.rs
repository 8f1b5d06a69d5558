//! Bar store: the authoritative in-memory OHLC history for one
//! (symbol, resolution) pair.
//!
//! Ticks merge into the history with append-or-update-last semantics: only
//! the most recent bar ever mutates, which keeps live updates O(1) regardless
//! of history length. Late ticks whose bucket precedes the last bar are
//! discarded rather than rewriting history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bucket::{Resolution, bucket_start};

/// A single timestamped price observation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub price: f64,
}

/// One OHLC aggregate per (symbol, resolution, bucket).
///
/// `bucket_start` is always the exact output of [`bucket_start`] for the
/// timestamps it covers; it is never adjusted after creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Bar {
    /// A fresh bar seeded from a single tick: open = high = low = close.
    fn from_tick(bucket_start: DateTime<Utc>, price: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: None,
        }
    }
}

/// Result of merging one tick into the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick opened a new bucket; exactly one bar was appended.
    Appended,
    /// Tick fell into the last bar's bucket; high/low/close updated in place.
    Updated,
    /// Tick's bucket precedes the last bar; history left unchanged.
    Discarded,
}

/// Ordered, deduplicated bar history for one (symbol, resolution) pair.
///
/// Exclusively owned by its chart instance; consumers only ever see
/// [`BarStore::snapshot`] copies, never a mutable reference.
#[derive(Debug, Clone)]
pub struct BarStore {
    symbol: String,
    resolution: Resolution,
    bars: Vec<Bar>,
}

impl BarStore {
    pub fn new(symbol: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution,
            bars: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Replaces the history wholesale with historically loaded bars.
    ///
    /// Bars are trusted to be bucket-aligned and deduplicated by the source.
    /// A newest-first sequence is normalized by reversing; no full sort or
    /// validation happens here.
    pub fn load(&mut self, mut bars: Vec<Bar>) {
        if bars.len() >= 2 && bars[0].bucket_start > bars[bars.len() - 1].bucket_start {
            bars.reverse();
        }
        debug!(
            symbol = %self.symbol,
            count = bars.len(),
            "loaded historical bars into store"
        );
        self.bars = bars;
    }

    /// Merges one tick into the history.
    ///
    /// The caller is responsible for symbol filtering; the store applies any
    /// tick it is handed.
    pub fn apply_tick(&mut self, tick: &Tick) -> TickOutcome {
        let bucket = bucket_start(tick.ts, self.resolution);

        if let Some(last) = self.bars.last_mut() {
            if bucket == last.bucket_start {
                last.high = last.high.max(tick.price);
                last.low = last.low.min(tick.price);
                last.close = tick.price;
                return TickOutcome::Updated;
            }
            if bucket < last.bucket_start {
                debug!(
                    symbol = %self.symbol,
                    tick_ts = %tick.ts,
                    last_bucket = %last.bucket_start,
                    "discarding late tick"
                );
                return TickOutcome::Discarded;
            }
        }

        self.bars.push(Bar::from_tick(bucket, tick.price));
        TickOutcome::Appended
    }

    /// Immutable copy of the current history for indicator computation.
    pub fn snapshot(&self) -> Vec<Bar> {
        self.bars.clone()
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}
