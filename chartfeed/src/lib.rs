//! Streaming OHLC aggregation and indicator engine for live price charts.
//!
//! The engine turns an unordered-arrival tick stream into ordered,
//! resolution-bucketed OHLC bars and computes indicator overlays (SMA, EMA,
//! RSI) over that history off the ingestion path:
//!
//! - [`bucket`]: pure (timestamp, resolution) → bucket-start arithmetic.
//! - [`bars`]: the authoritative in-memory bar history with append/merge
//!   semantics per tick.
//! - [`feed`]: WebSocket tick ingestion with reconnect/backoff and symbol
//!   filtering.
//! - [`indicator`]: pure indicator math over a snapshot.
//! - [`worker`]: the computation task and its `warmup`/`compute` protocol.
//! - [`scheduler`]: debounced, coalescing recompute scheduling.
//! - [`history`]: historical `/ohlc` seeding client.
//!
//! One engine instance serves one (symbol, resolution) chart; the worker may
//! be shared.

pub mod bars;
pub mod bucket;
pub mod config;
pub mod error;
pub mod feed;
pub mod history;
pub mod indicator;
pub mod scheduler;
pub mod worker;

pub use bars::{Bar, BarStore, Tick, TickOutcome};
pub use bucket::{Resolution, bucket_start};
pub use config::ChartConfig;
pub use error::EngineError;
pub use feed::{ConnectionStatus, FeedConfig, FeedHandle, subscribe};
pub use history::HistoryClient;
pub use indicator::{
    IndicatorKind, IndicatorResults, IndicatorSeries, IndicatorSpec, PriceSource, compute_all,
};
pub use scheduler::{DEBOUNCE_WINDOW, IndicatorUpdate, SchedulerHandle, spawn_scheduler};
pub use worker::{WorkerHandle, WorkerRequest, WorkerResponse, spawn_worker};
