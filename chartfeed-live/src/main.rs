//! Wires the chartfeed engine end to end against a running price feed:
//! seeds the bar store from the historical endpoint, subscribes to live
//! ticks, and logs every bar/indicator update the scheduler delivers.

use std::sync::Arc;

use chartfeed::{
    BarStore, ChartConfig, ConnectionStatus, FeedConfig, HistoryClient, IndicatorSpec,
    IndicatorUpdate, Resolution, spawn_scheduler, spawn_worker, subscribe,
};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    init_logging();

    let feed_url =
        std::env::var("CHARTFEED_WS_URL").unwrap_or_else(|_| FeedConfig::default().url);
    let history_url = std::env::var("CHARTFEED_HTTP_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());
    let symbol = std::env::var("CHARTFEED_SYMBOL").unwrap_or_else(|_| "SPY".to_string());
    let lookback_minutes = std::env::var("CHARTFEED_LOOKBACK_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(390);

    let resolution = std::env::var("CHARTFEED_RESOLUTION")
        .unwrap_or_else(|_| "1".to_string())
        .parse::<Resolution>()
        .unwrap_or_else(|e| {
            warn!(error = %e, "invalid CHARTFEED_RESOLUTION, falling back to 1 minute");
            Resolution::Minutes(1)
        });

    // Comma-separated canonical labels, e.g. "SMA(20,close),EMA(50,close),RSI(14,close)".
    let indicators = std::env::var("CHARTFEED_INDICATORS")
        .unwrap_or_else(|_| "SMA(20,close),EMA(50,close),RSI(14,close)".to_string());
    let mut config = ChartConfig::new(symbol, resolution);
    for label in indicators.split(',').filter(|s| !s.trim().is_empty()) {
        match label.parse::<IndicatorSpec>() {
            Ok(spec) => config = config.with_indicator(spec),
            Err(e) => warn!(label, error = %e, "skipping invalid indicator"),
        }
    }

    info!(
        symbol = %config.symbol,
        resolution = %config.resolution,
        indicators = config.indicators.len(),
        "starting chartfeed"
    );

    // Seed the store from history; an unreachable endpoint just means an
    // empty history that fills in from live ticks.
    let store = Arc::new(Mutex::new(BarStore::new(
        config.symbol.clone(),
        config.resolution,
    )));
    let history = HistoryClient::new(history_url);
    match history
        .fetch_bars(&config.symbol, config.resolution, lookback_minutes)
        .await
    {
        Ok(bars) => store.lock().await.load(bars),
        Err(e) => warn!(error = %e, "historical load failed, starting with empty history"),
    }

    let worker = spawn_worker();
    let (updates_tx, mut updates_rx) = mpsc::channel::<IndicatorUpdate>(32);
    let scheduler = spawn_scheduler(
        store.clone(),
        worker,
        config.indicators.clone(),
        updates_tx,
    );
    // Kick off an initial computation over the seeded history once the
    // worker has warmed up (earlier triggers would be dropped by design).
    scheduler.ready().await;
    scheduler.trigger();

    let (feed, status_rx) = subscribe(
        FeedConfig::new(feed_url),
        config.symbol.clone(),
        store.clone(),
        scheduler.clone(),
    );
    tokio::spawn(log_status_transitions(status_rx));

    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                match update {
                    Some(update) => log_update(&update),
                    None => {
                        error!("scheduler stopped delivering updates");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    scheduler.shutdown();
    feed.unsubscribe().await;
    info!("chartfeed stopped");
}

async fn log_status_transitions(mut status_rx: watch::Receiver<ConnectionStatus>) {
    while status_rx.changed().await.is_ok() {
        match *status_rx.borrow_and_update() {
            ConnectionStatus::Connected => info!("feed connected"),
            ConnectionStatus::Connecting => info!("feed connecting"),
            ConnectionStatus::Disconnected => warn!("feed disconnected, data may be stale"),
        }
    }
}

fn log_update(update: &IndicatorUpdate) {
    let Some(last) = update.bars.last() else {
        return;
    };
    info!(
        bucket = %last.bucket_start,
        open = last.open,
        high = last.high,
        low = last.low,
        close = last.close,
        bars = update.bars.len(),
        "bar update"
    );
    for (label, series) in &update.results {
        match series.iter().rev().find_map(|v| *v) {
            Some(value) => info!(label = %label, value, "indicator"),
            None => info!(label = %label, "indicator warming up"),
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
