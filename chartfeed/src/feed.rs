//! Live tick ingestion: WebSocket subscription, symbol filtering, and
//! reconnect handling.
//!
//! The adapter owns the connection lifecycle for one chart. Every accepted
//! tick mutates the shared bar store and notifies the recompute scheduler;
//! ticks for other symbols belong to other chart instances and are ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bars::{BarStore, Tick, TickOutcome};
use crate::scheduler::SchedulerHandle;

/// Connection lifecycle as observed by the display collaborator. Transport
/// faults only ever surface as a transient non-`Connected` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect tuning for the live feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket URL of the price feed.
    pub url: String,
    /// First reconnect delay after a failure.
    pub backoff_floor: Duration,
    /// Delays double per consecutive failure up to this cap.
    pub backoff_cap: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/prices".to_string(),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(15),
        }
    }
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Messages broadcast by the price feed server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    /// A batch of ticks, possibly spanning several symbols.
    Prices { data: Vec<PriceRow> },
    Welcome {
        #[serde(default)]
        #[allow(dead_code)]
        message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    ts: DateTime<Utc>,
    symbol: String,
    price: f64,
}

/// Handle to an active subscription.
pub struct FeedHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl FeedHandle {
    /// Tears down the connection and cancels any pending reconnect timer.
    /// No bar store mutation occurs after this returns.
    pub async fn unsubscribe(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Subscribes to the live feed for `symbol` and drives bar store mutation.
///
/// Returns the subscription handle and a watch channel publishing connection
/// status transitions.
pub fn subscribe(
    config: FeedConfig,
    symbol: String,
    store: Arc<Mutex<BarStore>>,
    scheduler: SchedulerHandle,
) -> (FeedHandle, watch::Receiver<ConnectionStatus>) {
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_feed(
        config,
        symbol,
        store,
        scheduler,
        status_tx,
        shutdown_rx,
    ));

    (
        FeedHandle {
            shutdown: shutdown_tx,
            task,
        },
        status_rx,
    )
}

/// Next reconnect delay: doubles per consecutive failure, capped.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

async fn run_feed(
    config: FeedConfig,
    symbol: String,
    store: Arc<Mutex<BarStore>>,
    scheduler: SchedulerHandle,
    status_tx: watch::Sender<ConnectionStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(url = %config.url, %symbol, "starting live tick feed");
    let mut backoff = config.backoff_floor;

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        let connect = tokio::select! {
            connect = connect_async(config.url.as_str()) => connect,
            _ = shutdown_rx.changed() => {
                debug!("unsubscribed while connecting");
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                return;
            }
        };

        match connect {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "connected to live feed");
                let _ = status_tx.send(ConnectionStatus::Connected);
                backoff = config.backoff_floor;

                let (_, mut read) = ws_stream.split();
                loop {
                    let message = tokio::select! {
                        message = read.next() => message,
                        _ = shutdown_rx.changed() => {
                            debug!("unsubscribed, closing live feed");
                            let _ = status_tx.send(ConnectionStatus::Disconnected);
                            return;
                        }
                    };

                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_frame(&text, &symbol, &store, &scheduler).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("feed server closed the connection");
                            break;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Heartbeat, handled by tungstenite.
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "feed stream error");
                            break;
                        }
                        None => {
                            warn!("feed stream ended");
                            break;
                        }
                    }
                }

                let _ = status_tx.send(ConnectionStatus::Disconnected);
            }
            Err(e) => {
                error!(error = %e, url = %config.url, "failed to connect to live feed");
                let _ = status_tx.send(ConnectionStatus::Disconnected);
            }
        }

        debug!(delay = ?backoff, "waiting before reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                debug!("unsubscribed, cancelling pending reconnect");
                return;
            }
        }
        backoff = next_backoff(backoff, config.backoff_cap);
    }
}

/// Parses one frame and merges matching ticks into the store.
///
/// A malformed frame is dropped without tearing down the connection.
async fn handle_frame(
    text: &str,
    symbol: &str,
    store: &Arc<Mutex<BarStore>>,
    scheduler: &SchedulerHandle,
) {
    let message = match serde_json::from_str::<FeedMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                error = %e,
                raw = &text[..text.len().min(120)],
                "dropping malformed feed frame"
            );
            return;
        }
    };

    match message {
        FeedMessage::Welcome { .. } => debug!("feed welcome received"),
        FeedMessage::Prices { data } => {
            let mut mutated = false;
            {
                let mut store = store.lock().await;
                for row in data {
                    if row.symbol != symbol {
                        continue;
                    }
                    let outcome = store.apply_tick(&Tick {
                        ts: row.ts,
                        symbol: row.symbol,
                        price: row.price,
                    });
                    mutated |= outcome != TickOutcome::Discarded;
                }
            }
            if mutated {
                scheduler.trigger();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Resolution;
    use crate::indicator::{IndicatorKind, IndicatorSpec, PriceSource};
    use crate::scheduler::spawn_scheduler;
    use crate::worker::spawn_worker;
    use tokio::sync::mpsc;

    #[test]
    fn test_backoff_doubles_from_floor_and_caps() {
        let floor = Duration::from_secs(1);
        let cap = Duration::from_secs(15);

        // Three consecutive failures wait 1s, 2s, 4s.
        let mut delay = floor;
        let mut observed = vec![delay];
        for _ in 0..2 {
            delay = next_backoff(delay, cap);
            observed.push(delay);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );

        // Keeps doubling until the cap, then stays there.
        for _ in 0..10 {
            delay = next_backoff(delay, cap);
        }
        assert_eq!(delay, cap);
    }

    #[test]
    fn test_prices_frame_parses() {
        let raw = r#"{"type":"prices","data":[
            {"ts":"2025-03-14T15:09:26+00:00","symbol":"SPY","price":501.25},
            {"ts":"2025-03-14T15:09:27+00:00","symbol":"QQQ","price":430.0}
        ]}"#;
        let message: FeedMessage = serde_json::from_str(raw).unwrap();
        match message {
            FeedMessage::Prices { data } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].symbol, "SPY");
                assert_eq!(data[0].price, 501.25);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_fail_to_parse() {
        for raw in [
            "not json",
            r#"{"type":"prices"}"#,
            r#"{"type":"prices","data":[{"symbol":"SPY"}]}"#,
            r#"{"type":"unknown_shape","data":[]}"#,
        ] {
            assert!(serde_json::from_str::<FeedMessage>(raw).is_err());
        }
        assert!(serde_json::from_str::<FeedMessage>(r#"{"type":"welcome"}"#).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_filter_by_symbol_and_trigger_recompute() {
        let store = Arc::new(Mutex::new(BarStore::new("SPY", Resolution::Minutes(1))));
        let worker = spawn_worker();
        let (updates_tx, mut updates_rx) = mpsc::channel(8);
        let specs = vec![IndicatorSpec::new(IndicatorKind::Sma, 2, PriceSource::Close).unwrap()];
        let scheduler = spawn_scheduler(store.clone(), worker, specs, updates_tx);
        scheduler.ready().await;

        let frame = r#"{"type":"prices","data":[
            {"ts":"2025-03-14T15:09:00+00:00","symbol":"SPY","price":100.0},
            {"ts":"2025-03-14T15:09:30+00:00","symbol":"QQQ","price":430.0},
            {"ts":"2025-03-14T15:10:00+00:00","symbol":"SPY","price":101.0}
        ]}"#;
        handle_frame(frame, "SPY", &store, &scheduler).await;

        // Only the two SPY ticks landed, in two separate minute buckets.
        assert_eq!(store.lock().await.len(), 2);

        // The accepted ticks triggered a (debounced) recompute.
        let update = updates_rx.recv().await.unwrap();
        assert_eq!(update.bars.len(), 2);

        // A frame with no matching ticks does not trigger another cycle.
        handle_frame(
            r#"{"type":"prices","data":[{"ts":"2025-03-14T15:11:00+00:00","symbol":"QQQ","price":1.0}]}"#,
            "SPY",
            &store,
            &scheduler,
        )
        .await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), updates_rx.recv()).await;
        assert!(outcome.is_err(), "unexpected recompute for foreign symbol");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let store = Arc::new(Mutex::new(BarStore::new("SPY", Resolution::Minutes(1))));
        let worker = spawn_worker();
        let (updates_tx, _updates_rx) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store.clone(), worker, Vec::new(), updates_tx);

        let config = FeedConfig::new(format!("ws://{addr}/ws/prices"));
        let (handle, _status) = subscribe(config, "SPY".to_string(), store, scheduler);

        // Two raw-socket drops fail the handshake and grow the delay to 4s.
        for _ in 0..2 {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        }

        // The third attempt completes the handshake, then the server hangs up.
        let (socket, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        drop(ws);

        // A successful connect resets the delay to the floor, so the next
        // attempt arrives after ~1s rather than the grown 4s.
        let t0 = tokio::time::Instant::now();
        let (socket, _) = listener.accept().await.unwrap();
        let elapsed = t0.elapsed();
        drop(socket);

        assert!(elapsed >= Duration::from_millis(900), "reconnected too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "backoff was not reset: {elapsed:?}");

        handle.unsubscribe().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_mid_connect_leaves_disconnected_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let store = Arc::new(Mutex::new(BarStore::new("SPY", Resolution::Minutes(1))));
        let worker = spawn_worker();
        let (updates_tx, _updates_rx) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store.clone(), worker, Vec::new(), updates_tx);

        // The listener never answers the handshake, so the connect attempt
        // is still in flight when the unsubscribe lands.
        let config = FeedConfig::new(format!("ws://{addr}/ws/prices"));
        let (handle, status) = subscribe(config, "SPY".to_string(), store, scheduler);
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.unsubscribe().await;
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_cancels_pending_reconnect() {
        let store = Arc::new(Mutex::new(BarStore::new("SPY", Resolution::Minutes(1))));
        let worker = spawn_worker();
        let (updates_tx, _updates_rx) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store.clone(), worker, Vec::new(), updates_tx);

        // Nothing listens on this port, so the adapter sits in its
        // connect/backoff loop until unsubscribed.
        let config = FeedConfig::new("ws://127.0.0.1:1/ws/prices");
        let (handle, _status) = subscribe(config, "SPY".to_string(), store.clone(), scheduler);

        handle.unsubscribe().await;
        assert!(store.lock().await.is_empty());
    }
}
