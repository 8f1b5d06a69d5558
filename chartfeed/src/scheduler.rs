//! Recompute scheduler: coalesces bursts of triggers into bounded-rate
//! indicator computations.
//!
//! Invariants: at most one pending debounce timer, at most one compute in
//! flight, at most one coalesced follow-up cycle. Triggers never queue beyond
//! that single slot, so a fast tick stream cannot build a backlog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use crate::bars::{Bar, BarStore};
use crate::indicator::{IndicatorResults, IndicatorSpec};
use crate::worker::WorkerHandle;

/// Debounce window: triggers arriving within it are absorbed by the same
/// pending computation.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(150);

/// Snapshot plus indicator series delivered to the display collaborator.
/// Read-only data; never mutated after delivery.
#[derive(Debug, Clone)]
pub struct IndicatorUpdate {
    pub bars: Vec<Bar>,
    pub results: IndicatorResults,
}

#[derive(Debug)]
enum Command {
    Trigger,
    SetIndicators(Vec<IndicatorSpec>),
    Shutdown,
}

/// Handle for feeding the scheduler. All methods are fire-and-forget and
/// callable from any task without awaiting.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
}

impl SchedulerHandle {
    /// Resolves once the worker warmup handshake has completed (or failed).
    /// Triggers sent before that point are dropped, not queued.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|warmed| *warmed).await;
    }

    /// Signals that the bar history mutated (tick accepted, history loaded).
    pub fn trigger(&self) {
        let _ = self.tx.send(Command::Trigger);
    }

    /// Replaces the active indicator set; also triggers a recompute.
    pub fn set_indicators(&self, indicators: Vec<IndicatorSpec>) {
        let _ = self.tx.send(Command::SetIndicators(indicators));
    }

    /// Cancels any pending timer; an in-flight result is discarded.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Spawns the scheduler task for one chart.
///
/// Computed updates are delivered on `updates`; the scheduler exits when the
/// receiver is dropped, when [`SchedulerHandle::shutdown`] is called, or when
/// the worker goes away.
pub fn spawn_scheduler(
    store: Arc<Mutex<BarStore>>,
    worker: WorkerHandle,
    indicators: Vec<IndicatorSpec>,
    updates: mpsc::Sender<IndicatorUpdate>,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = watch::channel(false);
    tokio::spawn(run_scheduler(
        store, worker, indicators, updates, rx, ready_tx,
    ));
    SchedulerHandle {
        tx,
        ready: ready_rx,
    }
}

async fn run_scheduler(
    store: Arc<Mutex<BarStore>>,
    worker: WorkerHandle,
    mut indicators: Vec<IndicatorSpec>,
    updates: mpsc::Sender<IndicatorUpdate>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    ready_tx: watch::Sender<bool>,
) {
    // Readiness handshake comes first; compute requests must never overtake it.
    match worker.warmup().await {
        Ok(()) => debug!("indicator worker warmed up"),
        Err(e) => {
            warn!(error = %e, "indicator worker warmup failed, scheduler exiting");
            return;
        }
    }

    // Triggers that raced the warmup are dropped, not queued.
    match drain_pending(&mut rx, &mut indicators) {
        None => return,
        Some(true) => debug!("dropped pre-warmup recompute triggers"),
        Some(false) => {}
    }
    let _ = ready_tx.send(true);

    loop {
        // Wait for the first trigger of a burst.
        let Some(command) = rx.recv().await else {
            return;
        };
        match command {
            Command::Shutdown => return,
            Command::SetIndicators(specs) => indicators = specs,
            Command::Trigger => {}
        }

        // Arm the debounce timer once; further triggers reset nothing.
        tokio::time::sleep(DEBOUNCE_WINDOW).await;

        loop {
            // Absorb the rest of the burst into this one computation.
            if drain_pending(&mut rx, &mut indicators).is_none() {
                return;
            }

            let snapshot = store.lock().await.snapshot();
            let response = match worker.compute(snapshot.clone(), indicators.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "indicator worker unavailable, scheduler exiting");
                    return;
                }
            };

            // Commands that arrived while the compute was in flight decide
            // whether one follow-up cycle fires. Shutdown here discards the
            // in-flight result.
            let pending = match drain_pending(&mut rx, &mut indicators) {
                None => return,
                Some(pending) => pending,
            };

            // Indicator trouble degrades to missing overlays; the bars are
            // delivered either way.
            let results = if response.ok {
                if let Some(skipped) = response.error.as_deref() {
                    warn!(error = skipped, "some indicators were skipped this cycle");
                }
                response.results.unwrap_or_default()
            } else {
                warn!(
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "indicator computation failed, delivering bars only"
                );
                IndicatorResults::default()
            };
            let update = IndicatorUpdate {
                bars: snapshot,
                results,
            };
            if updates.send(update).await.is_err() {
                debug!("update receiver dropped, scheduler exiting");
                return;
            }

            if !pending {
                break;
            }
        }
    }
}

/// Drains all queued commands. Returns `None` on shutdown (or a closed
/// channel), otherwise whether any trigger-worthy command was pending.
fn drain_pending(
    rx: &mut mpsc::UnboundedReceiver<Command>,
    indicators: &mut Vec<IndicatorSpec>,
) -> Option<bool> {
    let mut pending = false;
    loop {
        match rx.try_recv() {
            Ok(Command::Shutdown) => return None,
            Ok(Command::SetIndicators(specs)) => {
                *indicators = specs;
                pending = true;
            }
            Ok(Command::Trigger) => pending = true,
            Err(TryRecvError::Empty) => return Some(pending),
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::Tick;
    use crate::bucket::Resolution;
    use crate::indicator::{IndicatorKind, PriceSource};
    use crate::worker::spawn_worker;
    use chrono::{TimeZone, Utc};

    fn seeded_store(closes: &[f64]) -> Arc<Mutex<BarStore>> {
        let mut store = BarStore::new("SPY", Resolution::Minutes(1));
        for (i, &price) in closes.iter().enumerate() {
            store.apply_tick(&Tick {
                ts: Utc.timestamp_opt(1_700_000_000 + 60 * i as i64, 0).unwrap(),
                symbol: "SPY".to_string(),
                price,
            });
        }
        Arc::new(Mutex::new(store))
    }

    fn sma2() -> Vec<IndicatorSpec> {
        vec![IndicatorSpec::new(IndicatorKind::Sma, 2, PriceSource::Close).unwrap()]
    }

    async fn expect_no_update(updates: &mut mpsc::Receiver<IndicatorUpdate>) {
        // A closed channel means the scheduler exited without delivering,
        // which is just as much "no update" as a quiet open channel.
        match tokio::time::timeout(Duration::from_secs(2), updates.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(_)) => panic!("unexpected update delivered"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_burst_coalesces_into_one_computation() {
        let store = seeded_store(&[10.0, 11.0, 12.0]);
        let (tx, mut updates) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store, spawn_worker(), sma2(), tx);

        // Let warmup finish before the burst so nothing is dropped.
        scheduler.ready().await;
        for _ in 0..10 {
            scheduler.trigger();
        }

        let update = updates.recv().await.unwrap();
        assert_eq!(update.bars.len(), 3);
        assert_eq!(update.results["SMA(2,close)"].len(), 3);

        expect_no_update(&mut updates).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_indicators_recomputes_with_new_labels() {
        let store = seeded_store(&[10.0, 11.0, 12.0, 13.0]);
        let (tx, mut updates) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store, spawn_worker(), sma2(), tx);
        scheduler.ready().await;

        scheduler.trigger();
        let first = updates.recv().await.unwrap();
        assert!(first.results.contains_key("SMA(2,close)"));

        scheduler.set_indicators(vec![
            IndicatorSpec::new(IndicatorKind::Ema, 3, PriceSource::Close).unwrap(),
        ]);
        let second = updates.recv().await.unwrap();
        assert!(second.results.contains_key("EMA(3,close)"));
        assert!(!second.results.contains_key("SMA(2,close)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_delivery() {
        let store = seeded_store(&[10.0, 11.0]);
        let (tx, mut updates) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store, spawn_worker(), sma2(), tx);
        scheduler.ready().await;

        scheduler.trigger();
        updates.recv().await.unwrap();

        scheduler.shutdown();
        scheduler.trigger();
        expect_no_update(&mut updates).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_warmup_triggers_are_dropped() {
        let store = seeded_store(&[10.0, 11.0]);
        let (tx, mut updates) = mpsc::channel(8);
        // Triggers land in the queue before the scheduler task first runs,
        // so they race (and lose to) the warmup handshake.
        let scheduler = spawn_scheduler(store, spawn_worker(), sma2(), tx);
        scheduler.trigger();
        scheduler.trigger();

        expect_no_update(&mut updates).await;

        // Post-warmup triggers behave normally.
        scheduler.trigger();
        let update = updates.recv().await.unwrap();
        assert_eq!(update.bars.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_spec_never_blocks_bar_delivery() {
        let store = seeded_store(&[10.0, 11.0]);
        let (tx, mut updates) = mpsc::channel(8);
        let mut specs = sma2();
        specs.push(IndicatorSpec {
            kind: IndicatorKind::Rsi,
            period: 14,
            source: PriceSource::Hlc3,
        });
        let scheduler = spawn_scheduler(store, spawn_worker(), specs, tx);

        scheduler.ready().await;
        scheduler.trigger();

        // Bars and the valid overlay still flow; only the bad label is gone.
        let update = updates.recv().await.unwrap();
        assert_eq!(update.bars.len(), 2);
        assert!(update.results.contains_key("SMA(2,close)"));
        assert!(!update.results.contains_key("RSI(14,hlc3)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_inflight_compute_coalesce_into_one_followup() {
        let store = seeded_store(&[10.0, 11.0, 12.0]);
        let (tx, mut updates) = mpsc::channel(8);
        let scheduler = spawn_scheduler(store.clone(), spawn_worker(), sma2(), tx);
        scheduler.ready().await;

        // Holding the store lock stalls the cycle after it has absorbed the
        // burst, so triggers sent now arrive mid-computation.
        let guard = store.lock().await;
        scheduler.trigger();
        tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;
        scheduler.trigger();
        scheduler.trigger();
        drop(guard);

        // The stalled cycle delivers, then the mid-flight triggers collapse
        // into exactly one follow-up delivery.
        updates.recv().await.unwrap();
        updates.recv().await.unwrap();
        expect_no_update(&mut updates).await;
    }
}
