//! Indicator worker: computation isolated from the ingestion path.
//!
//! A dedicated task owns the (stateless) indicator engine and speaks a strict
//! request/response protocol: `warmup` establishes readiness, `compute`
//! carries a full immutable snapshot and answers with `{ok, results | error}`.
//! The worker enforces nothing about outstanding-request counts; the
//! scheduler maintains the single-outstanding discipline.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bars::Bar;
use crate::error::EngineError;
use crate::indicator::{IndicatorResults, IndicatorSpec, compute_all};

/// Request sent to the indicator worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Warmup,
    Compute {
        bars: Vec<Bar>,
        indicators: Vec<IndicatorSpec>,
    },
}

/// Response from the indicator worker.
///
/// `{ok: true}` for warmup, `{ok: true, results}` for a compute (with
/// `error` naming any specs that were skipped as invalid),
/// `{ok: false, error}` when the whole computation fails. A fault never
/// kills the worker task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<IndicatorResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            results: None,
            error: None,
        }
    }

    fn ok_results(results: IndicatorResults) -> Self {
        Self {
            ok: true,
            results: Some(results),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            results: None,
            error: Some(error.into()),
        }
    }
}

struct WorkerMessage {
    request: WorkerRequest,
    respond: oneshot::Sender<WorkerResponse>,
}

/// Cheaply cloneable handle to a running worker task.
///
/// The worker holds no cross-request state, so one instance may be shared by
/// several charts as long as each caller correlates its own request/response
/// pairs (which the oneshot reply channel guarantees).
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
}

/// Spawns the indicator worker task and returns its handle.
pub fn spawn_worker() -> WorkerHandle {
    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(16);

    tokio::spawn(async move {
        debug!("indicator worker started");
        while let Some(WorkerMessage { request, respond }) = rx.recv().await {
            // Reply send fails only if the caller gave up; nothing to do then.
            let _ = respond.send(handle_request(request));
        }
        debug!("indicator worker stopped");
    });

    WorkerHandle { tx }
}

fn handle_request(request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::Warmup => WorkerResponse::ok(),
        WorkerRequest::Compute { bars, indicators } => {
            // An invalid spec only loses its own label; the rest of the
            // request still computes.
            let mut skipped = Vec::new();
            let valid: Vec<IndicatorSpec> = indicators
                .into_iter()
                .filter(|spec| match spec.validate() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "skipping invalid indicator spec");
                        skipped.push(e.to_string());
                        false
                    }
                })
                .collect();

            match compute_all(&bars, &valid) {
                Ok(results) => {
                    let mut response = WorkerResponse::ok_results(results);
                    if !skipped.is_empty() {
                        response.error = Some(skipped.join("; "));
                    }
                    response
                }
                Err(e) => WorkerResponse::err(e.to_string()),
            }
        }
    }
}

impl WorkerHandle {
    async fn request(&self, request: WorkerRequest) -> Result<WorkerResponse, EngineError> {
        let (respond, response) = oneshot::channel();
        self.tx
            .send(WorkerMessage { request, respond })
            .await
            .map_err(|_| EngineError::WorkerUnavailable)?;
        response.await.map_err(|_| EngineError::WorkerUnavailable)
    }

    /// Warmup handshake; must complete before any compute request is sent.
    pub async fn warmup(&self) -> Result<(), EngineError> {
        let response = self.request(WorkerRequest::Warmup).await?;
        if response.ok {
            Ok(())
        } else {
            Err(EngineError::Compute(
                response.error.unwrap_or_else(|| "warmup refused".to_string()),
            ))
        }
    }

    /// Submits one snapshot + spec set; the reply is correlated by the
    /// per-request response channel.
    pub async fn compute(
        &self,
        bars: Vec<Bar>,
        indicators: Vec<IndicatorSpec>,
    ) -> Result<WorkerResponse, EngineError> {
        self.request(WorkerRequest::Compute { bars, indicators })
            .await
    }
}
