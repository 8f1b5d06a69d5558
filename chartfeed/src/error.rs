use thiserror::Error;

/// All errors generated in `chartfeed`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("invalid indicator spec: {0}")]
    InvalidIndicatorSpec(String),

    #[error("historical load failed: {0}")]
    HistoricalLoad(#[from] reqwest::Error),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("indicator worker unavailable")]
    WorkerUnavailable,

    #[error("indicator computation failed: {0}")]
    Compute(String),
}
