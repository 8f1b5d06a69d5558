//! Explicit per-chart configuration.
//!
//! Symbol/resolution selection and the active indicator set are plain values
//! handed to the engine's entry points, never ambient state.

use serde::{Deserialize, Serialize};

use crate::bucket::Resolution;
use crate::indicator::IndicatorSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    pub symbol: String,
    pub resolution: Resolution,
    pub indicators: Vec<IndicatorSpec>,
}

impl ChartConfig {
    pub fn new(symbol: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution,
            indicators: Vec::new(),
        }
    }

    pub fn with_indicator(mut self, spec: IndicatorSpec) -> Self {
        self.indicators.push(spec);
        self
    }
}
