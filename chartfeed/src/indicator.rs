//! Pure indicator math over a bar history snapshot.
//!
//! Every function here is a pure function of `(bars, specs)`: no I/O, no
//! cross-call state. That is what allows the worker to run computations off
//! the ingestion path without shared-memory hazards.
//!
//! All series are positionally aligned 1:1 with the input bars; indices where
//! an indicator is not yet defined hold `None`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bars::Bar;
use crate::error::EngineError;

/// One value per input bar; `None` where the indicator is undefined.
pub type IndicatorSeries = Vec<Option<f64>>;

/// Named result set, keyed by canonical label.
pub type IndicatorResults = BTreeMap<String, IndicatorSeries>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndicatorKind::Sma => "SMA",
            IndicatorKind::Ema => "EMA",
            IndicatorKind::Rsi => "RSI",
        };
        write!(f, "{name}")
    }
}

impl FromStr for IndicatorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMA" => Ok(IndicatorKind::Sma),
            "EMA" => Ok(IndicatorKind::Ema),
            "RSI" => Ok(IndicatorKind::Rsi),
            other => Err(EngineError::InvalidIndicatorSpec(format!(
                "unknown indicator kind: {other}"
            ))),
        }
    }
}

/// Which per-bar price an indicator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Close,
    Open,
    /// (high + low) / 2
    Hl2,
    /// (high + low + close) / 3
    Hlc3,
}

impl PriceSource {
    fn extract(self, bar: &Bar) -> f64 {
        match self {
            PriceSource::Close => bar.close,
            PriceSource::Open => bar.open,
            PriceSource::Hl2 => (bar.high + bar.low) / 2.0,
            PriceSource::Hlc3 => (bar.high + bar.low + bar.close) / 3.0,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriceSource::Close => "close",
            PriceSource::Open => "open",
            PriceSource::Hl2 => "hl2",
            PriceSource::Hlc3 => "hlc3",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PriceSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "close" => Ok(PriceSource::Close),
            "open" => Ok(PriceSource::Open),
            "hl2" => Ok(PriceSource::Hl2),
            "hlc3" => Ok(PriceSource::Hlc3),
            other => Err(EngineError::InvalidIndicatorSpec(format!(
                "unknown price source: {other}"
            ))),
        }
    }
}

/// One requested indicator; its [`label`](IndicatorSpec::label) is the unique
/// identifier correlating requests with results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub kind: IndicatorKind,
    pub period: usize,
    pub source: PriceSource,
}

impl IndicatorSpec {
    pub fn new(
        kind: IndicatorKind,
        period: usize,
        source: PriceSource,
    ) -> Result<Self, EngineError> {
        let spec = Self {
            kind,
            period,
            source,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Revalidates a spec that may not have come through [`IndicatorSpec::new`]
    /// (e.g. deserialized from a compute request).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.period == 0 {
            return Err(EngineError::InvalidIndicatorSpec(format!(
                "{self}: period must be positive"
            )));
        }
        // RSI is defined only over close/open.
        if self.kind == IndicatorKind::Rsi
            && !matches!(self.source, PriceSource::Close | PriceSource::Open)
        {
            return Err(EngineError::InvalidIndicatorSpec(format!(
                "{self}: RSI supports only close/open sources"
            )));
        }
        Ok(())
    }

    /// Canonical label: `"KIND(period,source)"`, e.g. `SMA(20,close)`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.kind, self.period, self.source)
    }
}

impl FromStr for IndicatorSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidIndicatorSpec(s.to_string());
        let trimmed = s.trim();

        let (kind, rest) = trimmed.split_once('(').ok_or_else(invalid)?;
        let args = rest.strip_suffix(')').ok_or_else(invalid)?;
        let (period, source) = args.split_once(',').ok_or_else(invalid)?;

        IndicatorSpec::new(
            kind.parse()?,
            period.trim().parse().map_err(|_| invalid())?,
            source.parse()?,
        )
    }
}

/// Computes every requested indicator over a bar snapshot.
///
/// Fewer than 2 bars yields an empty result map (a no-op, not an error).
/// Otherwise every label is present with a series exactly as long as `bars`;
/// an indicator whose period exceeds the history is simply all-`None` until
/// enough bars accumulate. An invalid spec fails the whole request.
pub fn compute_all(bars: &[Bar], specs: &[IndicatorSpec]) -> Result<IndicatorResults, EngineError> {
    let mut results = IndicatorResults::new();
    if bars.len() < 2 {
        return Ok(results);
    }

    for spec in specs {
        spec.validate()?;
        let values: Vec<f64> = bars.iter().map(|bar| spec.source.extract(bar)).collect();
        let series = match spec.kind {
            IndicatorKind::Sma => sma(&values, spec.period),
            IndicatorKind::Ema => ema(&values, spec.period),
            IndicatorKind::Rsi => rsi(&values, spec.period),
        };
        results.insert(spec.label(), series);
    }

    Ok(results)
}

/// Simple moving average via a sliding running sum (linear time, not a
/// re-sum per index). Defined from index `period - 1`.
fn sma(values: &[f64], period: usize) -> IndicatorSeries {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average seeded at index `period - 1` with the SMA of
/// the first `period` values, then `ema = price * k + prev * (1 - k)` with
/// `k = 2 / (period + 1)`.
fn ema(values: &[f64], period: usize) -> IndicatorSeries {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for i in period..values.len() {
        prev = values[i] * k + prev * (1.0 - k);
        out[i] = Some(prev);
    }
    out
}

/// Relative strength index with canonical Wilder smoothing.
///
/// The seed at index `period` uses simple means of the first `period` price
/// changes; subsequent indices carry the gain/loss averages forward
/// recursively. Undefined for the first `period` indices.
fn rsi(values: &[f64], period: usize) -> IndicatorSeries {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change >= 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in period + 1..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

/// `100 - 100 / (1 + RS)`; a zero average loss means unbounded RS, i.e. 100.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}
