/// Core type definitions for bar storage and verification
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;
use crate::error::{Result, VerifyError};

/// OHLCV bar keyed by (symbol, timeframe, ts_utc).
///
/// Price fields are optional so that a stored NULL can be read back and
/// reported as a defect instead of failing the whole query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts_utc: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub trade_count: Option<i64>,
    pub vwap: Option<Decimal>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub raw: Option<serde_json::Value>,
}

impl Bar {
    pub fn new(
        symbol: &str,
        timeframe: Timeframe,
        ts_utc: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Bar {
            symbol: symbol.to_string(),
            timeframe,
            ts_utc,
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: None,
            trade_count: None,
            vwap: None,
            source: "ingest".to_string(),
            ingested_at: Utc::now(),
            raw: None,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// All four prices, if every one of them is present
    pub fn ohlc(&self) -> Option<(Decimal, Decimal, Decimal, Decimal)> {
        Some((self.open?, self.high?, self.low?, self.close?))
    }

    /// True when every price is present and strictly positive
    pub fn has_valid_prices(&self) -> bool {
        match self.ohlc() {
            Some((o, h, l, c)) => o > Decimal::ZERO && h > Decimal::ZERO && l > Decimal::ZERO && c > Decimal::ZERO,
            None => false,
        }
    }
}

/// Bar produced by aggregation or synthesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedBar {
    #[serde(flatten)]
    pub bar: Bar,
    pub derivation_version: u32,
    pub quality_score: Option<Decimal>,
}

impl DerivedBar {
    /// Compare everything an upsert would write, except `ingested_at`
    pub fn same_content(&self, other: &DerivedBar) -> bool {
        let (a, b) = (&self.bar, &other.bar);
        a.symbol == b.symbol
            && a.timeframe == b.timeframe
            && a.ts_utc == b.ts_utc
            && a.open == b.open
            && a.high == b.high
            && a.low == b.low
            && a.close == b.close
            && a.volume == b.volume
            && a.trade_count == b.trade_count
            && a.vwap == b.vwap
            && a.source == b.source
            && a.raw == b.raw
            && self.derivation_version == other.derivation_version
            && self.quality_score == other.quality_score
    }

    pub fn key(&self) -> (String, Timeframe, DateTime<Utc>) {
        (self.bar.symbol.clone(), self.bar.timeframe, self.bar.ts_utc)
    }
}

/// Ingestion status of a (symbol, timeframe) series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Running,
    Paused,
    Orphaned,
    Failing,
}

impl IngestStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IngestStatus::Running => "running",
            IngestStatus::Paused => "paused",
            IngestStatus::Orphaned => "orphaned",
            IngestStatus::Failing => "failing",
        }
    }
}

impl FromStr for IngestStatus {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(IngestStatus::Running),
            "paused" => Ok(IngestStatus::Paused),
            "orphaned" => Ok(IngestStatus::Orphaned),
            "failing" => Ok(IngestStatus::Failing),
            other => Err(VerifyError::InvalidParameter(format!("Unknown ingest status: {}", other))),
        }
    }
}

/// Per-series ingestion control state, owned by the ingestion subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestState {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: IngestStatus,
    pub pause_fetch: bool,
    pub hard_fail_streak: u32,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IngestState {
    pub fn new(symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Self {
        IngestState {
            symbol: symbol.to_string(),
            timeframe,
            status: IngestStatus::Running,
            pause_fetch: false,
            hard_fail_streak: 0,
            notes: None,
            updated_at: now,
        }
    }

    /// Series intentionally idle and excluded from staleness/gap findings
    pub fn is_idle(&self) -> bool {
        self.pause_fetch || matches!(self.status, IngestStatus::Paused | IngestStatus::Orphaned)
    }
}

/// Half-open `[from, to)` time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(VerifyError::InvalidParameter(format!(
                "window start {} must be before end {}",
                from, to
            )));
        }
        Ok(TimeWindow { from, to })
    }

    /// Window ending just after `now` so that a bar stamped exactly `now` is included
    pub fn last_days(now: DateTime<Utc>, days: i64) -> Self {
        TimeWindow {
            from: now - Duration::days(days),
            to: now + Duration::seconds(1),
        }
    }

    pub fn last_years(now: DateTime<Utc>, years: u32) -> Self {
        TimeWindow {
            from: crate::utils::years_before(now, years),
            to: now + Duration::seconds(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }

    /// Everything stored before `to`, from the start of the series
    pub fn until(to: DateTime<Utc>) -> Self {
        TimeWindow {
            from: DateTime::<Utc>::MIN_UTC,
            to,
        }
    }

    /// Consecutive slices of at most `step` covering the window exactly
    pub fn split(&self, step: Duration) -> Vec<TimeWindow> {
        if step <= Duration::zero() {
            return vec![*self];
        }
        let mut slices = Vec::new();
        let mut from = self.from;
        while from < self.to {
            let to = from.checked_add_signed(step).map_or(self.to, |t| t.min(self.to));
            slices.push(TimeWindow { from, to });
            from = to;
        }
        slices
    }
}

/// Symbol filter for store queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolSet {
    All,
    Only(Vec<String>),
}

impl SymbolSet {
    pub fn single(symbol: &str) -> Self {
        SymbolSet::Only(vec![symbol.to_string()])
    }

    pub fn contains(&self, symbol: &str) -> bool {
        match self {
            SymbolSet::All => true,
            SymbolSet::Only(list) => list.iter().any(|s| s == symbol),
        }
    }
}
