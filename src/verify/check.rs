/// Check contract, result rows and the shared run context
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::VerifyConfig;
use crate::data::{IndexDefinition, Timeframe};
use crate::error::{CheckError, StoreError};
use crate::store::{BarStore, BarTable, ScanOrder, SeriesExtent, SeriesQuery};
use crate::types::{Bar, SymbolSet, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Freshness,
    Duplicates,
    Gaps,
    Alignment,
    OhlcIntegrity,
    OhlcIntegrityEnhanced,
    VolumeIntegrity,
    PriceContinuity,
    Monotonicity,
    FutureTimestamps,
    CrossTimeframeConsistency,
    ComponentDependency,
    CoverageGuardrail,
    AggregationCoverage,
    SyntheticPresence,
    BarCounts,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Freshness => "freshness",
            CheckKind::Duplicates => "duplicates",
            CheckKind::Gaps => "gaps",
            CheckKind::Alignment => "alignment",
            CheckKind::OhlcIntegrity => "ohlc_integrity",
            CheckKind::OhlcIntegrityEnhanced => "ohlc_integrity_enhanced",
            CheckKind::VolumeIntegrity => "volume_integrity",
            CheckKind::PriceContinuity => "price_continuity",
            CheckKind::Monotonicity => "monotonicity",
            CheckKind::FutureTimestamps => "future_timestamps",
            CheckKind::CrossTimeframeConsistency => "cross_timeframe_consistency",
            CheckKind::ComponentDependency => "component_dependency",
            CheckKind::CoverageGuardrail => "coverage_guardrail",
            CheckKind::AggregationCoverage => "aggregation_coverage",
            CheckKind::SyntheticPresence => "synthetic_presence",
            CheckKind::BarCounts => "bar_counts",
        }
    }
}

/// One cell of a finding row or summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Decimal(Decimal),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Text(String),
    /// No observation, e.g. staleness of a symbol without data
    Missing,
}

impl MetricValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(v) => Some(*v),
            MetricValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text form used for CSV cells
    pub fn render(&self) -> String {
        match self {
            MetricValue::Int(v) => v.to_string(),
            MetricValue::Decimal(v) => v.normalize().to_string(),
            MetricValue::Float(v) => format!("{:.4}", v),
            MetricValue::Bool(v) => v.to_string(),
            MetricValue::Timestamp(v) => v.to_rfc3339(),
            MetricValue::Text(v) => v.clone(),
            MetricValue::Missing => String::new(),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<Decimal> for MetricValue {
    fn from(v: Decimal) -> Self {
        MetricValue::Decimal(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for MetricValue {
    fn from(v: DateTime<Utc>) -> Self {
        MetricValue::Timestamp(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl<T: Into<MetricValue>> From<Option<T>> for MetricValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(MetricValue::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub symbol: String,
    pub timeframe: Option<Timeframe>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl Finding {
    pub fn new(symbol: &str, timeframe: Option<Timeframe>) -> Self {
        Finding {
            symbol: symbol.to_string(),
            timeframe,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn get_metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub findings: Vec<Finding>,
    pub summary: BTreeMap<String, MetricValue>,
    /// Flag name -> defect detected
    pub flags: BTreeMap<String, bool>,
}

impl CheckResult {
    pub fn new() -> Self {
        CheckResult::default()
    }

    pub fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn summarize(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.summary.insert(key.to_string(), value.into());
    }

    pub fn flag(&mut self, name: &str, raised: bool) {
        let slot = self.flags.entry(name.to_string()).or_insert(false);
        *slot |= raised;
    }

    pub fn get_summary(&self, key: &str) -> Option<&MetricValue> {
        self.summary.get(key)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.values().any(|raised| *raised)
    }
}

/// Read-only inputs shared by every check of one run
#[derive(Clone)]
pub struct CheckContext {
    pub store: Arc<dyn BarStore>,
    pub window: TimeWindow,
    pub now: DateTime<Utc>,
    pub config: Arc<VerifyConfig>,
    pub synthetic: Arc<IndexDefinition>,
    /// Active ingested symbols, synthetic symbol excluded
    pub symbols: Arc<Vec<String>>,
    /// Symbols intentionally idle (paused or orphaned)
    pub idle: Arc<HashSet<String>>,
}

impl CheckContext {
    pub fn get_synthetic_symbol(&self) -> &str {
        &self.synthetic.symbol
    }

    pub fn is_idle(&self, symbol: &str) -> bool {
        self.idle.contains(symbol)
    }

    /// `window` cut into read slices of `scan_page_days`
    pub fn pages(&self, window: TimeWindow) -> Vec<TimeWindow> {
        window.split(Duration::days(self.config.scan_page_days))
    }
}

/// Which symbols a check walks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSymbols {
    /// Active symbols of the run
    Active,
    /// Only the synthetic index symbol
    Synthetic,
    /// Every symbol stored for the timeframe
    Stored,
}

/// Table, timeframe and symbol selection of a series check
#[derive(Debug, Clone)]
pub struct Scope {
    pub table: BarTable,
    pub timeframe: Timeframe,
    pub symbols: ScopeSymbols,
}

impl Scope {
    pub fn raw_1m() -> Self {
        Scope {
            table: BarTable::Raw,
            timeframe: Timeframe::OneMinute,
            symbols: ScopeSymbols::Active,
        }
    }

    pub fn derived(timeframe: Timeframe) -> Self {
        Scope {
            table: BarTable::Derived,
            timeframe,
            symbols: ScopeSymbols::Stored,
        }
    }

    pub fn synthetic(timeframe: Timeframe) -> Self {
        Scope {
            table: BarTable::Derived,
            timeframe,
            symbols: ScopeSymbols::Synthetic,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.table.as_str(), self.timeframe)
    }

    pub async fn resolve_symbols(&self, ctx: &CheckContext) -> Result<Vec<String>, StoreError> {
        match self.symbols {
            ScopeSymbols::Active => Ok(ctx.symbols.as_ref().clone()),
            ScopeSymbols::Synthetic => Ok(vec![ctx.get_synthetic_symbol().to_string()]),
            ScopeSymbols::Stored => ctx.store.list_symbols(self.table, self.timeframe).await,
        }
    }

    /// Count and bounds of one symbol's series over `window`
    pub async fn extent(&self, ctx: &CheckContext, symbol: &str, window: TimeWindow) -> Result<SeriesExtent, StoreError> {
        let query = SeriesQuery::new(self.table, self.timeframe, window).with_symbols(SymbolSet::single(symbol));
        ctx.store.series_extent(&query).await
    }

    /// Series of one symbol over `window`
    pub async fn load(
        &self,
        ctx: &CheckContext,
        symbol: &str,
        window: TimeWindow,
        order: ScanOrder,
    ) -> Result<Vec<Bar>, StoreError> {
        let mut query = SeriesQuery::new(self.table, self.timeframe, window).with_symbols(SymbolSet::single(symbol));
        query.order = order;
        ctx.store.range_query(&query).await
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    /// Unique slot name within a phase
    fn name(&self) -> &str;

    fn kind(&self) -> CheckKind;

    /// Verdict flags this check owns; empty for informational checks
    fn flag_names(&self) -> Vec<String>;

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError>;
}
