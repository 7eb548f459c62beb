/// Roll-up of 1-minute bars into 5m/1h/1d derived bars
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::data::Timeframe;
use crate::store::{BarStore, BarTable, SeriesQuery};
use crate::types::{Bar, DerivedBar, SymbolSet, TimeWindow};

pub const AGGREGATED_SOURCE: &str = "aggregated";

/// How many children a bucket needs before its parent bar is acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CoveragePolicy {
    /// Every child must be present
    Strict,
    /// At least `min_required` children
    Relaxed { min_required: u32 },
}

impl CoveragePolicy {
    pub fn required(&self, ratio: u32) -> u32 {
        match self {
            CoveragePolicy::Strict => ratio,
            CoveragePolicy::Relaxed { min_required } => (*min_required).min(ratio),
        }
    }

    pub fn accepts(&self, children: u32, ratio: u32) -> bool {
        children >= self.required(ratio)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CoveragePolicy::Strict => "strict",
            CoveragePolicy::Relaxed { .. } => "relaxed",
        }
    }
}

/// Whether any row reached the store before a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    NothingWritten,
    PartiallyWritten,
    Complete,
}

/// OHLCV reduced from one bucket of children
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRollup {
    pub bucket_ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<Decimal>,
    pub trade_count: Option<i64>,
    pub children: u32,
}

/// Reduce children (ascending by timestamp, prices valid) into one bucket
pub fn rollup_bucket(bucket_ts: DateTime<Utc>, children: &[Bar]) -> Option<BucketRollup> {
    let first = children.first()?;
    let last = children.last()?;
    let (open, _, _, _) = first.ohlc()?;
    let (_, _, _, close) = last.ohlc()?;

    let mut high = first.high?;
    let mut low = first.low?;
    let mut volume: Option<Decimal> = None;
    let mut trade_count: Option<i64> = None;
    for child in children {
        high = high.max(child.high?);
        low = low.min(child.low?);
        if let Some(v) = child.volume {
            volume = Some(volume.unwrap_or(Decimal::ZERO) + v);
        }
        if let Some(t) = child.trade_count {
            trade_count = Some(trade_count.unwrap_or(0) + t);
        }
    }

    Some(BucketRollup {
        bucket_ts,
        open,
        high,
        low,
        close,
        volume,
        trade_count,
        children: children.len() as u32,
    })
}

/// Children grouped per parent bucket after deduplication
#[derive(Debug, Default)]
pub struct BucketedChildren {
    pub buckets: BTreeMap<DateTime<Utc>, Vec<Bar>>,
    /// Children dropped for a missing or non-positive price
    pub invalid: usize,
}

/// Group timestamp-ordered child bars of one symbol into `timeframe` buckets.
///
/// When two children share a timestamp the later arrival wins. Bucket sizes
/// count deduplicated children with valid prices, not stored rows.
pub fn bucket_children(bars: Vec<Bar>, timeframe: Timeframe) -> BucketedChildren {
    let mut by_ts: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
    for bar in bars {
        by_ts.insert(bar.ts_utc, bar);
    }

    let mut grouped = BucketedChildren::default();
    for (ts, bar) in by_ts {
        if !bar.has_valid_prices() {
            grouped.invalid += 1;
            continue;
        }
        grouped
            .buckets
            .entry(timeframe.get_bar_boundary(ts))
            .or_default()
            .push(bar);
    }
    grouped
}

#[derive(Debug, Clone)]
pub struct AggregationRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window: TimeWindow,
    pub policy: CoveragePolicy,
    pub derivation_version: u32,
    /// Table holding the 1m children: raw for ingested symbols, derived for the synthetic index
    pub child_table: BarTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationOutcome {
    pub success: bool,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub policy: CoveragePolicy,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub complete_buckets: usize,
    pub partial_buckets: usize,
    /// Buckets written but below the policy's floor
    pub defective_buckets: Vec<DateTime<Utc>>,
    pub invalid_children: usize,
    pub write_state: WriteState,
    pub error: Option<String>,
}

impl AggregationOutcome {
    fn empty(request: &AggregationRequest) -> Self {
        AggregationOutcome {
            success: false,
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
            policy: request.policy,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            complete_buckets: 0,
            partial_buckets: 0,
            defective_buckets: Vec::new(),
            invalid_children: 0,
            write_state: WriteState::NothingWritten,
            error: None,
        }
    }

    fn failed(mut self, message: String) -> Self {
        self.success = false;
        self.error = Some(message);
        self
    }
}

/// Rows built for one request plus bucket statistics
#[derive(Debug, Default)]
pub struct BuiltRollup {
    pub rows: Vec<DerivedBar>,
    pub complete: usize,
    pub partial: usize,
    pub defective: Vec<DateTime<Utc>>,
    pub invalid_children: usize,
}

/// Build derived rows from raw children. Pure: same input, same rows.
pub fn build_rollup(children: Vec<Bar>, request: &AggregationRequest, ratio: u32) -> BuiltRollup {
    let grouped = bucket_children(children, request.timeframe);
    let mut built = BuiltRollup {
        invalid_children: grouped.invalid,
        ..BuiltRollup::default()
    };
    let now = Utc::now();

    for (bucket_ts, members) in grouped.buckets {
        if !request.window.contains(bucket_ts) {
            continue;
        }
        let Some(rollup) = rollup_bucket(bucket_ts, &members) else {
            continue;
        };
        let n = rollup.children;
        if n >= ratio {
            built.complete += 1;
        } else {
            built.partial += 1;
        }
        if !request.policy.accepts(n, ratio) {
            built.defective.push(bucket_ts);
        }

        built.rows.push(DerivedBar {
            bar: Bar {
                symbol: request.symbol.clone(),
                timeframe: request.timeframe,
                ts_utc: bucket_ts,
                open: Some(rollup.open),
                high: Some(rollup.high),
                low: Some(rollup.low),
                close: Some(rollup.close),
                volume: rollup.volume,
                trade_count: rollup.trade_count,
                vwap: None,
                source: AGGREGATED_SOURCE.to_string(),
                ingested_at: now,
                raw: Some(json!({
                    "kind": "rollup",
                    "children": n,
                    "expected": ratio,
                    "version": request.derivation_version,
                })),
            },
            derivation_version: request.derivation_version,
            quality_score: Some((Decimal::from(n) / Decimal::from(ratio)).round_dp(6)),
        });
    }
    built
}

/// Writes aggregated bars for one symbol/timeframe through the bar store
pub struct AggregationEngine {
    store: Arc<dyn BarStore>,
    batch_size: usize,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn BarStore>, batch_size: usize) -> Self {
        AggregationEngine {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn compute(&self, request: &AggregationRequest) -> AggregationOutcome {
        let mut outcome = AggregationOutcome::empty(request);

        let Some((child_tf, ratio)) = request.timeframe.child_spec() else {
            return outcome.failed(format!("{} is not a derived timeframe", request.timeframe));
        };

        // Whole buckets only: widen the window to the enclosing boundaries
        let window = TimeWindow {
            from: request.timeframe.get_bar_boundary(request.window.from),
            to: request.timeframe.get_bar_ceiling(request.window.to),
        };
        let expanded = AggregationRequest {
            window,
            ..request.clone()
        };

        let query = SeriesQuery::new(request.child_table, child_tf, window).with_symbols(SymbolSet::single(&request.symbol));
        let children = match self.store.range_query(&query).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Aggregation read failed for {} {}: {}", request.symbol, request.timeframe, e);
                return outcome.failed(format!("failed to read {} children: {}", child_tf, e));
            }
        };

        let built = build_rollup(children, &expanded, ratio);
        outcome.complete_buckets = built.complete;
        outcome.partial_buckets = built.partial;
        outcome.invalid_children = built.invalid_children;
        outcome.defective_buckets = built.defective;

        if outcome.invalid_children > 0 {
            warn!(
                "{} {}: excluded {} children with missing or non-positive prices",
                request.symbol, request.timeframe, outcome.invalid_children
            );
        }

        for batch in built.rows.chunks(self.batch_size) {
            match self.store.upsert(batch).await {
                Ok(written) => {
                    outcome.inserted += written.inserted;
                    outcome.updated += written.updated;
                    outcome.unchanged += written.unchanged;
                    debug!(
                        "{} {} batch: {} inserted, {} updated",
                        request.symbol, request.timeframe, written.inserted, written.updated
                    );
                }
                Err(e) => {
                    outcome.write_state = if outcome.inserted + outcome.updated > 0 {
                        WriteState::PartiallyWritten
                    } else {
                        WriteState::NothingWritten
                    };
                    warn!(
                        "Aggregation write failed for {} {} ({:?}): {}",
                        request.symbol, request.timeframe, outcome.write_state, e
                    );
                    return outcome.failed(format!("upsert failed: {}", e));
                }
            }
        }

        outcome.success = true;
        outcome.write_state = WriteState::Complete;
        info!(
            "Aggregated {} {} [{}]: {} inserted, {} updated, {} unchanged, {} partial, {} defective",
            request.symbol,
            request.timeframe,
            request.policy.as_str(),
            outcome.inserted,
            outcome.updated,
            outcome.unchanged,
            outcome.partial_buckets,
            outcome.defective_buckets.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryBarStore;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0).unwrap()
    }

    fn child(minute: i64, o: Decimal, h: Decimal, l: Decimal, c: Decimal, v: Decimal) -> Bar {
        Bar::new("EURUSD", Timeframe::OneMinute, t0() + Duration::minutes(minute), o, h, l, c).with_volume(v)
    }

    fn five_children() -> Vec<Bar> {
        vec![
            child(0, dec!(1.1000), dec!(1.1010), dec!(1.0995), dec!(1.1005), dec!(10)),
            child(1, dec!(1.1005), dec!(1.1030), dec!(1.1001), dec!(1.1020), dec!(12)),
            child(2, dec!(1.1020), dec!(1.1025), dec!(1.0990), dec!(1.0998), dec!(7)),
            child(3, dec!(1.0998), dec!(1.1002), dec!(1.0993), dec!(1.1000), dec!(3)),
            child(4, dec!(1.1000), dec!(1.1008), dec!(1.0996), dec!(1.1007), dec!(8)),
        ]
    }

    fn request(policy: CoveragePolicy) -> AggregationRequest {
        AggregationRequest {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::FiveMinute,
            window: TimeWindow::new(t0(), t0() + Duration::minutes(5)).unwrap(),
            policy,
            derivation_version: 1,
            child_table: BarTable::Raw,
        }
    }

    async fn engine_with(children: Vec<Bar>) -> (AggregationEngine, MemoryBarStore) {
        let store = MemoryBarStore::new();
        store.append_raw(&children).await.unwrap();
        (AggregationEngine::new(Arc::new(store.clone()), 100), store)
    }

    async fn stored(store: &MemoryBarStore) -> Vec<DerivedBar> {
        let window = TimeWindow::new(t0(), t0() + Duration::days(1)).unwrap();
        store
            .range_query_derived(&SeriesQuery::new(BarTable::Derived, Timeframe::FiveMinute, window))
            .await
            .unwrap()
    }

    #[test]
    fn test_rollup_five_children() {
        let rollup = rollup_bucket(t0(), &five_children()).unwrap();
        assert_eq!(rollup.open, dec!(1.1000));
        assert_eq!(rollup.close, dec!(1.1007));
        assert_eq!(rollup.high, dec!(1.1030));
        assert_eq!(rollup.low, dec!(1.0990));
        assert_eq!(rollup.volume, Some(dec!(40)));
        assert_eq!(rollup.children, 5);
    }

    #[tokio::test]
    async fn test_complete_bucket_written() {
        let (engine, store) = engine_with(five_children()).await;
        let outcome = engine.compute(&request(CoveragePolicy::Strict)).await;

        assert!(outcome.success);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.complete_buckets, 1);
        assert!(outcome.defective_buckets.is_empty());

        let rows = stored(&store).await;
        assert_eq!(rows[0].bar.open, Some(dec!(1.1000)));
        assert_eq!(rows[0].bar.close, Some(dec!(1.1007)));
        assert_eq!(rows[0].bar.source, AGGREGATED_SOURCE);
        assert_eq!(rows[0].quality_score, Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_partial_bucket_policy() {
        let three: Vec<Bar> = five_children().into_iter().take(3).collect();

        let (engine, store) = engine_with(three.clone()).await;
        let strict = engine.compute(&request(CoveragePolicy::Strict)).await;
        assert!(strict.success);
        assert_eq!(strict.partial_buckets, 1);
        assert_eq!(strict.defective_buckets, vec![t0()]);
        assert_eq!(stored(&store).await[0].quality_score, Some(dec!(0.6)));

        let (engine, store) = engine_with(three).await;
        let relaxed = engine.compute(&request(CoveragePolicy::Relaxed { min_required: 3 })).await;
        assert!(relaxed.success);
        assert!(relaxed.defective_buckets.is_empty());
        let rows = stored(&store).await;
        assert_eq!(rows[0].quality_score, Some(dec!(0.6)));
        assert_eq!(rows[0].bar.close, Some(dec!(1.0998)));
    }

    #[tokio::test]
    async fn test_rerun_converges() {
        let (engine, store) = engine_with(five_children()).await;
        let first = engine.compute(&request(CoveragePolicy::Strict)).await;
        let before = stored(&store).await;

        let second = engine.compute(&request(CoveragePolicy::Strict)).await;
        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted + second.updated, 0);
        assert_eq!(second.unchanged, 1);

        let after = stored(&store).await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_bucket_not_synthesized() {
        let mut children = five_children();
        children.push(child(12, dec!(1.2), dec!(1.2), dec!(1.2), dec!(1.2), dec!(1)));
        let (engine, store) = engine_with(children).await;

        let mut req = request(CoveragePolicy::Strict);
        req.window = TimeWindow::new(t0(), t0() + Duration::minutes(15)).unwrap();
        let outcome = engine.compute(&req).await;

        // 09:00 complete, 09:05 empty, 09:10 partial
        assert_eq!(outcome.inserted, 2);
        let rows = stored(&store).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].bar.ts_utc, t0() + Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_children() {
        let mut children = five_children();
        // Later arrival at 09:04 replaces the earlier one
        children.push(child(4, dec!(1.1000), dec!(1.1040), dec!(1.0996), dec!(1.1039), dec!(8)));
        let mut broken = child(3, dec!(1.0998), dec!(1.1002), dec!(1.0993), dec!(1.1000), dec!(3));
        broken.low = Some(Decimal::ZERO);
        children.push(broken);

        let (engine, store) = engine_with(children).await;
        let outcome = engine.compute(&request(CoveragePolicy::Strict)).await;

        assert_eq!(outcome.invalid_children, 1);
        assert_eq!(outcome.defective_buckets, vec![t0()]);
        let rows = stored(&store).await;
        assert_eq!(rows[0].bar.close, Some(dec!(1.1039)));
        assert_eq!(rows[0].bar.high, Some(dec!(1.1040)));
        assert_eq!(rows[0].quality_score, Some(dec!(0.8)));
    }

    #[tokio::test]
    async fn test_window_expands_to_whole_buckets() {
        let (engine, store) = engine_with(five_children()).await;
        let mut req = request(CoveragePolicy::Strict);
        req.window = TimeWindow::new(t0() + Duration::minutes(2), t0() + Duration::minutes(3)).unwrap();

        let outcome = engine.compute(&req).await;
        assert_eq!(outcome.complete_buckets, 1);
        assert_eq!(stored(&store).await[0].bar.open, Some(dec!(1.1000)));
    }

    #[tokio::test]
    async fn test_write_failure_reports_state() {
        let memory = MemoryBarStore::new();
        let mut children = five_children();
        children.push(child(5, dec!(1.2), dec!(1.2), dec!(1.2), dec!(1.2), dec!(1)));
        memory.append_raw(&children).await.unwrap();

        let mut req = request(CoveragePolicy::Strict);
        req.window = TimeWindow::new(t0(), t0() + Duration::minutes(10)).unwrap();

        let none = AggregationEngine::new(Arc::new(FlakyStore::new(memory.clone()).failing_upserts_after(0)), 1);
        let outcome = none.compute(&req).await;
        assert!(!outcome.success);
        assert_eq!(outcome.write_state, WriteState::NothingWritten);
        assert!(outcome.error.is_some());

        let partial = AggregationEngine::new(Arc::new(FlakyStore::new(memory).failing_upserts_after(1)), 1);
        let outcome = partial.compute(&req).await;
        assert_eq!(outcome.write_state, WriteState::PartiallyWritten);
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_one_minute_is_not_derived() {
        let (engine, _) = engine_with(Vec::new()).await;
        let mut req = request(CoveragePolicy::Strict);
        req.timeframe = Timeframe::OneMinute;
        let outcome = engine.compute(&req).await;
        assert!(!outcome.success);
        assert_eq!(outcome.write_state, WriteState::NothingWritten);
    }
}
