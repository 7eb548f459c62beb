/// Checks relating derived bars to their children and the synthetic index to its components
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::data::{bucket_children, rollup_bucket, CoveragePolicy, Timeframe};
use crate::error::CheckError;
use crate::store::{BarTable, ScanOrder, SeriesQuery};
use crate::types::{Bar, SymbolSet, TimeWindow};
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult, Finding, Scope, ScopeSymbols};

fn child_spec(timeframe: Timeframe) -> Result<(Timeframe, u32), CheckError> {
    timeframe
        .child_spec()
        .ok_or_else(|| CheckError::Invalid(format!("{} has no child timeframe", timeframe)))
}

/// Run window widened to whole `timeframe` buckets
fn bucket_window(ctx: &CheckContext, timeframe: Timeframe) -> TimeWindow {
    TimeWindow {
        from: timeframe.get_bar_boundary(ctx.window.from),
        to: timeframe.get_bar_ceiling(ctx.window.to),
    }
}

/// `|derived - actual| <= |actual| * rel + abs`
pub fn within_tolerance(derived: Option<Decimal>, actual: Decimal, rel: Decimal, abs: Decimal) -> bool {
    match derived {
        Some(d) => (d - actual).abs() <= actual.abs() * rel + abs,
        None => false,
    }
}

/// Stored derived bars vs recomputation from a full set of children.
///
/// Children of ingested symbols are raw 1m bars; children of the synthetic
/// index are its own derived 1m bars.
pub struct CrossTimeframeCheck {
    name: String,
    timeframe: Timeframe,
    children_table: BarTable,
    symbols: ScopeSymbols,
    flag: String,
}

impl CrossTimeframeCheck {
    pub fn new(name: &str, timeframe: Timeframe, flag: &str) -> Self {
        CrossTimeframeCheck {
            name: name.to_string(),
            timeframe,
            children_table: BarTable::Raw,
            symbols: ScopeSymbols::Active,
            flag: flag.to_string(),
        }
    }

    /// Compare the synthetic symbol's rollups against its derived 1m bars
    pub fn for_synthetic(mut self) -> Self {
        self.children_table = BarTable::Derived;
        self.symbols = ScopeSymbols::Synthetic;
        self
    }
}

#[async_trait]
impl Check for CrossTimeframeCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::CrossTimeframeConsistency
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let (child_tf, ratio) = child_spec(self.timeframe)?;
        let window = bucket_window(ctx, self.timeframe);
        let rel = ctx.config.cross_tf_rel_tolerance;
        let abs = ctx.config.cross_tf_abs_tolerance;
        let children_scope = Scope {
            table: self.children_table,
            timeframe: child_tf,
            symbols: self.symbols.clone(),
        };
        let derived_scope = Scope {
            table: BarTable::Derived,
            timeframe: self.timeframe,
            symbols: self.symbols.clone(),
        };

        let mut result = CheckResult::new();
        let (mut compared_total, mut mismatched_total) = (0usize, 0usize);

        for symbol in children_scope.resolve_symbols(ctx).await? {
            let (mut compared, mut mismatched) = (0usize, 0usize);
            let mut first_mismatch = None;

            // Slices start on a bucket boundary and span whole days, so no bucket is split
            for page in ctx.pages(window) {
                let children = children_scope.load(ctx, &symbol, page, ScanOrder::Arrival).await?;
                let grouped = bucket_children(children, self.timeframe);
                let stored: HashMap<DateTime<Utc>, Bar> = derived_scope
                    .load(ctx, &symbol, page, ScanOrder::Arrival)
                    .await?
                    .into_iter()
                    .map(|b| (b.ts_utc, b))
                    .collect();

                for (bucket_ts, members) in &grouped.buckets {
                    if members.len() as u32 != ratio {
                        continue;
                    }
                    let (Some(actual), Some(derived)) = (rollup_bucket(*bucket_ts, members), stored.get(bucket_ts))
                    else {
                        continue;
                    };
                    compared += 1;
                    let agrees = within_tolerance(derived.open, actual.open, rel, abs)
                        && within_tolerance(derived.high, actual.high, rel, abs)
                        && within_tolerance(derived.low, actual.low, rel, abs)
                        && within_tolerance(derived.close, actual.close, rel, abs);
                    if !agrees {
                        mismatched += 1;
                        first_mismatch.get_or_insert(*bucket_ts);
                    }
                }
            }

            compared_total += compared;
            mismatched_total += mismatched;
            if mismatched > 0 {
                result.push(
                    Finding::new(&symbol, Some(self.timeframe))
                        .with("mismatched_bars", mismatched)
                        .with("buckets_compared", compared)
                        .with("first_mismatch_ts", first_mismatch),
                );
            }
        }

        result.summarize("children_table", self.children_table.as_str());
        result.summarize("buckets_compared", compared_total);
        result.summarize("mismatched_bars", mismatched_total);
        result.flag(&self.flag, mismatched_total > 0);
        Ok(result)
    }
}

/// Child counts per bucket measured against a coverage policy
pub struct AggregationCoverageCheck {
    name: String,
    timeframe: Timeframe,
    policy: CoveragePolicy,
    flag: String,
}

impl AggregationCoverageCheck {
    pub fn new(name: &str, timeframe: Timeframe, policy: CoveragePolicy, flag: &str) -> Self {
        AggregationCoverageCheck {
            name: name.to_string(),
            timeframe,
            policy,
            flag: flag.to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BucketCoverage {
    pub total: usize,
    pub bad: usize,
    pub partial: usize,
    /// Empty buckets between the first and last populated one
    pub missing: usize,
}

pub fn bucket_coverage(
    counts: &BTreeMap<DateTime<Utc>, u32>,
    timeframe: Timeframe,
    policy: CoveragePolicy,
    ratio: u32,
) -> BucketCoverage {
    let mut coverage = BucketCoverage {
        total: counts.len(),
        ..BucketCoverage::default()
    };
    for n in counts.values() {
        if !policy.accepts(*n, ratio) {
            coverage.bad += 1;
        }
        if *n > 0 && *n < ratio {
            coverage.partial += 1;
        }
    }
    if let (Some(first), Some(last)) = (counts.keys().next(), counts.keys().next_back()) {
        let span = (*last - *first).num_minutes() / timeframe.duration_minutes() + 1;
        coverage.missing = (span as usize).saturating_sub(counts.len());
    }
    coverage
}

#[async_trait]
impl Check for AggregationCoverageCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::AggregationCoverage
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let (child_tf, ratio) = child_spec(self.timeframe)?;
        let window = bucket_window(ctx, self.timeframe);
        let children_scope = Scope {
            table: BarTable::Raw,
            timeframe: child_tf,
            symbols: ScopeSymbols::Active,
        };

        let mut result = CheckResult::new();
        let mut bad_total = 0usize;

        for symbol in children_scope.resolve_symbols(ctx).await? {
            let mut counts: BTreeMap<DateTime<Utc>, u32> = BTreeMap::new();
            for page in ctx.pages(window) {
                let children = children_scope.load(ctx, &symbol, page, ScanOrder::Arrival).await?;
                counts.extend(
                    bucket_children(children, self.timeframe)
                        .buckets
                        .into_iter()
                        // The bucket still being filled is not judged
                        .filter(|(ts, _)| *ts + self.timeframe.duration() <= ctx.now)
                        .map(|(ts, members)| (ts, members.len() as u32)),
                );
            }
            let coverage = bucket_coverage(&counts, self.timeframe, self.policy, ratio);

            if coverage.bad > 0 {
                bad_total += coverage.bad;
                result.push(
                    Finding::new(&symbol, Some(self.timeframe))
                        .with("policy", self.policy.as_str())
                        .with("min_required", self.policy.required(ratio) as i64)
                        .with("bad_buckets", coverage.bad)
                        .with("partial_buckets", coverage.partial)
                        .with("missing_buckets", coverage.missing)
                        .with("total_buckets", coverage.total),
                );
            }
        }

        result.findings.sort_by(|a, b| {
            let bad = |f: &Finding| f.get_metric("bad_buckets").and_then(|m| m.as_i64()).unwrap_or(0);
            bad(b).cmp(&bad(a)).then_with(|| a.symbol.cmp(&b.symbol))
        });
        result.summarize("bad_buckets", bad_total);
        result.flag(&self.flag, bad_total > 0);
        Ok(result)
    }
}

/// The synthetic symbol has at least one bar at `timeframe` in the window
pub struct SyntheticPresenceCheck {
    name: String,
    timeframe: Timeframe,
    flag: String,
}

impl SyntheticPresenceCheck {
    pub fn new(name: &str, timeframe: Timeframe, flag: &str) -> Self {
        SyntheticPresenceCheck {
            name: name.to_string(),
            timeframe,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for SyntheticPresenceCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::SyntheticPresence
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let symbol = ctx.get_synthetic_symbol();
        let extent = Scope::synthetic(self.timeframe).extent(ctx, symbol, ctx.window).await?;

        let mut result = CheckResult::new();
        result.push(
            Finding::new(symbol, Some(self.timeframe))
                .with("bars", extent.bars)
                .with("min_ts", extent.first_ts)
                .with("max_ts", extent.last_ts),
        );
        result.flag(&self.flag, extent.bars == 0);
        Ok(result)
    }
}

/// Synthetic minutes whose component set is incomplete or invalid
pub struct ComponentDependencyCheck {
    name: String,
    flag: String,
}

impl ComponentDependencyCheck {
    pub fn new(name: &str, flag: &str) -> Self {
        ComponentDependencyCheck {
            name: name.to_string(),
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for ComponentDependencyCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::ComponentDependency
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let symbol = ctx.get_synthetic_symbol();
        let components = ctx.synthetic.component_symbols();
        let (mut broken, mut checked) = (0usize, 0usize);

        for page in ctx.pages(ctx.window) {
            let index_minutes: Vec<DateTime<Utc>> = Scope::synthetic(Timeframe::OneMinute)
                .load(ctx, symbol, page, ScanOrder::Timestamp)
                .await?
                .into_iter()
                .map(|b| b.ts_utc)
                .collect();
            if index_minutes.is_empty() {
                continue;
            }

            let query = SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, page)
                .with_symbols(SymbolSet::Only(components.clone()));
            let mut valid: HashMap<DateTime<Utc>, HashSet<String>> = HashMap::new();
            for bar in ctx.store.range_query(&query).await? {
                if bar.close.is_some_and(|c| c > Decimal::ZERO) {
                    valid.entry(bar.ts_utc).or_default().insert(bar.symbol);
                }
            }

            checked += index_minutes.len();
            broken += index_minutes
                .iter()
                .filter(|ts| {
                    valid
                        .get(*ts)
                        .map_or(true, |present| components.iter().any(|c| !present.contains(c)))
                })
                .count();
        }

        let mut result = CheckResult::new();
        result.push(
            Finding::new(symbol, Some(Timeframe::OneMinute))
                .with("minutes_with_missing_or_invalid_components", broken)
                .with("total_minutes_checked", checked),
        );
        result.flag(&self.flag, broken > 0);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AggregationEngine, AggregationRequest};
    use crate::store::{BarStore, MemoryBarStore};
    use crate::types::DerivedBar;
    use crate::verify::check::MetricValue;
    use crate::verify::checks::fixtures::{bar, context, now};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn noon() -> DateTime<Utc> {
        now() - Duration::hours(2)
    }

    fn minute_bars(symbol: &str, minutes: &[i64]) -> Vec<Bar> {
        minutes
            .iter()
            .map(|m| {
                let price = dec!(1.0800) + Decimal::new(*m, 4);
                bar(symbol, noon() + Duration::minutes(*m), price)
            })
            .collect()
    }

    #[test]
    fn test_tolerance_bounds() {
        let rel = dec!(0.0001);
        let abs = dec!(0.000001);
        assert!(within_tolerance(Some(dec!(100.009)), dec!(100), rel, abs));
        assert!(!within_tolerance(Some(dec!(100.02)), dec!(100), rel, abs));
        assert!(!within_tolerance(None, dec!(100), rel, abs));
    }

    #[test]
    fn test_bucket_coverage_counts() {
        let counts: BTreeMap<DateTime<Utc>, u32> = [(0, 5), (5, 3), (15, 1)]
            .into_iter()
            .map(|(m, n)| (noon() + Duration::minutes(m), n))
            .collect();

        let strict = bucket_coverage(&counts, Timeframe::FiveMinute, CoveragePolicy::Strict, 5);
        assert_eq!(
            strict,
            BucketCoverage {
                total: 3,
                bad: 2,
                partial: 2,
                missing: 1,
            }
        );

        let relaxed = bucket_coverage(&counts, Timeframe::FiveMinute, CoveragePolicy::Relaxed { min_required: 3 }, 5);
        assert_eq!(relaxed.bad, 1);
    }

    #[tokio::test]
    async fn test_cross_timeframe_only_compares_full_buckets() {
        let memory = MemoryBarStore::new();
        let mut minutes: Vec<i64> = (0..10).collect();
        minutes.extend([10, 11, 12]);
        memory.append_raw(&minute_bars("EURUSD", &minutes)).await.unwrap();

        let store: Arc<dyn BarStore> = Arc::new(memory.clone());
        let engine = AggregationEngine::new(store.clone(), 100);
        let outcome = engine
            .compute(&AggregationRequest {
                symbol: "EURUSD".to_string(),
                timeframe: Timeframe::FiveMinute,
                window: TimeWindow::new(noon(), noon() + Duration::minutes(15)).unwrap(),
                policy: CoveragePolicy::Relaxed { min_required: 3 },
                derivation_version: 1,
                child_table: BarTable::Raw,
            })
            .await;
        assert_eq!(outcome.inserted, 3);

        // Corrupt one full bucket and the partial one
        let query = SeriesQuery::new(BarTable::Derived, Timeframe::FiveMinute, TimeWindow::last_days(now(), 1));
        let mut rows: Vec<DerivedBar> = memory.range_query_derived(&query).await.unwrap();
        for row in rows.iter_mut().skip(1) {
            row.bar.close = Some(dec!(9.99));
        }
        memory.upsert(&rows).await.unwrap();

        let ctx = context(store, &["EURUSD"]);
        let result = CrossTimeframeCheck::new("cross_timeframe_5m", Timeframe::FiveMinute, "cross_timeframe_mismatch")
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(result.get_summary("buckets_compared"), Some(&MetricValue::Int(2)));
        assert_eq!(result.get_summary("mismatched_bars"), Some(&MetricValue::Int(1)));
        assert_eq!(
            result.findings[0].get_metric("first_mismatch_ts"),
            Some(&MetricValue::Timestamp(noon() + Duration::minutes(5)))
        );
    }

    async fn roll_up(store: Arc<dyn BarStore>, symbol: &str, timeframe: Timeframe, child_table: BarTable) {
        let outcome = AggregationEngine::new(store, 100)
            .compute(&AggregationRequest {
                symbol: symbol.to_string(),
                timeframe,
                window: TimeWindow::new(noon(), noon() + timeframe.duration()).unwrap(),
                policy: CoveragePolicy::Strict,
                derivation_version: 1,
                child_table,
            })
            .await;
        assert_eq!(outcome.inserted, 1);
    }

    async fn tamper_close(memory: &MemoryBarStore, timeframe: Timeframe) {
        let query = SeriesQuery::new(BarTable::Derived, timeframe, TimeWindow::last_days(now(), 1));
        let mut rows: Vec<DerivedBar> = memory.range_query_derived(&query).await.unwrap();
        for row in rows.iter_mut() {
            row.bar.close = Some(dec!(9.99));
        }
        memory.upsert(&rows).await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_timeframe_flags_tampered_hour_bar() {
        let memory = MemoryBarStore::new();
        let minutes: Vec<i64> = (0..60).collect();
        memory.append_raw(&minute_bars("EURUSD", &minutes)).await.unwrap();
        let store: Arc<dyn BarStore> = Arc::new(memory.clone());
        roll_up(store.clone(), "EURUSD", Timeframe::OneHour, BarTable::Raw).await;

        let mut ctx = context(store, &["EURUSD"]);
        let mut config = ctx.config.as_ref().clone();
        config.scan_page_days = 1;
        ctx.config = Arc::new(config);
        let check = CrossTimeframeCheck::new("cross_timeframe_1h", Timeframe::OneHour, "cross_timeframe_mismatch");

        let clean = check.run(&ctx).await.unwrap();
        assert_eq!(clean.get_summary("buckets_compared"), Some(&MetricValue::Int(1)));
        assert!(!clean.is_flagged());

        tamper_close(&memory, Timeframe::OneHour).await;
        let result = check.run(&ctx).await.unwrap();
        assert_eq!(result.get_summary("mismatched_bars"), Some(&MetricValue::Int(1)));
        assert_eq!(
            result.findings[0].get_metric("first_mismatch_ts"),
            Some(&MetricValue::Timestamp(noon()))
        );
        assert_eq!(result.flags.get("cross_timeframe_mismatch"), Some(&true));
    }

    #[tokio::test]
    async fn test_synthetic_cross_timeframe_reads_derived_children() {
        let memory = MemoryBarStore::new();
        let index: Vec<DerivedBar> = (0..5)
            .map(|m| DerivedBar {
                bar: bar("DXY", noon() + Duration::minutes(m), dec!(104) + Decimal::new(m, 2)),
                derivation_version: 1,
                quality_score: None,
            })
            .collect();
        memory.upsert(&index).await.unwrap();
        let store: Arc<dyn BarStore> = Arc::new(memory.clone());
        roll_up(store.clone(), "DXY", Timeframe::FiveMinute, BarTable::Derived).await;

        let ctx = context(store, &["EURUSD"]);
        let check = CrossTimeframeCheck::new(
            "synthetic_cross_timeframe_5m",
            Timeframe::FiveMinute,
            "dxy_cross_timeframe_mismatch",
        )
        .for_synthetic();
        assert!(!check.run(&ctx).await.unwrap().is_flagged());

        tamper_close(&memory, Timeframe::FiveMinute).await;
        let result = check.run(&ctx).await.unwrap();
        assert_eq!(result.get_summary("children_table"), Some(&MetricValue::Text("derived".to_string())));
        assert_eq!(result.get_summary("mismatched_bars"), Some(&MetricValue::Int(1)));
        assert_eq!(result.findings[0].symbol, "DXY");
        assert_eq!(result.flags.get("dxy_cross_timeframe_mismatch"), Some(&true));

        // The raw-children variant never looks at the synthetic symbol
        let raw = CrossTimeframeCheck::new("cross_timeframe_5m", Timeframe::FiveMinute, "cross_timeframe_mismatch")
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(raw.get_summary("buckets_compared"), Some(&MetricValue::Int(0)));
    }

    #[tokio::test]
    async fn test_aggregation_coverage_ignores_open_bucket() {
        let store = MemoryBarStore::new();
        // 5 + 3 children, an empty bucket, 1 child, then a bar in the bucket still filling
        let mut minutes: Vec<i64> = vec![0, 1, 2, 3, 4, 5, 6, 7, 15];
        minutes.push(120);
        store.append_raw(&minute_bars("EURUSD", &minutes)).await.unwrap();
        let ctx = context(Arc::new(store), &["EURUSD"]);

        let strict = AggregationCoverageCheck::new(
            "aggregation_coverage_5m",
            Timeframe::FiveMinute,
            CoveragePolicy::Strict,
            "bad_5m_coverage_strict",
        )
        .run(&ctx)
        .await
        .unwrap();
        let row = &strict.findings[0];
        assert_eq!(row.get_metric("bad_buckets"), Some(&MetricValue::Int(2)));
        assert_eq!(row.get_metric("missing_buckets"), Some(&MetricValue::Int(1)));
        assert_eq!(row.get_metric("total_buckets"), Some(&MetricValue::Int(3)));
        assert!(strict.is_flagged());

        let relaxed = AggregationCoverageCheck::new(
            "aggregation_coverage_5m",
            Timeframe::FiveMinute,
            CoveragePolicy::Relaxed { min_required: 3 },
            "bad_5m_coverage_strict",
        )
        .run(&ctx)
        .await
        .unwrap();
        assert_eq!(relaxed.get_summary("bad_buckets"), Some(&MetricValue::Int(1)));
    }

    #[tokio::test]
    async fn test_synthetic_presence() {
        let store = MemoryBarStore::new();
        let ctx = context(Arc::new(store.clone()), &[]);
        let check = SyntheticPresenceCheck::new("synthetic_presence_1m", Timeframe::OneMinute, "dxy_missing_data");
        assert!(check.run(&ctx).await.unwrap().is_flagged());

        store
            .upsert(&[DerivedBar {
                bar: bar("DXY", noon(), dec!(104)),
                derivation_version: 1,
                quality_score: None,
            }])
            .await
            .unwrap();
        let result = check.run(&ctx).await.unwrap();
        assert!(!result.is_flagged());
        assert_eq!(result.findings[0].get_metric("bars"), Some(&MetricValue::Int(1)));
    }

    #[tokio::test]
    async fn test_component_dependency_counts_broken_minutes() {
        let store = MemoryBarStore::new();
        let components = crate::data::IndexDefinition::dxy().component_symbols();
        let mut raw = Vec::new();
        for (offset, skip, zero) in [(0, None, None), (1, Some("USDCHF"), None), (2, None, Some("USDSEK"))] {
            let ts = noon() + Duration::minutes(offset);
            for symbol in &components {
                if Some(symbol.as_str()) == skip {
                    continue;
                }
                let price = if Some(symbol.as_str()) == zero { dec!(0) } else { dec!(1.1) };
                raw.push(bar(symbol, ts, price));
            }
        }
        store.append_raw(&raw).await.unwrap();
        let index: Vec<DerivedBar> = (0..3)
            .map(|m| DerivedBar {
                bar: bar("DXY", noon() + Duration::minutes(m), dec!(104)),
                derivation_version: 1,
                quality_score: None,
            })
            .collect();
        store.upsert(&index).await.unwrap();

        let ctx = context(Arc::new(store), &[]);
        let result = ComponentDependencyCheck::new("component_dependency", "dxy_component_dependency_fail")
            .run(&ctx)
            .await
            .unwrap();
        let row = &result.findings[0];
        assert_eq!(row.get_metric("minutes_with_missing_or_invalid_components"), Some(&MetricValue::Int(2)));
        assert_eq!(row.get_metric("total_minutes_checked"), Some(&MetricValue::Int(3)));
        assert!(result.is_flagged());
    }
}
