/// Historical coverage guardrail and expected-vs-actual bar counts
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::data::Timeframe;
use crate::error::CheckError;
use crate::store::BarTable;
use crate::types::{SymbolSet, TimeWindow};
use crate::utils::{expected_bar_count, years_before};
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult, Finding, Scope};

pub const GUARDRAIL_PASSED: &str = "sufficient_coverage";

/// Earliest raw 1m bar must reach back to `now - hist_years + grace`.
///
/// A store error is reported as a failed guardrail rather than a check
/// failure: an unreadable history is not a covered history.
pub struct CoverageGuardrailCheck {
    name: String,
    flag: String,
}

impl CoverageGuardrailCheck {
    pub fn new(name: &str, flag: &str) -> Self {
        CoverageGuardrailCheck {
            name: name.to_string(),
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for CoverageGuardrailCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::CoverageGuardrail
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let years = ctx.config.hist_years;
        let required = years_before(ctx.now, years) + Duration::days(ctx.config.coverage_grace_days);
        let symbols = if ctx.symbols.is_empty() {
            SymbolSet::All
        } else {
            SymbolSet::Only(ctx.symbols.as_ref().clone())
        };

        let mut result = CheckResult::new();
        let earliest = match ctx.store.earliest_ts(BarTable::Raw, Timeframe::OneMinute, &symbols).await {
            Ok(earliest) => earliest,
            Err(e) => {
                warn!("Coverage guardrail query failed: {}", e);
                result.summarize("query_error", e.to_string());
                None
            }
        };
        let passed = earliest.is_some_and(|ts| ts <= required);

        if passed {
            info!("✓ Historical coverage sufficient (earliest {:?})", earliest);
        } else {
            warn!(
                "⚠️ Insufficient historical coverage: earliest {:?}, required <= {} for {} years",
                earliest, required, years
            );
        }

        result.summarize("earliest_ts", earliest);
        result.summarize("required_min_ts", required);
        result.summarize("requested_years", years as i64);
        result.summarize("grace_days", ctx.config.coverage_grace_days);
        result.summarize(GUARDRAIL_PASSED, passed);
        result.flag(&self.flag, !passed);
        Ok(result)
    }
}

/// Per-symbol bar totals against the count a gapless series would have,
/// from the first stored bar through `now`. Totals come from the store's
/// aggregate query so a multi-year series is never loaded.
/// Informational: contributes no flag.
pub struct BarCountsCheck {
    name: String,
    scope: Scope,
}

impl BarCountsCheck {
    pub fn new(name: &str, scope: Scope) -> Self {
        BarCountsCheck {
            name: name.to_string(),
            scope,
        }
    }
}

#[async_trait]
impl Check for BarCountsCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::BarCounts
    }

    fn flag_names(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let step = self.scope.timeframe.duration();
        let mut result = CheckResult::new();

        let whole_series = TimeWindow::until(ctx.window.to);

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let extent = self.scope.extent(ctx, &symbol, whole_series).await?;
            let (Some(first), Some(last)) = (extent.first_ts, extent.last_ts) else {
                result.push(Finding::new(&symbol, Some(self.scope.timeframe)).with("bars", 0usize));
                continue;
            };

            let actual = extent.bars;
            let expected = expected_bar_count(first, ctx.now, step);
            let coverage_pct = if expected > 0 {
                Some((Decimal::from(actual) * Decimal::ONE_HUNDRED / Decimal::from(expected)).round_dp(2))
            } else {
                None
            };
            result.push(
                Finding::new(&symbol, Some(self.scope.timeframe))
                    .with("bars", actual)
                    .with("first_ts", first)
                    .with("last_ts", last)
                    .with("expected_bars", expected)
                    .with("missing_bars", expected - actual)
                    .with("coverage_pct", coverage_pct),
            );
        }

        // Thinnest series first
        result.findings.sort_by(|a, b| {
            let bars = |f: &Finding| f.get_metric("bars").and_then(|m| m.as_i64()).unwrap_or(0);
            bars(a).cmp(&bars(b)).then_with(|| a.symbol.cmp(&b.symbol))
        });
        result.summarize("table", self.scope.table.as_str());
        result.summarize("symbols", result.findings.len());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::{BarStore, MemoryBarStore};
    use crate::types::DerivedBar;
    use crate::verify::check::MetricValue;
    use crate::verify::checks::fixtures::{bar, context, minutes_ago, now};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn historical(ctx: crate::verify::check::CheckContext) -> crate::verify::check::CheckContext {
        let mut ctx = ctx;
        ctx.window = TimeWindow::last_years(now(), ctx.config.hist_years);
        ctx
    }

    #[tokio::test]
    async fn test_guardrail_fails_on_one_year_of_history() {
        let store = MemoryBarStore::new();
        store
            .append_raw(&[bar("EURUSD", now() - Duration::days(365), dec!(1.1))])
            .await
            .unwrap();
        let ctx = historical(context(Arc::new(store), &["EURUSD"]));

        let result = CoverageGuardrailCheck::new("coverage_guardrail", "insufficient_historical_coverage")
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(result.flags.get("insufficient_historical_coverage"), Some(&true));
        assert_eq!(result.get_summary(GUARDRAIL_PASSED), Some(&MetricValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_guardrail_grace_period() {
        let store = MemoryBarStore::new();
        // Three years minus five days: inside the seven-day grace
        let earliest = years_before(now(), 3) + Duration::days(5);
        store.append_raw(&[bar("EURUSD", earliest, dec!(1.1))]).await.unwrap();
        let ctx = historical(context(Arc::new(store), &["EURUSD"]));

        let result = CoverageGuardrailCheck::new("coverage_guardrail", "insufficient_historical_coverage")
            .run(&ctx)
            .await
            .unwrap();
        assert!(!result.is_flagged());
        assert_eq!(result.get_summary("earliest_ts"), Some(&MetricValue::Timestamp(earliest)));
    }

    #[tokio::test]
    async fn test_guardrail_without_data_fails() {
        let ctx = historical(context(Arc::new(FlakyStore::default()), &[]));
        let result = CoverageGuardrailCheck::new("coverage_guardrail", "insufficient_historical_coverage")
            .run(&ctx)
            .await
            .unwrap();
        assert!(result.is_flagged());
        assert_eq!(result.get_summary("earliest_ts"), Some(&MetricValue::Missing));
    }

    #[tokio::test]
    async fn test_bar_counts_expected_vs_actual() {
        let store = MemoryBarStore::new();
        // 10 minutes of history with 2 missing bars
        let bars: Vec<_> = [9, 8, 7, 6, 4, 3, 2, 0]
            .iter()
            .map(|m| bar("EURUSD", minutes_ago(*m), dec!(1.1)))
            .collect();
        store.append_raw(&bars).await.unwrap();
        let ctx = context(Arc::new(store), &["EURUSD", "USDJPY"]);

        let result = BarCountsCheck::new("bar_counts_raw_1m", Scope::raw_1m()).run(&ctx).await.unwrap();
        assert!(result.flags.is_empty());
        assert_eq!(result.findings[0].symbol, "USDJPY");
        let eur = &result.findings[1];
        assert_eq!(eur.get_metric("bars"), Some(&MetricValue::Int(8)));
        assert_eq!(eur.get_metric("expected_bars"), Some(&MetricValue::Int(10)));
        assert_eq!(eur.get_metric("missing_bars"), Some(&MetricValue::Int(2)));
        assert_eq!(eur.get_metric("coverage_pct"), Some(&MetricValue::Decimal(dec!(80))));
    }

    fn derived_bar(symbol: &str, timeframe: Timeframe, ts: chrono::DateTime<chrono::Utc>) -> DerivedBar {
        let price = dec!(1.1);
        DerivedBar {
            bar: crate::types::Bar::new(symbol, timeframe, ts, price, price, price, price),
            derivation_version: 1,
            quality_score: Some(dec!(1)),
        }
    }

    #[tokio::test]
    async fn test_bar_counts_for_derived_aggregates() {
        let store = MemoryBarStore::new();
        // One hour of 5m buckets with the 15m and 40m buckets missing
        let rows: Vec<DerivedBar> = (0..=12)
            .filter(|i| *i != 3 && *i != 8)
            .map(|i| derived_bar("EURUSD", Timeframe::FiveMinute, minutes_ago(60 - i * 5)))
            .collect();
        store.upsert(&rows).await.unwrap();
        let ctx = context(Arc::new(store), &["EURUSD"]);

        let result = BarCountsCheck::new("bar_counts_derived_5m", Scope::derived(Timeframe::FiveMinute))
            .run(&ctx)
            .await
            .unwrap();
        assert!(result.flags.is_empty());
        assert_eq!(result.get_summary("table"), Some(&MetricValue::Text("derived".to_string())));
        let row = &result.findings[0];
        assert_eq!(row.get_metric("bars"), Some(&MetricValue::Int(11)));
        assert_eq!(row.get_metric("expected_bars"), Some(&MetricValue::Int(13)));
        assert_eq!(row.get_metric("missing_bars"), Some(&MetricValue::Int(2)));
        assert_eq!(row.get_metric("coverage_pct"), Some(&MetricValue::Decimal(dec!(84.62))));
        assert_eq!(row.get_metric("first_ts"), Some(&MetricValue::Timestamp(minutes_ago(60))));
    }

    #[tokio::test]
    async fn test_synthetic_counts_start_at_first_stored_bar() {
        let store = MemoryBarStore::new();
        // The first bar predates the run window
        store
            .upsert(&[
                derived_bar("DXY", Timeframe::OneHour, now() - Duration::days(10)),
                derived_bar("DXY", Timeframe::OneHour, now() - Duration::hours(1)),
            ])
            .await
            .unwrap();
        let ctx = context(Arc::new(store), &[]);

        let result = BarCountsCheck::new("bar_counts_synthetic_1h", Scope::synthetic(Timeframe::OneHour))
            .run(&ctx)
            .await
            .unwrap();
        let row = &result.findings[0];
        assert_eq!(row.symbol, "DXY");
        assert_eq!(row.get_metric("bars"), Some(&MetricValue::Int(2)));
        assert_eq!(row.get_metric("expected_bars"), Some(&MetricValue::Int(241)));
        assert_eq!(
            row.get_metric("first_ts"),
            Some(&MetricValue::Timestamp(now() - Duration::days(10)))
        );
        assert_eq!(
            row.get_metric("last_ts"),
            Some(&MetricValue::Timestamp(now() - Duration::hours(1)))
        );
    }
}
