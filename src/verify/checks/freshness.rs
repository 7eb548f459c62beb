/// Staleness of the latest 1m bar per active symbol and the synthetic index
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::data::Timeframe;
use crate::error::CheckError;
use crate::store::{BarTable, SeriesQuery};
use crate::types::SymbolSet;
use crate::utils::{minutes_between, percentile};
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult, Finding, Scope, ScopeSymbols};

pub const STALENESS_WARNING: &str = "staleness_warning";
pub const STALENESS_CRITICAL: &str = "staleness_critical";
pub const STALENESS_NO_DATA: &str = "staleness_no_data";

pub struct FreshnessCheck {
    name: String,
}

impl FreshnessCheck {
    pub fn new(name: &str) -> Self {
        FreshnessCheck { name: name.to_string() }
    }

    async fn latest(&self, ctx: &CheckContext, scope: &Scope, symbol: &str) -> Result<Option<DateTime<Utc>>, CheckError> {
        let query = SeriesQuery::new(scope.table, scope.timeframe, ctx.window).with_symbols(SymbolSet::single(symbol));
        Ok(ctx.store.latest_ts(&query).await?)
    }
}

#[async_trait]
impl Check for FreshnessCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Freshness
    }

    fn flag_names(&self) -> Vec<String> {
        vec![
            STALENESS_WARNING.to_string(),
            STALENESS_CRITICAL.to_string(),
            STALENESS_NO_DATA.to_string(),
        ]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let raw = Scope::raw_1m();
        let synthetic = Scope {
            table: BarTable::Derived,
            timeframe: Timeframe::OneMinute,
            symbols: ScopeSymbols::Synthetic,
        };

        let mut targets: Vec<(String, &Scope)> = ctx
            .symbols
            .iter()
            .filter(|s| s.as_str() != ctx.get_synthetic_symbol())
            .map(|s| (s.clone(), &raw))
            .collect();
        targets.push((ctx.get_synthetic_symbol().to_string(), &synthetic));

        let warning = ctx.config.staleness_warning_minutes as f64;
        let critical = ctx.config.staleness_critical_minutes as f64;

        let mut result = CheckResult::new();
        let mut stalenesses = Vec::new();
        let (mut warnings, mut criticals, mut no_data, mut excluded) = (0usize, 0usize, 0usize, 0usize);

        for (symbol, scope) in targets {
            if ctx.is_idle(&symbol) {
                excluded += 1;
                debug!("Skipping staleness for idle symbol {}", symbol);
                continue;
            }
            let latest = self.latest(ctx, scope, &symbol).await?;
            let staleness = latest.map(|ts| minutes_between(ts, ctx.now));

            match staleness {
                Some(minutes) => {
                    stalenesses.push(minutes);
                    if minutes > warning {
                        warnings += 1;
                    }
                    if minutes > critical {
                        criticals += 1;
                    }
                }
                None => no_data += 1,
            }

            result.push(
                Finding::new(&symbol, Some(Timeframe::OneMinute))
                    .with("table", scope.table.as_str())
                    .with("latest_ts", latest)
                    .with("staleness_minutes", staleness)
                    .with("status", staleness_status(staleness, warning, critical)),
            );
        }

        // Most stale first, no-data rows last
        result.findings.sort_by(|a, b| {
            let key = |f: &Finding| f.get_metric("staleness_minutes").and_then(|m| m.as_f64());
            match (key(a), key(b)) {
                (Some(x), Some(y)) => y.total_cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.symbol.cmp(&b.symbol),
            }
        });

        result.summarize("warning_count", warnings);
        result.summarize("critical_count", criticals);
        result.summarize("no_data_count", no_data);
        result.summarize("excluded_idle", excluded);
        result.summarize("p50_minutes", percentile(&stalenesses, 50.0));
        result.summarize("p95_minutes", percentile(&stalenesses, 95.0));
        result.summarize("max_minutes", stalenesses.iter().copied().reduce(f64::max));

        result.flag(STALENESS_WARNING, warnings > 0);
        result.flag(STALENESS_CRITICAL, criticals > 0);
        result.flag(STALENESS_NO_DATA, no_data > 0);
        Ok(result)
    }
}

fn staleness_status(staleness: Option<f64>, warning: f64, critical: f64) -> &'static str {
    match staleness {
        None => "no data",
        Some(m) if m > critical => "critical",
        Some(m) if m > warning => "warning",
        Some(_) => "ok",
    }
}
