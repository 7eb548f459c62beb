/// Timestamp-shape checks over one table and timeframe
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CheckError;
use crate::store::ScanOrder;
use crate::types::TimeWindow;
use crate::utils::minutes_between;
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult, Finding, Scope};

/// More than one row at the same (symbol, timeframe, ts_utc)
pub struct DuplicatesCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl DuplicatesCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        DuplicatesCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for DuplicatesCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Duplicates
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let mut result = CheckResult::new();
        let mut duplicate_keys = 0usize;

        for symbol in self.scope.resolve_symbols(ctx).await? {
            // A key never straddles two slices
            for page in ctx.pages(ctx.window) {
                let bars = self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?;
                let mut counts: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
                for bar in &bars {
                    *counts.entry(bar.ts_utc).or_default() += 1;
                }
                for (ts, rows) in counts.into_iter().filter(|(_, rows)| *rows > 1) {
                    duplicate_keys += 1;
                    result.push(
                        Finding::new(&symbol, Some(self.scope.timeframe))
                            .with("ts_utc", ts)
                            .with("rows_at_key", rows),
                    );
                }
            }
        }

        result.summarize("duplicate_keys", duplicate_keys);
        result.flag(&self.flag, duplicate_keys > 0);
        Ok(result)
    }
}

/// Adjacent bars further apart than one interval
pub struct GapsCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl GapsCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        GapsCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for GapsCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Gaps
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let interval = self.scope.timeframe.duration();
        let mut result = CheckResult::new();
        let mut total_events = 0usize;

        for symbol in self.scope.resolve_symbols(ctx).await? {
            if ctx.is_idle(&symbol) {
                continue;
            }

            let mut events = 0usize;
            let mut max_gap: Option<f64> = None;
            // Carried across slices so a gap over a slice boundary still counts
            let mut prev: Option<DateTime<Utc>> = None;
            for page in ctx.pages(ctx.window) {
                for bar in self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await? {
                    if let Some(prev_ts) = prev {
                        if bar.ts_utc - prev_ts > interval {
                            events += 1;
                            let minutes = minutes_between(prev_ts, bar.ts_utc);
                            max_gap = Some(max_gap.map_or(minutes, |m| m.max(minutes)));
                        }
                    }
                    prev = Some(bar.ts_utc);
                }
            }

            if events > 0 {
                total_events += events;
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("gap_events", events)
                        .with("max_gap_minutes", max_gap),
                );
            }
        }

        result.findings.sort_by(|a, b| {
            let events = |f: &Finding| f.get_metric("gap_events").and_then(|m| m.as_i64()).unwrap_or(0);
            events(b).cmp(&events(a)).then_with(|| a.symbol.cmp(&b.symbol))
        });
        result.summarize("gap_events", total_events);
        result.flag(&self.flag, total_events > 0);
        Ok(result)
    }
}

/// Timestamps off the timeframe boundary
pub struct AlignmentCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl AlignmentCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        AlignmentCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for AlignmentCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Alignment
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let timeframe = self.scope.timeframe;
        let mut result = CheckResult::new();
        let mut total = 0usize;

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let mut count = 0usize;
            let mut first = None;
            for page in ctx.pages(ctx.window) {
                let bars = self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?;
                for ts in bars.iter().map(|b| b.ts_utc).filter(|ts| !timeframe.is_aligned(*ts)) {
                    count += 1;
                    first.get_or_insert(ts);
                }
            }
            if let Some(first) = first {
                total += count;
                result.push(
                    Finding::new(&symbol, Some(timeframe))
                        .with("misaligned_count", count)
                        .with("first_misaligned_ts", first),
                );
            }
        }

        result.summarize("misaligned_count", total);
        result.flag(&self.flag, total > 0);
        Ok(result)
    }
}

/// Arrival-ordered series whose timestamps do not strictly increase.
///
/// Arrival order cannot be sliced by timestamp, so the whole window is read
/// at once; the check belongs to the recent-window phase only.
pub struct MonotonicityCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl MonotonicityCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        MonotonicityCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for MonotonicityCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::Monotonicity
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let mut result = CheckResult::new();
        let mut total = 0usize;

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let bars = self.scope.load(ctx, &symbol, ctx.window, ScanOrder::Arrival).await?;
            let mut count = 0usize;
            let mut first_violation = None;
            for pair in bars.windows(2) {
                if pair[1].ts_utc <= pair[0].ts_utc {
                    count += 1;
                    first_violation.get_or_insert(pair[1].ts_utc);
                }
            }
            if count > 0 {
                total += count;
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("non_monotonic_count", count)
                        .with("first_violation_ts", first_violation),
                );
            }
        }

        result.summarize("non_monotonic_count", total);
        result.flag(&self.flag, total > 0);
        Ok(result)
    }
}

/// Bars stamped strictly after the run's `now`
pub struct FutureTimestampsCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl FutureTimestampsCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        FutureTimestampsCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for FutureTimestampsCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::FutureTimestamps
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        // The run window ends at `now`; look past it
        let horizon = TimeWindow {
            from: ctx.now,
            to: DateTime::<Utc>::MAX_UTC,
        };
        let mut result = CheckResult::new();
        let mut total = 0usize;

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let bars = self.scope.load(ctx, &symbol, horizon, ScanOrder::Timestamp).await?;
            let future: Vec<DateTime<Utc>> = bars.iter().map(|b| b.ts_utc).filter(|ts| *ts > ctx.now).collect();
            if let Some(max) = future.iter().max() {
                total += future.len();
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("future_timestamp_count", future.len())
                        .with("max_future_ts", *max),
                );
            }
        }

        result.summarize("future_timestamp_count", total);
        result.flag(&self.flag, total > 0);
        Ok(result)
    }
}
