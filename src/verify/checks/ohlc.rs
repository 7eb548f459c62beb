/// Price and volume sanity checks
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::CheckError;
use crate::store::ScanOrder;
use crate::types::Bar;
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult, Finding, Scope};

/// Null, non-positive or self-contradicting OHLC
pub struct OhlcIntegrityCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl OhlcIntegrityCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        OhlcIntegrityCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BasicOhlcCounts {
    pub null_ohlc: usize,
    pub nonpositive_ohlc: usize,
    pub ohlc_inconsistent: usize,
}

impl BasicOhlcCounts {
    pub fn tally(bars: &[Bar]) -> Self {
        let mut counts = BasicOhlcCounts::default();
        for bar in bars {
            let prices = [bar.open, bar.high, bar.low, bar.close];
            if prices.iter().any(Option::is_none) {
                counts.null_ohlc += 1;
            }
            if prices.iter().flatten().any(|p| *p <= Decimal::ZERO) {
                counts.nonpositive_ohlc += 1;
            }
            if let Some((open, high, low, close)) = bar.ohlc() {
                if high < open.max(close) || low > open.min(close) || high < low {
                    counts.ohlc_inconsistent += 1;
                }
            }
        }
        counts
    }

    pub fn absorb(&mut self, other: BasicOhlcCounts) {
        self.null_ohlc += other.null_ohlc;
        self.nonpositive_ohlc += other.nonpositive_ohlc;
        self.ohlc_inconsistent += other.ohlc_inconsistent;
    }

    pub fn any(&self) -> bool {
        self.null_ohlc + self.nonpositive_ohlc + self.ohlc_inconsistent > 0
    }
}

#[async_trait]
impl Check for OhlcIntegrityCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::OhlcIntegrity
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let mut result = CheckResult::new();
        for symbol in self.scope.resolve_symbols(ctx).await? {
            let mut counts = BasicOhlcCounts::default();
            for page in ctx.pages(ctx.window) {
                let bars = self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?;
                counts.absorb(BasicOhlcCounts::tally(&bars));
            }
            if counts.any() {
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("null_ohlc", counts.null_ohlc)
                        .with("nonpositive_ohlc", counts.nonpositive_ohlc)
                        .with("ohlc_inconsistent", counts.ohlc_inconsistent),
                );
            }
        }
        result.summarize("symbols_with_issues", result.findings.len());
        let raised = !result.findings.is_empty();
        result.flag(&self.flag, raised);
        Ok(result)
    }
}

/// Range violations plus excessive (high - low) / close spreads
pub struct EnhancedOhlcCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl EnhancedOhlcCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        EnhancedOhlcCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnhancedOhlcCounts {
    pub total_bars: usize,
    pub high_less_than_low: usize,
    pub open_out_of_range: usize,
    pub close_out_of_range: usize,
    pub zero_range_bars: usize,
    pub excessive_spread_bars: usize,
}

impl EnhancedOhlcCounts {
    pub fn tally(bars: &[Bar], spread_threshold: Decimal) -> Self {
        let mut counts = EnhancedOhlcCounts {
            total_bars: bars.len(),
            ..EnhancedOhlcCounts::default()
        };
        for bar in bars {
            let Some((open, high, low, close)) = bar.ohlc() else {
                continue;
            };
            if high < low {
                counts.high_less_than_low += 1;
            }
            if open < low || open > high {
                counts.open_out_of_range += 1;
            }
            if close < low || close > high {
                counts.close_out_of_range += 1;
            }
            if high == low {
                counts.zero_range_bars += 1;
            }
            if close > Decimal::ZERO && (high - low) / close > spread_threshold {
                counts.excessive_spread_bars += 1;
            }
        }
        counts
    }

    pub fn absorb(&mut self, other: EnhancedOhlcCounts) {
        self.total_bars += other.total_bars;
        self.high_less_than_low += other.high_less_than_low;
        self.open_out_of_range += other.open_out_of_range;
        self.close_out_of_range += other.close_out_of_range;
        self.zero_range_bars += other.zero_range_bars;
        self.excessive_spread_bars += other.excessive_spread_bars;
    }

    /// Hard violations always count; spreads only past the noise floor
    pub fn is_defective(&self, noise_floor: u64) -> bool {
        self.high_less_than_low > 0
            || self.open_out_of_range > 0
            || self.close_out_of_range > 0
            || self.excessive_spread_bars as u64 > noise_floor
    }
}

#[async_trait]
impl Check for EnhancedOhlcCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::OhlcIntegrityEnhanced
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let threshold = ctx.config.spread_threshold;
        let floor = ctx.config.spread_noise_floor;
        let mut result = CheckResult::new();

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let mut counts = EnhancedOhlcCounts::default();
            for page in ctx.pages(ctx.window) {
                let bars = self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?;
                counts.absorb(EnhancedOhlcCounts::tally(&bars, threshold));
            }
            if counts.is_defective(floor) {
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("total_bars", counts.total_bars)
                        .with("high_less_than_low", counts.high_less_than_low)
                        .with("open_out_of_range", counts.open_out_of_range)
                        .with("close_out_of_range", counts.close_out_of_range)
                        .with("zero_range_bars", counts.zero_range_bars)
                        .with("excessive_spread_bars", counts.excessive_spread_bars),
                );
            }
        }

        result.summarize("spread_threshold", threshold);
        result.summarize("spread_noise_floor", floor);
        let raised = !result.findings.is_empty();
        result.flag(&self.flag, raised);
        Ok(result)
    }
}

/// Negative or null volume, when the table tracks volume at all
pub struct VolumeIntegrityCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl VolumeIntegrityCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        VolumeIntegrityCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

#[async_trait]
impl Check for VolumeIntegrityCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::VolumeIntegrity
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let mut result = CheckResult::new();
        if !ctx.store.tracks_volume(self.scope.table).await? {
            result.summarize("skipped", true);
            result.flag(&self.flag, false);
            return Ok(result);
        }

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let (mut negative, mut null, mut zero, mut total) = (0usize, 0usize, 0usize, 0usize);
            for page in ctx.pages(ctx.window) {
                let bars = self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?;
                total += bars.len();
                for bar in &bars {
                    match bar.volume {
                        None => null += 1,
                        Some(v) if v < Decimal::ZERO => negative += 1,
                        Some(v) if v.is_zero() => zero += 1,
                        Some(_) => {}
                    }
                }
            }
            if negative > 0 || null > 0 {
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("negative_volume", negative)
                        .with("null_volume", null)
                        .with("zero_volume", zero)
                        .with("total_bars", total),
                );
            }
        }

        result.summarize("skipped", false);
        let raised = !result.findings.is_empty();
        result.flag(&self.flag, raised);
        Ok(result)
    }
}

/// Close-to-close moves larger than the jump threshold
pub struct PriceContinuityCheck {
    name: String,
    scope: Scope,
    flag: String,
}

impl PriceContinuityCheck {
    pub fn new(name: &str, scope: Scope, flag: &str) -> Self {
        PriceContinuityCheck {
            name: name.to_string(),
            scope,
            flag: flag.to_string(),
        }
    }
}

/// Running close-to-close scan. Null closes are skipped and the last close
/// carries over to the next slice fed in.
#[derive(Debug, Clone)]
pub struct JumpScan {
    threshold: Decimal,
    prev_close: Option<Decimal>,
    pub count: usize,
    pub max_jump: Option<Decimal>,
}

impl JumpScan {
    pub fn new(threshold: Decimal) -> Self {
        JumpScan {
            threshold,
            prev_close: None,
            count: 0,
            max_jump: None,
        }
    }

    pub fn feed(&mut self, bars: &[Bar]) {
        for close in bars.iter().filter_map(|b| b.close) {
            if let Some(prev) = self.prev_close.filter(|p| *p > Decimal::ZERO) {
                let jump = (close - prev).abs() / prev;
                if jump > self.threshold {
                    self.count += 1;
                }
                self.max_jump = Some(self.max_jump.map_or(jump, |m| m.max(jump)));
            }
            self.prev_close = Some(close);
        }
    }
}

/// Count of jumps above `threshold` and the largest relative move seen
pub fn price_jumps(bars: &[Bar], threshold: Decimal) -> (usize, Option<Decimal>) {
    let mut scan = JumpScan::new(threshold);
    scan.feed(bars);
    (scan.count, scan.max_jump)
}

#[async_trait]
impl Check for PriceContinuityCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CheckKind {
        CheckKind::PriceContinuity
    }

    fn flag_names(&self) -> Vec<String> {
        vec![self.flag.clone()]
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult, CheckError> {
        let threshold = ctx.config.price_jump_threshold;
        let mut result = CheckResult::new();

        for symbol in self.scope.resolve_symbols(ctx).await? {
            let mut scan = JumpScan::new(threshold);
            for page in ctx.pages(ctx.window) {
                scan.feed(&self.scope.load(ctx, &symbol, page, ScanOrder::Timestamp).await?);
            }
            let (count, max_jump) = (scan.count, scan.max_jump);
            if count > 0 {
                result.push(
                    Finding::new(&symbol, Some(self.scope.timeframe))
                        .with("large_jump_count", count)
                        .with(
                            "max_price_jump_pct",
                            max_jump.map(|j| (j * Decimal::ONE_HUNDRED).round_dp(4)),
                        ),
                );
            }
        }

        result.summarize("jump_threshold", threshold);
        let raised = !result.findings.is_empty();
        result.flag(&self.flag, raised);
        Ok(result)
    }
}
