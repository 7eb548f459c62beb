/// Phase A (recent window) and Phase B (historical window) check plans
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AggregationPolicies, VerifyConfig};
use crate::data::{CoveragePolicy, Timeframe};
use crate::error::VerifyError;
use crate::types::TimeWindow;
use crate::verify::check::{Check, Scope};
use crate::verify::checks::*;

// Phase A flags
pub const DUPLICATES_RAW_1M: &str = "duplicates_data_bars_1m";
pub const DUPLICATES_DERIVED: &str = "duplicates_derived";
pub const MISALIGNED_5M: &str = "misaligned_5m";
pub const MISALIGNED_1H: &str = "misaligned_1h";
pub const MISALIGNED_1D: &str = "misaligned_1d";
pub const BAD_5M_COVERAGE: &str = "bad_5m_coverage_strict";
pub const BAD_1H_COVERAGE: &str = "bad_1h_coverage_strict";
pub const SYNTHETIC_MISSING: &str = "dxy_missing_data";
pub const NON_MONOTONIC: &str = "non_monotonic_timestamps";
pub const FUTURE_TIMESTAMPS: &str = "future_timestamps";
pub const ENHANCED_OHLC: &str = "enhanced_ohlc_issues";
pub const VOLUME_ISSUES: &str = "volume_issues";
pub const LARGE_PRICE_JUMPS: &str = "large_price_jumps";
pub const CROSS_TIMEFRAME_MISMATCH: &str = "cross_timeframe_mismatch";
pub const SYNTHETIC_CROSS_TIMEFRAME_MISMATCH: &str = "dxy_cross_timeframe_mismatch";

// Phase B flags
pub const INSUFFICIENT_COVERAGE: &str = "insufficient_historical_coverage";
pub const INTEGRITY_1M: &str = "integrity_issues_1m";
pub const GAPS_1M: &str = "gap_events_1m";
pub const COMPONENT_DEPENDENCY: &str = "dxy_component_dependency_fail";
pub const SYNTHETIC_MISSING_5M_1H: &str = "dxy_missing_5m_or_1h";
pub const SYNTHETIC_MISALIGNED_5M: &str = "dxy_misaligned_5m";
pub const SYNTHETIC_MISALIGNED_1H: &str = "dxy_misaligned_1h";

/// Slot name of the guardrail in the Phase B plan
pub const GUARDRAIL_SLOT: &str = "coverage_guardrail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    A,
    B,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
        }
    }

    pub fn window(&self, now: DateTime<Utc>, config: &VerifyConfig) -> TimeWindow {
        match self {
            Phase::A => TimeWindow::last_days(now, config.active_days),
            Phase::B => TimeWindow::last_years(now, config.hist_years),
        }
    }

    pub fn plan(&self, policies: &AggregationPolicies) -> Vec<Arc<dyn Check>> {
        match self {
            Phase::A => phase_a_plan(policies),
            Phase::B => phase_b_plan(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Phase::A),
            "B" => Ok(Phase::B),
            _ => Err(VerifyError::InvalidParameter(format!("Unknown phase: {}", s))),
        }
    }
}

pub fn phase_a_plan(policies: &AggregationPolicies) -> Vec<Arc<dyn Check>> {
    let mut plan: Vec<Arc<dyn Check>> = vec![
        Arc::new(FreshnessCheck::new("freshness")),
        Arc::new(DuplicatesCheck::new("duplicates_raw_1m", Scope::raw_1m(), DUPLICATES_RAW_1M)),
    ];

    for tf in Timeframe::ALL {
        plan.push(Arc::new(DuplicatesCheck::new(
            &format!("duplicates_derived_{}", tf),
            Scope::derived(tf),
            DUPLICATES_DERIVED,
        )));
    }

    for (tf, flag) in [
        (Timeframe::FiveMinute, MISALIGNED_5M),
        (Timeframe::OneHour, MISALIGNED_1H),
        (Timeframe::OneDay, MISALIGNED_1D),
    ] {
        plan.push(Arc::new(AlignmentCheck::new(&format!("alignment_{}", tf), Scope::derived(tf), flag)));
    }

    for (tf, flag) in [(Timeframe::FiveMinute, BAD_5M_COVERAGE), (Timeframe::OneHour, BAD_1H_COVERAGE)] {
        let policy = policies.policy_for(tf).unwrap_or(CoveragePolicy::Strict);
        plan.push(Arc::new(AggregationCoverageCheck::new(
            &format!("aggregation_coverage_{}", tf),
            tf,
            policy,
            flag,
        )));
    }

    for tf in Timeframe::ALL {
        plan.push(Arc::new(SyntheticPresenceCheck::new(
            &format!("synthetic_presence_{}", tf),
            tf,
            SYNTHETIC_MISSING,
        )));
    }

    plan.push(Arc::new(MonotonicityCheck::new("monotonicity_raw_1m", Scope::raw_1m(), NON_MONOTONIC)));
    plan.push(Arc::new(FutureTimestampsCheck::new(
        "future_timestamps_raw_1m",
        Scope::raw_1m(),
        FUTURE_TIMESTAMPS,
    )));
    plan.push(Arc::new(EnhancedOhlcCheck::new("ohlc_enhanced_raw_1m", Scope::raw_1m(), ENHANCED_OHLC)));
    plan.push(Arc::new(VolumeIntegrityCheck::new("volume_raw_1m", Scope::raw_1m(), VOLUME_ISSUES)));
    plan.push(Arc::new(PriceContinuityCheck::new(
        "price_continuity_raw_1m",
        Scope::raw_1m(),
        LARGE_PRICE_JUMPS,
    )));
    for tf in [Timeframe::FiveMinute, Timeframe::OneHour, Timeframe::OneDay] {
        plan.push(Arc::new(CrossTimeframeCheck::new(
            &format!("cross_timeframe_{}", tf),
            tf,
            CROSS_TIMEFRAME_MISMATCH,
        )));
    }
    for tf in [Timeframe::FiveMinute, Timeframe::OneHour] {
        plan.push(Arc::new(
            CrossTimeframeCheck::new(
                &format!("synthetic_cross_timeframe_{}", tf),
                tf,
                SYNTHETIC_CROSS_TIMEFRAME_MISMATCH,
            )
            .for_synthetic(),
        ));
    }
    plan
}

/// The guardrail leads the plan so its verdict is logged before the findings it taints
pub fn phase_b_plan() -> Vec<Arc<dyn Check>> {
    let mut plan: Vec<Arc<dyn Check>> = vec![
        Arc::new(CoverageGuardrailCheck::new(GUARDRAIL_SLOT, INSUFFICIENT_COVERAGE)),
        Arc::new(OhlcIntegrityCheck::new("ohlc_integrity_raw_1m", Scope::raw_1m(), INTEGRITY_1M)),
        Arc::new(BarCountsCheck::new("bar_counts_raw_1m", Scope::raw_1m())),
    ];

    for tf in [Timeframe::FiveMinute, Timeframe::OneHour, Timeframe::OneDay] {
        plan.push(Arc::new(BarCountsCheck::new(
            &format!("bar_counts_derived_{}", tf),
            Scope::derived(tf),
        )));
    }
    for tf in Timeframe::ALL {
        plan.push(Arc::new(BarCountsCheck::new(
            &format!("bar_counts_synthetic_{}", tf),
            Scope::synthetic(tf),
        )));
    }

    plan.push(Arc::new(GapsCheck::new("gaps_raw_1m", Scope::raw_1m(), GAPS_1M)));
    plan.push(Arc::new(EnhancedOhlcCheck::new("ohlc_enhanced_raw_1m", Scope::raw_1m(), ENHANCED_OHLC)));
    plan.push(Arc::new(VolumeIntegrityCheck::new("volume_raw_1m", Scope::raw_1m(), VOLUME_ISSUES)));

    for tf in [Timeframe::FiveMinute, Timeframe::OneHour] {
        plan.push(Arc::new(SyntheticPresenceCheck::new(
            &format!("synthetic_presence_{}", tf),
            tf,
            SYNTHETIC_MISSING_5M_1H,
        )));
    }

    plan.push(Arc::new(ComponentDependencyCheck::new("component_dependency", COMPONENT_DEPENDENCY)));

    for (tf, flag) in [
        (Timeframe::FiveMinute, SYNTHETIC_MISALIGNED_5M),
        (Timeframe::OneHour, SYNTHETIC_MISALIGNED_1H),
    ] {
        plan.push(Arc::new(AlignmentCheck::new(
            &format!("synthetic_alignment_{}", tf),
            Scope::synthetic(tf),
            flag,
        )));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    fn flags(plan: &[Arc<dyn Check>]) -> BTreeSet<String> {
        plan.iter().flat_map(|c| c.flag_names()).collect()
    }

    #[test]
    fn test_slot_names_are_unique() {
        for phase in [Phase::A, Phase::B] {
            let plan = phase.plan(&AggregationPolicies::default());
            let names: HashSet<&str> = plan.iter().map(|c| c.name()).collect();
            assert_eq!(names.len(), plan.len(), "phase {}", phase);
        }
    }

    #[test]
    fn test_phase_a_flags() {
        let flags = flags(&phase_a_plan(&AggregationPolicies::default()));
        for expected in [
            DUPLICATES_RAW_1M,
            DUPLICATES_DERIVED,
            MISALIGNED_1D,
            BAD_5M_COVERAGE,
            BAD_1H_COVERAGE,
            SYNTHETIC_MISSING,
            NON_MONOTONIC,
            FUTURE_TIMESTAMPS,
            ENHANCED_OHLC,
            VOLUME_ISSUES,
            LARGE_PRICE_JUMPS,
            CROSS_TIMEFRAME_MISMATCH,
            SYNTHETIC_CROSS_TIMEFRAME_MISMATCH,
            "staleness_warning",
            "staleness_critical",
        ] {
            assert!(flags.contains(expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_cross_timeframe_slots_cover_every_rollup() {
        let plan = phase_a_plan(&AggregationPolicies::default());
        let names: HashSet<&str> = plan.iter().map(|c| c.name()).collect();
        for slot in [
            "cross_timeframe_5m",
            "cross_timeframe_1h",
            "cross_timeframe_1d",
            "synthetic_cross_timeframe_5m",
            "synthetic_cross_timeframe_1h",
        ] {
            assert!(names.contains(slot), "missing {}", slot);
        }
    }

    #[test]
    fn test_phase_b_starts_with_guardrail() {
        let plan = phase_b_plan();
        assert_eq!(plan[0].name(), GUARDRAIL_SLOT);
        // Bar counts are informational
        let counts: Vec<&Arc<dyn Check>> = plan.iter().filter(|c| c.name().starts_with("bar_counts_")).collect();
        assert_eq!(counts.len(), 8);
        assert!(counts.iter().all(|c| c.flag_names().is_empty()));
        assert!(counts.iter().any(|c| c.name() == "bar_counts_derived_1d"));
        assert!(counts.iter().any(|c| c.name() == "bar_counts_synthetic_1m"));
        assert!(flags(&plan).contains(COMPONENT_DEPENDENCY));
    }

    #[test]
    fn test_parse_phase() {
        assert_eq!("a".parse::<Phase>().unwrap(), Phase::A);
        assert_eq!("B".parse::<Phase>().unwrap(), Phase::B);
        assert!("c".parse::<Phase>().is_err());
    }
}
