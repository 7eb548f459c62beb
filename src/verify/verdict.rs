/// Reduction of check outcomes into pass/fail flags and scalar summaries
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::verify::check::{CheckKind, MetricValue};
use crate::verify::checks::GUARDRAIL_PASSED;
use crate::verify::phase::Phase;
use crate::verify::runner::{CheckOutcome, CheckStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StalenessSummary {
    pub warning_count: i64,
    pub critical_count: i64,
    pub no_data_count: i64,
    pub p50_minutes: Option<f64>,
    pub p95_minutes: Option<f64>,
    pub max_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub phase: Phase,
    /// Flag -> defect detected. Flags shared by several slots are OR-ed.
    pub flags: BTreeMap<String, bool>,
    pub staleness: Option<StalenessSummary>,
    /// `None` when the phase has no guardrail
    pub coverage_guardrail_passed: Option<bool>,
    pub historical_findings_incomplete: bool,
    pub failed_checks: usize,
    pub timed_out_checks: usize,
    pub cancelled_checks: usize,
    /// Slot -> error note for checks that did not complete
    pub notes: BTreeMap<String, String>,
}

impl Verdict {
    pub fn from_outcomes(phase: Phase, outcomes: &[CheckOutcome]) -> Self {
        let mut verdict = Verdict {
            phase,
            flags: BTreeMap::new(),
            staleness: None,
            coverage_guardrail_passed: None,
            historical_findings_incomplete: false,
            failed_checks: 0,
            timed_out_checks: 0,
            cancelled_checks: 0,
            notes: BTreeMap::new(),
        };

        for outcome in outcomes {
            for (flag, raised) in &outcome.result.flags {
                *verdict.flags.entry(flag.clone()).or_insert(false) |= *raised;
            }

            match outcome.status {
                CheckStatus::Completed => {}
                CheckStatus::Failed | CheckStatus::Panicked => verdict.failed_checks += 1,
                CheckStatus::TimedOut => verdict.timed_out_checks += 1,
                CheckStatus::Cancelled => verdict.cancelled_checks += 1,
            }
            if !outcome.is_completed() {
                let note = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| outcome.status.as_str().to_string());
                verdict.notes.insert(outcome.name.clone(), note);
            }

            match outcome.kind {
                CheckKind::Freshness if outcome.is_completed() => {
                    verdict.staleness = Some(staleness_summary(outcome));
                }
                CheckKind::CoverageGuardrail => {
                    // A guardrail that never produced an answer is not a pass
                    let passed = outcome.is_completed()
                        && outcome.result.get_summary(GUARDRAIL_PASSED) == Some(&MetricValue::Bool(true));
                    verdict.coverage_guardrail_passed = Some(passed);
                }
                _ => {}
            }
        }

        verdict.historical_findings_incomplete = verdict.coverage_guardrail_passed == Some(false);
        verdict
    }

    /// True when no flag is raised
    pub fn passed(&self) -> bool {
        self.flags.values().all(|raised| !raised)
    }

    pub fn raised_flags(&self) -> Vec<&str> {
        self.flags
            .iter()
            .filter(|(_, raised)| **raised)
            .map(|(flag, _)| flag.as_str())
            .collect()
    }
}

fn staleness_summary(outcome: &CheckOutcome) -> StalenessSummary {
    let int = |key: &str| outcome.result.get_summary(key).and_then(|m| m.as_i64()).unwrap_or(0);
    let float = |key: &str| outcome.result.get_summary(key).and_then(|m| m.as_f64());
    StalenessSummary {
        warning_count: int("warning_count"),
        critical_count: int("critical_count"),
        no_data_count: int("no_data_count"),
        p50_minutes: float("p50_minutes"),
        p95_minutes: float("p95_minutes"),
        max_minutes: float("max_minutes"),
    }
}
