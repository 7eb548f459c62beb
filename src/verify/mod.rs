pub mod check;
pub mod checks;
pub mod phase;
pub mod report;
pub mod runner;
pub mod verdict;

pub use check::{Check, CheckContext, CheckKind, CheckResult, Finding, MetricValue, Scope, ScopeSymbols};
pub use phase::{phase_a_plan, phase_b_plan, Phase, GUARDRAIL_SLOT};
pub use report::{CsvDirSink, JsonFileSink, ReportSink, VerificationReport};
pub use runner::{CatalogRunner, CheckOutcome, CheckStatus, RunCancellation};
pub use verdict::{StalenessSummary, Verdict};
