pub mod coverage;
pub mod derived;
pub mod freshness;
pub mod ohlc;
pub mod series;

pub use coverage::{BarCountsCheck, CoverageGuardrailCheck, GUARDRAIL_PASSED};
pub use derived::{AggregationCoverageCheck, ComponentDependencyCheck, CrossTimeframeCheck, SyntheticPresenceCheck};
pub use freshness::FreshnessCheck;
pub use ohlc::{EnhancedOhlcCheck, OhlcIntegrityCheck, PriceContinuityCheck, VolumeIntegrityCheck};
pub use series::{AlignmentCheck, DuplicatesCheck, FutureTimestampsCheck, GapsCheck, MonotonicityCheck};
