pub mod timeframe;
pub mod aggregation;
pub mod synthetic;

pub use timeframe::Timeframe;
pub use aggregation::{
    bucket_children, build_rollup, rollup_bucket, AggregationEngine, AggregationOutcome, AggregationRequest,
    BucketRollup, CoveragePolicy, WriteState, AGGREGATED_SOURCE,
};
pub use synthetic::{IndexComponent, IndexDefinition, SyntheticIndexCalculator, SyntheticOutcome, SYNTHETIC_SOURCE};
