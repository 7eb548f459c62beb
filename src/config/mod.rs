/// Runtime configuration surface
use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::{CoveragePolicy, IndexDefinition, Timeframe};
use crate::error::StoreError;
use crate::store::{Dataset, SchemaDescriptor};

pub mod loader;

pub use loader::{load_config, parse_config, validate_config};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    pub verify: VerifyConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    pub synthetic: IndexDefinition,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig::default(),
            verify: VerifyConfig::default(),
            aggregation: AggregationConfig::default(),
            synthetic: IndexDefinition::dxy(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub dataset: Dataset,
    /// Overrides for the dataset's table names; still subject to the allow-list
    pub raw_table: Option<String>,
    pub derived_table: Option<String>,
    /// Create missing tables on startup (local databases only)
    pub create_schema: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("data/bars.db"),
            dataset: Dataset::Live,
            raw_table: None,
            derived_table: None,
            create_schema: false,
        }
    }
}

impl StoreConfig {
    pub fn schema(&self) -> Result<SchemaDescriptor, StoreError> {
        match (&self.raw_table, &self.derived_table) {
            (None, None) => Ok(SchemaDescriptor::resolve(self.dataset)),
            (raw, derived) => {
                let defaults = SchemaDescriptor::resolve(self.dataset);
                SchemaDescriptor::with_tables(
                    self.dataset,
                    raw.as_deref().unwrap_or(defaults.table(crate::store::BarTable::Raw)),
                    derived.as_deref().unwrap_or(defaults.table(crate::store::BarTable::Derived)),
                )
            }
        }
    }
}

/// Verification thresholds. The staleness, jump and spread thresholds have
/// no defaults: a config without them is rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyConfig {
    /// Symbols to verify; empty means every symbol found in the raw 1m table
    #[serde(default)]
    pub active_symbols: Vec<String>,
    #[serde(default = "default_active_days")]
    pub active_days: i64,
    #[serde(default = "default_hist_years")]
    pub hist_years: u32,
    pub staleness_warning_minutes: i64,
    pub staleness_critical_minutes: i64,
    pub price_jump_threshold: Decimal,
    pub spread_threshold: Decimal,
    #[serde(default = "default_spread_noise_floor")]
    pub spread_noise_floor: u64,
    #[serde(default = "default_grace_days")]
    pub coverage_grace_days: i64,
    #[serde(default = "default_rel_tolerance")]
    pub cross_tf_rel_tolerance: Decimal,
    #[serde(default = "default_abs_tolerance")]
    pub cross_tf_abs_tolerance: Decimal,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Long windows are read in slices of this many days
    #[serde(default = "default_scan_page_days")]
    pub scan_page_days: i64,
}

fn default_active_days() -> i64 {
    7
}

fn default_hist_years() -> u32 {
    3
}

fn default_spread_noise_floor() -> u64 {
    10
}

fn default_grace_days() -> i64 {
    7
}

fn default_rel_tolerance() -> Decimal {
    Decimal::new(1, 4)
}

fn default_abs_tolerance() -> Decimal {
    Decimal::new(1, 6)
}

fn default_check_timeout_secs() -> u64 {
    120
}

fn default_max_concurrency() -> usize {
    4
}

fn default_scan_page_days() -> i64 {
    30
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            active_symbols: Vec::new(),
            active_days: default_active_days(),
            hist_years: default_hist_years(),
            staleness_warning_minutes: 5,
            staleness_critical_minutes: 15,
            price_jump_threshold: Decimal::new(10, 2),
            spread_threshold: Decimal::new(10, 2),
            spread_noise_floor: default_spread_noise_floor(),
            coverage_grace_days: default_grace_days(),
            cross_tf_rel_tolerance: default_rel_tolerance(),
            cross_tf_abs_tolerance: default_abs_tolerance(),
            check_timeout_secs: default_check_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            scan_page_days: default_scan_page_days(),
        }
    }
}

/// Coverage policy per derived timeframe
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationPolicies {
    #[serde(rename = "5m")]
    pub five_minute: CoveragePolicy,
    #[serde(rename = "1h")]
    pub one_hour: CoveragePolicy,
    #[serde(rename = "1d")]
    pub one_day: CoveragePolicy,
}

impl Default for AggregationPolicies {
    fn default() -> Self {
        AggregationPolicies {
            five_minute: CoveragePolicy::Relaxed { min_required: 3 },
            one_hour: CoveragePolicy::Strict,
            one_day: CoveragePolicy::Strict,
        }
    }
}

impl AggregationPolicies {
    pub fn policy_for(&self, timeframe: Timeframe) -> Option<CoveragePolicy> {
        match timeframe {
            Timeframe::OneMinute => None,
            Timeframe::FiveMinute => Some(self.five_minute),
            Timeframe::OneHour => Some(self.one_hour),
            Timeframe::OneDay => Some(self.one_day),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub policies: AggregationPolicies,
    pub batch_size: usize,
    pub derivation_version: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            policies: AggregationPolicies::default(),
            batch_size: 500,
            derivation_version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    pub output_dir: PathBuf,
    pub formats: Vec<ReportFormat>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            output_dir: PathBuf::from("artifacts/data_verification"),
            formats: vec![ReportFormat::Json],
        }
    }
}
