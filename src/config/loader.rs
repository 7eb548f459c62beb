/// Configuration loading from TOML file with environment overrides
use std::path::Path;

use config::{Environment, File, FileFormat};
use rust_decimal::Decimal;

use crate::config::Config;
use crate::data::{CoveragePolicy, Timeframe};
use crate::error::{Result, VerifyError};

/// Load `path`, then apply `BARSENTRY__SECTION__KEY` environment overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
        .add_source(
            Environment::with_prefix("BARSENTRY")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| VerifyError::ConfigError(format!("Failed to read config file: {}", e)))?;

    let config: Config = settings
        .try_deserialize()
        .map_err(|e| VerifyError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

/// Parse and validate a TOML document without touching the environment
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| VerifyError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    let verify = &config.verify;

    // Staleness thresholds
    if verify.staleness_warning_minutes <= 0 {
        return Err(VerifyError::ConfigError(format!(
            "Invalid staleness_warning_minutes: {}",
            verify.staleness_warning_minutes
        )));
    }
    if verify.staleness_critical_minutes <= verify.staleness_warning_minutes {
        return Err(VerifyError::ConfigError(
            "staleness_critical_minutes must be > staleness_warning_minutes".to_string(),
        ));
    }

    // Fractional thresholds
    if verify.price_jump_threshold <= Decimal::ZERO {
        return Err(VerifyError::ConfigError(format!(
            "Invalid price_jump_threshold: {}",
            verify.price_jump_threshold
        )));
    }
    if verify.spread_threshold <= Decimal::ZERO {
        return Err(VerifyError::ConfigError(format!(
            "Invalid spread_threshold: {}",
            verify.spread_threshold
        )));
    }
    if verify.cross_tf_rel_tolerance < Decimal::ZERO || verify.cross_tf_abs_tolerance < Decimal::ZERO {
        return Err(VerifyError::ConfigError("Cross-timeframe tolerances must be >= 0".to_string()));
    }

    // Windows
    if verify.active_days < 1 || verify.hist_years < 1 {
        return Err(VerifyError::ConfigError("active_days and hist_years must be >= 1".to_string()));
    }
    if verify.coverage_grace_days < 0 {
        return Err(VerifyError::ConfigError("coverage_grace_days must be >= 0".to_string()));
    }

    // Runner
    if verify.check_timeout_secs == 0 || verify.max_concurrency == 0 {
        return Err(VerifyError::ConfigError(
            "check_timeout_secs and max_concurrency must be >= 1".to_string(),
        ));
    }
    if verify.scan_page_days < 1 {
        return Err(VerifyError::ConfigError(format!(
            "Invalid scan_page_days: {}",
            verify.scan_page_days
        )));
    }

    // Aggregation policies
    for timeframe in [Timeframe::FiveMinute, Timeframe::OneHour, Timeframe::OneDay] {
        let ratio = timeframe.child_spec().map(|(_, r)| r).unwrap_or(1);
        if let Some(CoveragePolicy::Relaxed { min_required }) = config.aggregation.policies.policy_for(timeframe) {
            if min_required == 0 || min_required > ratio {
                return Err(VerifyError::ConfigError(format!(
                    "{} min_required must be in 1..={}, got {}",
                    timeframe, ratio, min_required
                )));
            }
        }
    }
    if config.aggregation.batch_size == 0 {
        return Err(VerifyError::ConfigError("aggregation.batch_size must be >= 1".to_string()));
    }

    // Synthetic index weight table
    config.synthetic.validate()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [store]
        backend = "memory"
        dataset = "historical"

        [verify]
        active_symbols = ["EURUSD", "USDJPY"]
        staleness_warning_minutes = 5
        staleness_critical_minutes = 15
        price_jump_threshold = 0.10
        spread_threshold = 0.10

        [aggregation.policies]
        5m = { mode = "relaxed", min_required = 3 }
        1h = { mode = "strict" }

        [synthetic]
        symbol = "DXY"
        base = 50.14348112
        components = [
            { symbol = "EURUSD", weight = -0.576 },
            { symbol = "USDJPY", weight = 0.136 },
            { symbol = "GBPUSD", weight = -0.119 },
            { symbol = "USDCAD", weight = 0.091 },
            { symbol = "USDSEK", weight = 0.042 },
            { symbol = "USDCHF", weight = 0.036 },
        ]
    "#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.verify.active_days, 7);
        assert_eq!(config.verify.hist_years, 3);
        assert_eq!(config.verify.scan_page_days, 30);
        assert_eq!(config.verify.price_jump_threshold, Decimal::new(10, 2));
        assert_eq!(
            config.aggregation.policies.policy_for(Timeframe::FiveMinute),
            Some(CoveragePolicy::Relaxed { min_required: 3 })
        );
        assert_eq!(config.aggregation.policies.policy_for(Timeframe::OneDay), Some(CoveragePolicy::Strict));
        assert_eq!(config.synthetic.components.len(), 6);
        assert_eq!(config.store.dataset, crate::store::Dataset::Historical);
    }

    #[test]
    fn test_missing_weight_table_is_rejected() {
        let without_synthetic = SAMPLE.split("[synthetic]").next().unwrap_or_default();
        assert!(matches!(parse_config(without_synthetic), Err(VerifyError::ConfigError(_))));
    }

    #[test]
    fn test_missing_threshold_is_rejected() {
        let without_jump = SAMPLE.replace("price_jump_threshold = 0.10", "");
        assert!(parse_config(&without_jump).is_err());
    }

    #[test]
    fn test_malformed_thresholds() {
        let inverted = SAMPLE.replace("staleness_critical_minutes = 15", "staleness_critical_minutes = 2");
        assert!(parse_config(&inverted).is_err());

        let bad_floor = SAMPLE.replace("min_required = 3", "min_required = 9");
        assert!(parse_config(&bad_floor).is_err());

        let zero_weight = SAMPLE.replace("weight = 0.036", "weight = 0");
        assert!(parse_config(&zero_weight).is_err());

        let no_paging = SAMPLE.replace("spread_threshold = 0.10", "spread_threshold = 0.10\nscan_page_days = 0");
        assert!(parse_config(&no_paging).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barsentry.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.verify.active_symbols, vec!["EURUSD", "USDJPY"]);
    }
}
