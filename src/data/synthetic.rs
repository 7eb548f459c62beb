/// Synthetic index (DXY) computed from FX component closes
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::data::aggregation::WriteState;
use crate::data::Timeframe;
use crate::error::{Result, VerifyError};
use crate::store::{BarStore, BarTable, SeriesQuery};
use crate::types::{Bar, DerivedBar, SymbolSet, TimeWindow};

pub const SYNTHETIC_SOURCE: &str = "synthetic";

/// Stored index prices carry 8 decimal places
pub const PRICE_SCALE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexComponent {
    pub symbol: String,
    /// Signed exponent applied to the component price
    pub weight: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default = "default_index_symbol")]
    pub symbol: String,
    pub base: Decimal,
    pub components: Vec<IndexComponent>,
}

fn default_index_symbol() -> String {
    "DXY".to_string()
}

impl IndexDefinition {
    /// ICE US Dollar Index weights
    pub fn dxy() -> Self {
        let component = |symbol: &str, weight: Decimal| IndexComponent {
            symbol: symbol.to_string(),
            weight,
        };
        IndexDefinition {
            symbol: default_index_symbol(),
            base: Decimal::new(5014348112, 8),
            components: vec![
                component("EURUSD", Decimal::new(-576, 3)),
                component("USDJPY", Decimal::new(136, 3)),
                component("GBPUSD", Decimal::new(-119, 3)),
                component("USDCAD", Decimal::new(91, 3)),
                component("USDSEK", Decimal::new(42, 3)),
                component("USDCHF", Decimal::new(36, 3)),
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(VerifyError::ConfigError("synthetic.symbol is empty".to_string()));
        }
        if self.base <= Decimal::ZERO {
            return Err(VerifyError::ConfigError(format!("Invalid synthetic.base: {}", self.base)));
        }
        if self.components.is_empty() {
            return Err(VerifyError::ConfigError("synthetic.components weight table is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            if component.weight.is_zero() {
                return Err(VerifyError::ConfigError(format!(
                    "Component {} has a zero weight",
                    component.symbol
                )));
            }
            if component.symbol == self.symbol || !seen.insert(component.symbol.as_str()) {
                return Err(VerifyError::ConfigError(format!(
                    "Duplicate or self-referencing component: {}",
                    component.symbol
                )));
            }
        }
        Ok(())
    }

    pub fn component_symbols(&self) -> Vec<String> {
        self.components.iter().map(|c| c.symbol.clone()).collect()
    }

    /// `base * Π c_i ^ w_i`, evaluated as `base * exp(Σ w_i ln c_i)`.
    ///
    /// `Ok(None)` when a component is missing or not strictly positive.
    pub fn price(&self, closes: &HashMap<String, Decimal>) -> Result<Option<Decimal>> {
        let mut exponent = Decimal::ZERO;
        for component in &self.components {
            let Some(&price) = closes.get(&component.symbol) else {
                return Ok(None);
            };
            if price <= Decimal::ZERO {
                return Ok(None);
            }
            let term = price
                .checked_ln()
                .and_then(|ln| ln.checked_mul(component.weight))
                .ok_or_else(|| {
                    VerifyError::ComputationFailed(format!("ln overflow for {} at {}", component.symbol, price))
                })?;
            exponent = exponent
                .checked_add(term)
                .ok_or_else(|| VerifyError::ComputationFailed("exponent overflow".to_string()))?;
        }
        let value = exponent
            .checked_exp()
            .and_then(|e| e.checked_mul(self.base))
            .ok_or_else(|| VerifyError::ComputationFailed(format!("exp overflow for exponent {}", exponent)))?;
        Ok(Some(value.round_dp(PRICE_SCALE)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticOutcome {
    pub success: bool,
    pub symbol: String,
    pub version: u32,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Timestamps without a full valid set of components
    pub skipped: usize,
    pub write_state: WriteState,
    pub error: Option<String>,
}

impl SyntheticOutcome {
    fn failed(symbol: &str, version: u32, message: String) -> Self {
        SyntheticOutcome {
            success: false,
            symbol: symbol.to_string(),
            version,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            write_state: WriteState::NothingWritten,
            error: Some(message),
        }
    }
}

pub struct SyntheticIndexCalculator {
    store: Arc<dyn BarStore>,
    definition: IndexDefinition,
    batch_size: usize,
}

impl SyntheticIndexCalculator {
    pub fn new(store: Arc<dyn BarStore>, definition: IndexDefinition, batch_size: usize) -> Self {
        SyntheticIndexCalculator {
            store,
            definition,
            batch_size: batch_size.max(1),
        }
    }

    pub fn get_definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Build index rows for every timestamp where all components are valid.
    ///
    /// Returns the rows and the number of skipped timestamps. Any arithmetic
    /// failure fails the whole range.
    /// A component's close at a timestamp is its last arrival, not the largest close.
    pub fn build_rows(&self, components: Vec<Bar>, version: u32) -> Result<(Vec<DerivedBar>, usize)> {
        let mut pivot: BTreeMap<DateTime<Utc>, HashMap<String, Decimal>> = BTreeMap::new();
        for bar in components {
            let closes = pivot.entry(bar.ts_utc).or_default();
            match bar.close {
                Some(close) => {
                    closes.insert(bar.symbol, close);
                }
                None => {
                    closes.remove(&bar.symbol);
                }
            }
        }

        let now = Utc::now();
        let mut rows = Vec::with_capacity(pivot.len());
        let mut skipped = 0;
        for (ts, closes) in pivot {
            let Some(price) = self.definition.price(&closes)? else {
                skipped += 1;
                continue;
            };
            rows.push(DerivedBar {
                bar: Bar {
                    symbol: self.definition.symbol.clone(),
                    timeframe: Timeframe::OneMinute,
                    ts_utc: ts,
                    open: Some(price),
                    high: Some(price),
                    low: Some(price),
                    close: Some(price),
                    volume: Some(Decimal::ZERO),
                    trade_count: Some(0),
                    vwap: None,
                    source: SYNTHETIC_SOURCE.to_string(),
                    ingested_at: now,
                    raw: Some(json!({ "kind": "dxy", "version": version })),
                },
                derivation_version: version,
                quality_score: Some(Decimal::ONE),
            });
        }
        Ok((rows, skipped))
    }

    pub async fn compute_range(&self, from: DateTime<Utc>, to: DateTime<Utc>, version: u32) -> SyntheticOutcome {
        let symbol = self.definition.symbol.as_str();
        if from >= to {
            return SyntheticOutcome::failed(symbol, version, "from must be before to".to_string());
        }

        let query = SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, TimeWindow { from, to })
            .with_symbols(SymbolSet::Only(self.definition.component_symbols()));
        let components = match self.store.range_query(&query).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Failed to read {} components: {}", symbol, e);
                return SyntheticOutcome::failed(symbol, version, format!("component read failed: {}", e));
            }
        };

        // Everything is computed before the first write
        let (rows, skipped) = match self.build_rows(components, version) {
            Ok(built) => built,
            Err(e) => {
                warn!("{} computation failed for {} -> {}: {}", symbol, from, to, e);
                return SyntheticOutcome::failed(symbol, version, e.to_string());
            }
        };

        let mut outcome = SyntheticOutcome {
            success: false,
            symbol: symbol.to_string(),
            version,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped,
            write_state: WriteState::NothingWritten,
            error: None,
        };

        for batch in rows.chunks(self.batch_size) {
            match self.store.upsert(batch).await {
                Ok(written) => {
                    outcome.inserted += written.inserted;
                    outcome.updated += written.updated;
                    outcome.unchanged += written.unchanged;
                    debug!("{} batch of {} rows applied", symbol, batch.len());
                }
                Err(e) => {
                    if outcome.inserted + outcome.updated > 0 {
                        outcome.write_state = WriteState::PartiallyWritten;
                    }
                    warn!("{} upsert failed ({:?}): {}", symbol, outcome.write_state, e);
                    outcome.error = Some(format!("upsert failed: {}", e));
                    return outcome;
                }
            }
        }

        outcome.success = true;
        outcome.write_state = WriteState::Complete;
        info!(
            "💵 {} v{} {} -> {}: {} inserted, {} updated, {} unchanged, {} skipped",
            symbol, version, from, to, outcome.inserted, outcome.updated, outcome.unchanged, outcome.skipped
        );
        outcome
    }
}
