/// Allow-listed table and column identifiers for SQL-backed stores
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::BarTable;

pub const ALLOWED_TABLES: &[&str] = &[
    "data_bars",
    "derived_data_bars",
    "historical_bars_1m",
    "historical_bars_derived",
    "data_ingest_state",
];

pub const BAR_COLUMNS: &[&str] = &[
    "canonical_symbol",
    "timeframe",
    "ts_utc",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "trade_count",
    "vwap",
    "source",
    "ingested_at",
    "raw",
];

pub const DERIVED_COLUMNS: &[&str] = &["derivation_version", "quality_score"];

pub const INGEST_STATE_COLUMNS: &[&str] = &[
    "canonical_symbol",
    "timeframe",
    "status",
    "pause_fetch",
    "hard_fail_streak",
    "notes",
    "updated_at",
];

/// Which pair of bar tables a run reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    #[default]
    Live,
    Historical,
}

impl Dataset {
    pub fn as_str(&self) -> &str {
        match self {
            Dataset::Live => "live",
            Dataset::Historical => "historical",
        }
    }
}

/// Identifier that passed the allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Validate a table name against the allow-list
pub fn table_identifier(name: &str) -> Result<Identifier, StoreError> {
    if !is_plain_identifier(name) || !ALLOWED_TABLES.contains(&name) {
        return Err(StoreError::UnknownIdentifier(format!("table '{}'", name)));
    }
    Ok(Identifier(name.to_string()))
}

/// Validate a column name against every known column list
pub fn column_identifier(name: &str) -> Result<Identifier, StoreError> {
    let known = BAR_COLUMNS.contains(&name)
        || DERIVED_COLUMNS.contains(&name)
        || INGEST_STATE_COLUMNS.contains(&name);
    if !is_plain_identifier(name) || !known {
        return Err(StoreError::UnknownIdentifier(format!("column '{}'", name)));
    }
    Ok(Identifier(name.to_string()))
}

/// Table names resolved once at startup.
///
/// SQL text is only ever assembled from identifiers held here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    dataset: Dataset,
    raw_table: Identifier,
    derived_table: Identifier,
    ingest_table: Identifier,
}

impl SchemaDescriptor {
    pub fn resolve(dataset: Dataset) -> Self {
        let (raw, derived) = match dataset {
            Dataset::Live => ("data_bars", "derived_data_bars"),
            Dataset::Historical => ("historical_bars_1m", "historical_bars_derived"),
        };
        SchemaDescriptor {
            dataset,
            raw_table: Identifier(raw.to_string()),
            derived_table: Identifier(derived.to_string()),
            ingest_table: Identifier("data_ingest_state".to_string()),
        }
    }

    /// Descriptor with explicit table names, each checked against the allow-list
    pub fn with_tables(dataset: Dataset, raw: &str, derived: &str) -> Result<Self, StoreError> {
        let raw_table = table_identifier(raw)?;
        let derived_table = table_identifier(derived)?;
        if raw_table == derived_table {
            return Err(StoreError::UnknownIdentifier(format!(
                "raw and derived tables must differ (both '{}')",
                raw
            )));
        }
        Ok(SchemaDescriptor {
            dataset,
            raw_table,
            derived_table,
            ingest_table: table_identifier("data_ingest_state")?,
        })
    }

    pub fn get_dataset(&self) -> Dataset {
        self.dataset
    }

    pub fn table(&self, table: BarTable) -> &str {
        match table {
            BarTable::Raw => self.raw_table.as_str(),
            BarTable::Derived => self.derived_table.as_str(),
        }
    }

    pub fn ingest_table(&self) -> &str {
        self.ingest_table.as_str()
    }
}
