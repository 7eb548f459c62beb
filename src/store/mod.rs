/// Bar store adapter: the read/write contract every component goes through
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Timeframe;
use crate::error::StoreError;
use crate::types::{Bar, DerivedBar, SymbolSet, TimeWindow};

pub mod ingest_state;
pub mod memory;
pub mod schema;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use ingest_state::{IngestControl, IngestStateReader, MemoryIngestState};
pub use memory::MemoryBarStore;
pub use schema::{Dataset, SchemaDescriptor};
pub use sqlite::SqliteBarStore;

/// Logical bar table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarTable {
    /// 1-minute ingestion table. Append-only; key uniqueness is owned by the writer.
    Raw,
    /// Aggregated and synthetic bars, unique on (symbol, timeframe, ts_utc)
    Derived,
}

impl BarTable {
    pub fn as_str(&self) -> &str {
        match self {
            BarTable::Raw => "raw",
            BarTable::Derived => "derived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Ascending (symbol, ts_utc), ties broken by arrival
    Timestamp,
    /// Ascending (symbol, arrival sequence)
    Arrival,
}

/// Range query over one table and timeframe, half-open on the window
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub table: BarTable,
    pub symbols: SymbolSet,
    pub timeframe: Timeframe,
    pub window: TimeWindow,
    pub order: ScanOrder,
}

impl SeriesQuery {
    pub fn new(table: BarTable, timeframe: Timeframe, window: TimeWindow) -> Self {
        SeriesQuery {
            table,
            symbols: SymbolSet::All,
            timeframe,
            window,
            order: ScanOrder::Timestamp,
        }
    }

    pub fn with_symbols(mut self, symbols: SymbolSet) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn in_arrival_order(mut self) -> Self {
        self.order = ScanOrder::Arrival;
        self
    }
}

/// Counts reported by an upsert call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Rows already present with identical content; left untouched
    pub unchanged: usize,
}

impl UpsertOutcome {
    pub fn merge(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Row count and timestamp bounds of a series, computed by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesExtent {
    pub bars: i64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}

impl SeriesExtent {
    /// Fold one row into the running totals
    pub fn observe(&mut self, ts: DateTime<Utc>) {
        self.bars += 1;
        self.first_ts = Some(self.first_ts.map_or(ts, |t| t.min(ts)));
        self.last_ts = Some(self.last_ts.map_or(ts, |t| t.max(ts)));
    }
}

#[async_trait]
pub trait BarStore: Send + Sync {
    /// Connectivity probe. A failure here aborts a verification run.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Bars of `query.table` matching the query. Empty result is not an error.
    async fn range_query(&self, query: &SeriesQuery) -> Result<Vec<Bar>, StoreError>;

    /// Derived rows with their derivation tags. Always reads the derived table.
    async fn range_query_derived(&self, query: &SeriesQuery) -> Result<Vec<DerivedBar>, StoreError>;

    /// Insert missing keys, update changed rows, skip identical ones.
    ///
    /// One call is one transaction: either every row is applied or none is.
    async fn upsert(&self, bars: &[DerivedBar]) -> Result<UpsertOutcome, StoreError>;

    /// Append rows to the raw ingestion table without key deduplication
    async fn append_raw(&self, bars: &[Bar]) -> Result<usize, StoreError>;

    async fn earliest_ts(
        &self,
        table: BarTable,
        timeframe: Timeframe,
        symbols: &SymbolSet,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Count, first and last timestamp of the rows matching `query`, without loading them
    async fn series_extent(&self, query: &SeriesQuery) -> Result<SeriesExtent, StoreError>;

    /// Latest timestamp inside `query.window`
    async fn latest_ts(&self, query: &SeriesQuery) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.series_extent(query).await?.last_ts)
    }

    /// Distinct symbols present in a table for a timeframe, sorted
    async fn list_symbols(&self, table: BarTable, timeframe: Timeframe) -> Result<Vec<String>, StoreError>;

    /// Whether the table carries a volume column
    async fn tracks_volume(&self, table: BarTable) -> Result<bool, StoreError>;
}
