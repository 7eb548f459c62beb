/// In-memory bar store for tests and dry runs
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::data::Timeframe;
use crate::error::StoreError;
use crate::store::{BarStore, BarTable, ScanOrder, SeriesExtent, SeriesQuery, UpsertOutcome};
use crate::types::{Bar, DerivedBar, SymbolSet};

type BarKey = (String, Timeframe, DateTime<Utc>);

#[derive(Default)]
struct MemoryTables {
    /// Raw rows with their arrival sequence; duplicates are kept
    raw: Vec<(u64, Bar)>,
    next_seq: u64,
    derived: BTreeMap<BarKey, DerivedBar>,
}

/// Thread-safe in-memory store implementing the full `BarStore` contract
#[derive(Clone)]
pub struct MemoryBarStore {
    tables: Arc<RwLock<MemoryTables>>,
    track_volume: bool,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        MemoryBarStore {
            tables: Arc::new(RwLock::new(MemoryTables::default())),
            track_volume: true,
        }
    }

    /// Store that behaves like a schema without a volume column
    pub fn without_volume() -> Self {
        MemoryBarStore {
            tables: Arc::new(RwLock::new(MemoryTables::default())),
            track_volume: false,
        }
    }

    pub async fn raw_count(&self) -> usize {
        self.tables.read().await.raw.len()
    }

    pub async fn derived_count(&self) -> usize {
        self.tables.read().await.derived.len()
    }

    fn strip_volume(&self, mut bar: Bar) -> Bar {
        if !self.track_volume {
            bar.volume = None;
        }
        bar
    }
}

impl Default for MemoryBarStore {
    fn default() -> Self {
        MemoryBarStore::new()
    }
}

fn matches(bar: &Bar, query: &SeriesQuery) -> bool {
    bar.timeframe == query.timeframe && query.window.contains(bar.ts_utc) && query.symbols.contains(&bar.symbol)
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn range_query(&self, query: &SeriesQuery) -> Result<Vec<Bar>, StoreError> {
        let tables = self.tables.read().await;
        let bars = match query.table {
            BarTable::Raw => {
                let mut rows: Vec<(u64, Bar)> = tables
                    .raw
                    .iter()
                    .filter(|(_, bar)| matches(bar, query))
                    .cloned()
                    .collect();
                match query.order {
                    ScanOrder::Timestamp => {
                        rows.sort_by(|a, b| (&a.1.symbol, a.1.ts_utc, a.0).cmp(&(&b.1.symbol, b.1.ts_utc, b.0)))
                    }
                    ScanOrder::Arrival => rows.sort_by(|a, b| (&a.1.symbol, a.0).cmp(&(&b.1.symbol, b.0))),
                }
                rows.into_iter().map(|(_, bar)| bar).collect::<Vec<_>>()
            }
            // BTreeMap iteration is already (symbol, timeframe, ts) ordered
            BarTable::Derived => tables
                .derived
                .values()
                .filter(|d| matches(&d.bar, query))
                .map(|d| d.bar.clone())
                .collect(),
        };
        Ok(bars.into_iter().map(|b| self.strip_volume(b)).collect())
    }

    async fn range_query_derived(&self, query: &SeriesQuery) -> Result<Vec<DerivedBar>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .derived
            .values()
            .filter(|d| matches(&d.bar, query))
            .cloned()
            .map(|mut d| {
                d.bar = self.strip_volume(d.bar);
                d
            })
            .collect())
    }

    async fn upsert(&self, bars: &[DerivedBar]) -> Result<UpsertOutcome, StoreError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let mut outcome = UpsertOutcome::default();

        for row in bars {
            match tables.derived.get_mut(&row.key()) {
                Some(existing) if existing.same_content(row) => outcome.unchanged += 1,
                Some(existing) => {
                    *existing = row.clone();
                    outcome.updated += 1;
                }
                None => {
                    tables.derived.insert(row.key(), row.clone());
                    outcome.inserted += 1;
                }
            }
        }

        debug!(
            "Memory upsert: {} inserted, {} updated, {} unchanged",
            outcome.inserted, outcome.updated, outcome.unchanged
        );
        Ok(outcome)
    }

    async fn append_raw(&self, bars: &[Bar]) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        for bar in bars {
            let seq = tables.next_seq;
            tables.next_seq += 1;
            tables.raw.push((seq, bar.clone()));
        }
        Ok(bars.len())
    }

    async fn earliest_ts(
        &self,
        table: BarTable,
        timeframe: Timeframe,
        symbols: &SymbolSet,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tables = self.tables.read().await;
        let earliest = match table {
            BarTable::Raw => tables
                .raw
                .iter()
                .map(|(_, b)| b)
                .filter(|b| b.timeframe == timeframe && symbols.contains(&b.symbol))
                .map(|b| b.ts_utc)
                .min(),
            BarTable::Derived => tables
                .derived
                .values()
                .filter(|d| d.bar.timeframe == timeframe && symbols.contains(&d.bar.symbol))
                .map(|d| d.bar.ts_utc)
                .min(),
        };
        Ok(earliest)
    }

    async fn series_extent(&self, query: &SeriesQuery) -> Result<SeriesExtent, StoreError> {
        let tables = self.tables.read().await;
        let mut extent = SeriesExtent::default();
        match query.table {
            BarTable::Raw => tables
                .raw
                .iter()
                .filter(|(_, b)| matches(b, query))
                .for_each(|(_, b)| extent.observe(b.ts_utc)),
            BarTable::Derived => tables
                .derived
                .values()
                .filter(|d| matches(&d.bar, query))
                .for_each(|d| extent.observe(d.bar.ts_utc)),
        }
        Ok(extent)
    }

    async fn list_symbols(&self, table: BarTable, timeframe: Timeframe) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let symbols: BTreeSet<String> = match table {
            BarTable::Raw => tables
                .raw
                .iter()
                .filter(|(_, b)| b.timeframe == timeframe)
                .map(|(_, b)| b.symbol.clone())
                .collect(),
            BarTable::Derived => tables
                .derived
                .values()
                .filter(|d| d.bar.timeframe == timeframe)
                .map(|d| d.bar.symbol.clone())
                .collect(),
        };
        Ok(symbols.into_iter().collect())
    }

    async fn tracks_volume(&self, _table: BarTable) -> Result<bool, StoreError> {
        Ok(self.track_volume)
    }
}
