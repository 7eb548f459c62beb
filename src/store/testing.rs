/// Fault-injecting store wrapper for failure-path tests
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::data::Timeframe;
use crate::error::StoreError;
use crate::store::{BarStore, BarTable, MemoryBarStore, SeriesExtent, SeriesQuery, UpsertOutcome};
use crate::types::{Bar, DerivedBar, SymbolSet};

#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryBarStore,
    /// Number of upsert calls that succeed before every later call fails
    pub upserts_before_failure: Option<usize>,
    pub fail_derived_reads: bool,
    pub fail_ping: bool,
    upsert_calls: Arc<AtomicUsize>,
    derived_reads_blocked: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: MemoryBarStore) -> Self {
        FlakyStore {
            inner,
            ..FlakyStore::default()
        }
    }

    pub fn failing_upserts_after(mut self, calls: usize) -> Self {
        self.upserts_before_failure = Some(calls);
        self
    }

    pub fn failing_derived_reads(mut self) -> Self {
        self.fail_derived_reads = true;
        self
    }

    pub fn failing_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    /// Simulate a derived-table column going missing mid-run
    pub fn block_derived_reads(&self) {
        self.derived_reads_blocked.store(true, Ordering::SeqCst);
    }

    fn derived_read_error(&self) -> Option<StoreError> {
        if self.fail_derived_reads || self.derived_reads_blocked.load(Ordering::SeqCst) {
            Some(StoreError::Unavailable("no such column: vwap".to_string()))
        } else {
            None
        }
    }
}

#[async_trait]
impl BarStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.fail_ping {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.ping().await
    }

    async fn range_query(&self, query: &SeriesQuery) -> Result<Vec<Bar>, StoreError> {
        if query.table == BarTable::Derived {
            if let Some(e) = self.derived_read_error() {
                return Err(e);
            }
        }
        self.inner.range_query(query).await
    }

    async fn range_query_derived(&self, query: &SeriesQuery) -> Result<Vec<DerivedBar>, StoreError> {
        if let Some(e) = self.derived_read_error() {
            return Err(e);
        }
        self.inner.range_query_derived(query).await
    }

    async fn upsert(&self, bars: &[DerivedBar]) -> Result<UpsertOutcome, StoreError> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.upserts_before_failure {
            if call >= limit {
                return Err(StoreError::Unavailable("disk I/O error".to_string()));
            }
        }
        self.inner.upsert(bars).await
    }

    async fn append_raw(&self, bars: &[Bar]) -> Result<usize, StoreError> {
        self.inner.append_raw(bars).await
    }

    async fn earliest_ts(
        &self,
        table: BarTable,
        timeframe: Timeframe,
        symbols: &SymbolSet,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.earliest_ts(table, timeframe, symbols).await
    }

    async fn series_extent(&self, query: &SeriesQuery) -> Result<SeriesExtent, StoreError> {
        if query.table == BarTable::Derived {
            if let Some(e) = self.derived_read_error() {
                return Err(e);
            }
        }
        self.inner.series_extent(query).await
    }

    async fn list_symbols(&self, table: BarTable, timeframe: Timeframe) -> Result<Vec<String>, StoreError> {
        self.inner.list_symbols(table, timeframe).await
    }

    async fn tracks_volume(&self, table: BarTable) -> Result<bool, StoreError> {
        self.inner.tracks_volume(table).await
    }
}
