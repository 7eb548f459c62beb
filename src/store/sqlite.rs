/// SQLite-backed bar store (bundled engine, WAL journal)
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::data::Timeframe;
use crate::error::StoreError;
use crate::store::ingest_state::{pause_note, FAILING_STREAK};
use crate::store::schema::{column_identifier, SchemaDescriptor};
use crate::store::{
    BarStore, BarTable, IngestControl, IngestStateReader, ScanOrder, SeriesExtent, SeriesQuery, UpsertOutcome,
};
use crate::types::{Bar, DerivedBar, IngestState, IngestStatus, SymbolSet};

/// Bar store over a single SQLite connection.
///
/// Every call runs on the blocking pool; the mutex serialises access to the
/// connection, so concurrent writers on disjoint keys simply queue.
#[derive(Clone)]
pub struct SqliteBarStore {
    conn: Arc<Mutex<Connection>>,
    schema: SchemaDescriptor,
}

impl SqliteBarStore {
    pub fn open<P: AsRef<Path>>(path: P, schema: SchemaDescriptor) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        info!(
            "Opened bar store at {} (dataset: {})",
            path.as_ref().display(),
            schema.get_dataset().as_str()
        );
        Ok(SqliteBarStore {
            conn: Arc::new(Mutex::new(conn)),
            schema,
        })
    }

    pub fn open_in_memory(schema: SchemaDescriptor) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(SqliteBarStore {
            conn: Arc::new(Mutex::new(conn)),
            schema,
        })
    }

    pub fn get_schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    /// Create tables for local and test databases.
    ///
    /// Production schemas are owned by external migrations; this only creates
    /// what is missing and never alters existing tables.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.run_blocking(|conn, schema| {
            let raw = schema.table(BarTable::Raw);
            let derived = schema.table(BarTable::Derived);
            let ingest = schema.ingest_table();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {raw} (
                    canonical_symbol TEXT NOT NULL,
                    timeframe TEXT NOT NULL,
                    ts_utc INTEGER NOT NULL,
                    open TEXT,
                    high TEXT,
                    low TEXT,
                    close TEXT,
                    volume TEXT,
                    trade_count INTEGER,
                    vwap TEXT,
                    source TEXT NOT NULL,
                    ingested_at TEXT NOT NULL,
                    raw TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_{raw}_series ON {raw}(canonical_symbol, timeframe, ts_utc);

                CREATE TABLE IF NOT EXISTS {derived} (
                    canonical_symbol TEXT NOT NULL,
                    timeframe TEXT NOT NULL,
                    ts_utc INTEGER NOT NULL,
                    open TEXT,
                    high TEXT,
                    low TEXT,
                    close TEXT,
                    volume TEXT,
                    trade_count INTEGER,
                    vwap TEXT,
                    source TEXT NOT NULL,
                    ingested_at TEXT NOT NULL,
                    raw TEXT,
                    derivation_version INTEGER NOT NULL DEFAULT 1,
                    quality_score TEXT,
                    UNIQUE (canonical_symbol, timeframe, ts_utc)
                );

                CREATE TABLE IF NOT EXISTS {ingest} (
                    canonical_symbol TEXT NOT NULL,
                    timeframe TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    pause_fetch INTEGER NOT NULL DEFAULT 0,
                    hard_fail_streak INTEGER NOT NULL DEFAULT 0,
                    notes TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (canonical_symbol, timeframe)
                );"
            ))?;
            Ok(())
        })
        .await?;
        debug!("Bar store schema ensured");
        Ok(())
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &SchemaDescriptor) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let schema = self.schema.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&mut guard, &schema)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

const BASE_COLUMNS: &str = "canonical_symbol, timeframe, ts_utc, open, high, low, close";

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let column = column_identifier(column)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column.as_str() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn select_list(has_volume: bool, derived: bool) -> String {
    let volume = if has_volume { "volume" } else { "NULL AS volume" };
    let tags = if derived { ", derivation_version, quality_score" } else { "" };
    format!(
        "{}, {}, trade_count, vwap, source, ingested_at, raw{}",
        BASE_COLUMNS, volume, tags
    )
}

fn decode_err(column: &str, message: impl ToString) -> StoreError {
    StoreError::Decode {
        column: column.to_string(),
        message: message.to_string(),
    }
}

fn decimal_at(row: &Row, idx: usize, column: &str) -> Result<Option<Decimal>, StoreError> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Decimal::from_str(&t).map_err(|e| decode_err(column, e)))
        .transpose()
}

fn ts_from_secs(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| decode_err("ts_utc", format!("out of range: {}", secs)))
}

fn ts_from_text(column: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_err(column, e))
}

fn decode_bar(row: &Row) -> Result<Bar, StoreError> {
    let timeframe: String = row.get(1)?;
    let ingested_at: String = row.get(11)?;
    let raw: Option<String> = row.get(12)?;
    Ok(Bar {
        symbol: row.get(0)?,
        timeframe: Timeframe::from_str(&timeframe).map_err(|e| decode_err("timeframe", e))?,
        ts_utc: ts_from_secs(row.get(2)?)?,
        open: decimal_at(row, 3, "open")?,
        high: decimal_at(row, 4, "high")?,
        low: decimal_at(row, 5, "low")?,
        close: decimal_at(row, 6, "close")?,
        volume: decimal_at(row, 7, "volume")?,
        trade_count: row.get(8)?,
        vwap: decimal_at(row, 9, "vwap")?,
        source: row.get(10)?,
        ingested_at: ts_from_text("ingested_at", &ingested_at)?,
        raw: raw
            .map(|r| serde_json::from_str(&r).map_err(|e| decode_err("raw", e)))
            .transpose()?,
    })
}

fn decode_derived(row: &Row) -> Result<DerivedBar, StoreError> {
    let version: i64 = row.get(13)?;
    Ok(DerivedBar {
        bar: decode_bar(row)?,
        derivation_version: u32::try_from(version).map_err(|e| decode_err("derivation_version", e))?,
        quality_score: decimal_at(row, 14, "quality_score")?,
    })
}

fn decimal_value(value: Option<Decimal>) -> Value {
    match value {
        Some(d) => Value::Text(d.to_string()),
        None => Value::Null,
    }
}

fn bar_values(bar: &Bar, has_volume: bool) -> Vec<Value> {
    let mut values = vec![
        Value::Text(bar.symbol.clone()),
        Value::Text(bar.timeframe.as_str().to_string()),
        Value::Integer(bar.ts_utc.timestamp()),
        decimal_value(bar.open),
        decimal_value(bar.high),
        decimal_value(bar.low),
        decimal_value(bar.close),
    ];
    if has_volume {
        values.push(decimal_value(bar.volume));
    }
    values.push(bar.trade_count.map(Value::Integer).unwrap_or(Value::Null));
    values.push(decimal_value(bar.vwap));
    values.push(Value::Text(bar.source.clone()));
    values.push(Value::Text(bar.ingested_at.to_rfc3339_opts(SecondsFormat::Micros, true)));
    values.push(bar.raw.as_ref().map(|r| Value::Text(r.to_string())).unwrap_or(Value::Null));
    values
}

fn insert_columns(has_volume: bool) -> String {
    let volume = if has_volume { "volume, " } else { "" };
    format!(
        "{}, {}trade_count, vwap, source, ingested_at, raw",
        BASE_COLUMNS, volume
    )
}

fn placeholders(count: usize) -> String {
    (1..=count).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// Appends `AND canonical_symbol IN (...)` and pushes its parameters
fn symbol_filter(symbols: &SymbolSet, values: &mut Vec<Value>) -> String {
    match symbols {
        SymbolSet::All => String::new(),
        SymbolSet::Only(list) => {
            let start = values.len() + 1;
            let slots: Vec<String> = (0..list.len()).map(|i| format!("?{}", start + i)).collect();
            values.extend(list.iter().map(|s| Value::Text(s.clone())));
            format!(" AND canonical_symbol IN ({})", slots.join(", "))
        }
    }
}

fn is_empty_filter(symbols: &SymbolSet) -> bool {
    matches!(symbols, SymbolSet::Only(list) if list.is_empty())
}

fn series_sql(table: &str, has_volume: bool, derived: bool, query: &SeriesQuery, values: &mut Vec<Value>) -> String {
    values.push(Value::Text(query.timeframe.as_str().to_string()));
    values.push(Value::Integer(query.window.from.timestamp()));
    values.push(Value::Integer(query.window.to.timestamp()));
    let filter = symbol_filter(&query.symbols, values);
    let order = match query.order {
        ScanOrder::Timestamp => "canonical_symbol, ts_utc, rowid",
        ScanOrder::Arrival => "canonical_symbol, rowid",
    };
    format!(
        "SELECT {} FROM {} WHERE timeframe = ?1 AND ts_utc >= ?2 AND ts_utc < ?3{} ORDER BY {}",
        select_list(has_volume, derived),
        table,
        filter,
        order
    )
}

#[async_trait]
impl BarStore for SqliteBarStore {
    /// Connection plus both bar tables must answer
    async fn ping(&self) -> Result<(), StoreError> {
        self.run_blocking(|conn, schema| {
            for table in [BarTable::Raw, BarTable::Derived] {
                conn.prepare(&format!("SELECT 1 FROM {} LIMIT 1", schema.table(table)))?
                    .exists([])?;
            }
            Ok(())
        })
        .await
    }

    async fn range_query(&self, query: &SeriesQuery) -> Result<Vec<Bar>, StoreError> {
        if is_empty_filter(&query.symbols) {
            return Ok(Vec::new());
        }
        let query = query.clone();
        self.run_blocking(move |conn, schema| {
            let table = schema.table(query.table);
            let has_volume = has_column(conn, table, "volume")?;
            let mut values = Vec::new();
            let sql = series_sql(table, has_volume, false, &query, &mut values);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut bars = Vec::new();
            while let Some(row) = rows.next()? {
                bars.push(decode_bar(row)?);
            }
            Ok(bars)
        })
        .await
    }

    async fn range_query_derived(&self, query: &SeriesQuery) -> Result<Vec<DerivedBar>, StoreError> {
        if is_empty_filter(&query.symbols) {
            return Ok(Vec::new());
        }
        let query = query.clone();
        self.run_blocking(move |conn, schema| {
            let table = schema.table(BarTable::Derived);
            let has_volume = has_column(conn, table, "volume")?;
            let mut values = Vec::new();
            let sql = series_sql(table, has_volume, true, &query, &mut values);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut bars = Vec::new();
            while let Some(row) = rows.next()? {
                bars.push(decode_derived(row)?);
            }
            Ok(bars)
        })
        .await
    }

    async fn upsert(&self, bars: &[DerivedBar]) -> Result<UpsertOutcome, StoreError> {
        if bars.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let bars = bars.to_vec();
        let outcome = self
            .run_blocking(move |conn, schema| {
                let table = schema.table(BarTable::Derived);
                let has_volume = has_column(conn, table, "volume")?;
                let columns = insert_columns(has_volume);
                let column_count = columns.split(',').count() + 2;
                let volume_update = if has_volume { "volume = excluded.volume, " } else { "" };
                let write_sql = format!(
                    "INSERT INTO {table} ({columns}, derivation_version, quality_score)
                     VALUES ({values})
                     ON CONFLICT (canonical_symbol, timeframe, ts_utc) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        {volume_update}trade_count = excluded.trade_count,
                        vwap = excluded.vwap,
                        source = excluded.source,
                        ingested_at = excluded.ingested_at,
                        raw = excluded.raw,
                        derivation_version = excluded.derivation_version,
                        quality_score = excluded.quality_score",
                    values = placeholders(column_count),
                );
                let select_sql = format!(
                    "SELECT {} FROM {} WHERE canonical_symbol = ?1 AND timeframe = ?2 AND ts_utc = ?3",
                    select_list(has_volume, true),
                    table
                );

                let tx = conn.transaction()?;
                let mut outcome = UpsertOutcome::default();
                {
                    let mut select = tx.prepare(&select_sql)?;
                    let mut write = tx.prepare(&write_sql)?;
                    for row in &bars {
                        let existing = {
                            let mut found = select.query(params![
                                row.bar.symbol,
                                row.bar.timeframe.as_str(),
                                row.bar.ts_utc.timestamp()
                            ])?;
                            match found.next()? {
                                Some(r) => Some(decode_derived(r)?),
                                None => None,
                            }
                        };
                        if let Some(current) = &existing {
                            if current.same_content(row) {
                                outcome.unchanged += 1;
                                continue;
                            }
                        }
                        let mut values = bar_values(&row.bar, has_volume);
                        values.push(Value::Integer(i64::from(row.derivation_version)));
                        values.push(decimal_value(row.quality_score));
                        write.execute(params_from_iter(values.iter()))?;
                        if existing.is_some() {
                            outcome.updated += 1;
                        } else {
                            outcome.inserted += 1;
                        }
                    }
                }
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        debug!(
            "SQLite upsert: {} inserted, {} updated, {} unchanged",
            outcome.inserted, outcome.updated, outcome.unchanged
        );
        Ok(outcome)
    }

    async fn append_raw(&self, bars: &[Bar]) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let bars = bars.to_vec();
        self.run_blocking(move |conn, schema| {
            let table = schema.table(BarTable::Raw);
            let has_volume = has_column(conn, table, "volume")?;
            let columns = insert_columns(has_volume);
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns,
                placeholders(columns.split(',').count())
            );
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for bar in &bars {
                    stmt.execute(params_from_iter(bar_values(bar, has_volume).iter()))?;
                }
            }
            tx.commit()?;
            Ok(bars.len())
        })
        .await
    }

    async fn earliest_ts(
        &self,
        table: BarTable,
        timeframe: Timeframe,
        symbols: &SymbolSet,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if is_empty_filter(symbols) {
            return Ok(None);
        }
        let symbols = symbols.clone();
        self.run_blocking(move |conn, schema| {
            let mut values = vec![Value::Text(timeframe.as_str().to_string())];
            let filter = symbol_filter(&symbols, &mut values);
            let sql = format!(
                "SELECT MIN(ts_utc) FROM {} WHERE timeframe = ?1{}",
                schema.table(table),
                filter
            );
            let secs: Option<i64> = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
            secs.map(ts_from_secs).transpose()
        })
        .await
    }

    async fn series_extent(&self, query: &SeriesQuery) -> Result<SeriesExtent, StoreError> {
        if is_empty_filter(&query.symbols) {
            return Ok(SeriesExtent::default());
        }
        let query = query.clone();
        self.run_blocking(move |conn, schema| {
            let mut values = vec![
                Value::Text(query.timeframe.as_str().to_string()),
                Value::Integer(query.window.from.timestamp()),
                Value::Integer(query.window.to.timestamp()),
            ];
            let filter = symbol_filter(&query.symbols, &mut values);
            let sql = format!(
                "SELECT COUNT(*), MIN(ts_utc), MAX(ts_utc) FROM {} WHERE timeframe = ?1 AND ts_utc >= ?2 AND ts_utc < ?3{}",
                schema.table(query.table),
                filter
            );
            let (bars, first, last): (i64, Option<i64>, Option<i64>) =
                conn.query_row(&sql, params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
            Ok(SeriesExtent {
                bars,
                first_ts: first.map(ts_from_secs).transpose()?,
                last_ts: last.map(ts_from_secs).transpose()?,
            })
        })
        .await
    }

    async fn list_symbols(&self, table: BarTable, timeframe: Timeframe) -> Result<Vec<String>, StoreError> {
        self.run_blocking(move |conn, schema| {
            let sql = format!(
                "SELECT DISTINCT canonical_symbol FROM {} WHERE timeframe = ?1 ORDER BY canonical_symbol",
                schema.table(table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let symbols = stmt
                .query_map(params![timeframe.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(symbols)
        })
        .await
    }

    async fn tracks_volume(&self, table: BarTable) -> Result<bool, StoreError> {
        self.run_blocking(move |conn, schema| has_column(conn, schema.table(table), "volume"))
            .await
    }
}

fn decode_ingest_state(row: &Row) -> Result<IngestState, StoreError> {
    let timeframe: String = row.get(1)?;
    let status: String = row.get(2)?;
    let streak: i64 = row.get(4)?;
    let updated_at: String = row.get(6)?;
    Ok(IngestState {
        symbol: row.get(0)?,
        timeframe: Timeframe::from_str(&timeframe).map_err(|e| decode_err("timeframe", e))?,
        status: IngestStatus::from_str(&status).map_err(|e| decode_err("status", e))?,
        pause_fetch: row.get(3)?,
        hard_fail_streak: u32::try_from(streak).map_err(|e| decode_err("hard_fail_streak", e))?,
        notes: row.get(5)?,
        updated_at: ts_from_text("updated_at", &updated_at)?,
    })
}

fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl IngestStateReader for SqliteBarStore {
    async fn list_paused_or_orphaned(&self, symbols: &[String]) -> Result<HashSet<String>, StoreError> {
        if symbols.is_empty() {
            return Ok(HashSet::new());
        }
        let symbols = SymbolSet::Only(symbols.to_vec());
        self.run_blocking(move |conn, schema| {
            let mut values = Vec::new();
            let filter = symbol_filter(&symbols, &mut values);
            let sql = format!(
                "SELECT DISTINCT canonical_symbol FROM {}
                 WHERE (pause_fetch = 1 OR status IN ('paused', 'orphaned')){}",
                schema.ingest_table(),
                filter
            );
            let mut stmt = conn.prepare(&sql)?;
            let idle = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(idle)
        })
        .await
    }
}

#[async_trait]
impl IngestControl for SqliteBarStore {
    async fn set_paused(&self, symbol: &str, paused: bool, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let symbol = symbol.to_string();
        self.run_blocking(move |conn, schema| {
            let sql = format!(
                "UPDATE {} SET pause_fetch = ?1, notes = ?2, updated_at = ?3 WHERE canonical_symbol = ?4",
                schema.ingest_table()
            );
            let touched = conn.execute(&sql, params![paused, pause_note(paused, now), stamp(now), symbol])?;
            Ok(touched)
        })
        .await
    }

    async fn record_failure(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let (symbol, note) = (symbol.to_string(), note.to_string());
        self.run_blocking(move |conn, schema| {
            let table = schema.ingest_table();
            let sql = format!(
                "INSERT INTO {table} (canonical_symbol, timeframe, status, pause_fetch, hard_fail_streak, notes, updated_at)
                 VALUES (?1, ?2, 'running', 0, 1, ?3, ?4)
                 ON CONFLICT (canonical_symbol, timeframe) DO UPDATE SET
                    hard_fail_streak = hard_fail_streak + 1,
                    notes = excluded.notes,
                    updated_at = excluded.updated_at"
            );
            conn.execute(&sql, params![symbol, timeframe.as_str(), note, stamp(now)])?;
            let promote = format!(
                "UPDATE {table} SET status = 'failing'
                 WHERE canonical_symbol = ?1 AND timeframe = ?2 AND status = 'running' AND hard_fail_streak >= ?3"
            );
            conn.execute(&promote, params![symbol, timeframe.as_str(), FAILING_STREAK])?;
            let streak: i64 = conn.query_row(
                &format!("SELECT hard_fail_streak FROM {table} WHERE canonical_symbol = ?1 AND timeframe = ?2"),
                params![symbol, timeframe.as_str()],
                |row| row.get(0),
            )?;
            u32::try_from(streak).map_err(|e| decode_err("hard_fail_streak", e))
        })
        .await
    }

    async fn record_success(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Result<(), StoreError> {
        let symbol = symbol.to_string();
        self.run_blocking(move |conn, schema| {
            let sql = format!(
                "INSERT INTO {} (canonical_symbol, timeframe, status, pause_fetch, hard_fail_streak, updated_at)
                 VALUES (?1, ?2, 'running', 0, 0, ?3)
                 ON CONFLICT (canonical_symbol, timeframe) DO UPDATE SET
                    hard_fail_streak = 0,
                    status = CASE WHEN status = 'failing' THEN 'running' ELSE status END,
                    updated_at = excluded.updated_at",
                schema.ingest_table()
            );
            conn.execute(&sql, params![symbol, timeframe.as_str(), stamp(now)])?;
            Ok(())
        })
        .await
    }

    async fn get_states(&self, symbol: &str) -> Result<Vec<IngestState>, StoreError> {
        let symbol = symbol.to_string();
        self.run_blocking(move |conn, schema| {
            let sql = format!(
                "SELECT canonical_symbol, timeframe, status, pause_fetch, hard_fail_streak, notes, updated_at
                 FROM {} WHERE canonical_symbol = ?1",
                schema.ingest_table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![symbol])?;
            let mut states = Vec::new();
            while let Some(row) = rows.next()? {
                states.push(decode_ingest_state(row)?);
            }
            states.sort_by_key(|s| s.timeframe);
            Ok(states)
        })
        .await
    }

    async fn put_state(&self, state: IngestState) -> Result<(), StoreError> {
        self.run_blocking(move |conn, schema| {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (canonical_symbol, timeframe, status, pause_fetch, hard_fail_streak, notes, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                schema.ingest_table()
            );
            conn.execute(
                &sql,
                params![
                    state.symbol,
                    state.timeframe.as_str(),
                    state.status.as_str(),
                    state.pause_fetch,
                    state.hard_fail_streak,
                    state.notes,
                    stamp(state.updated_at)
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Dataset;
    use crate::types::TimeWindow;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;

    async fn store() -> SqliteBarStore {
        let store = SqliteBarStore::open_in_memory(SchemaDescriptor::resolve(Dataset::Live)).unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn minute_bar(symbol: &str, ts: DateTime<Utc>, close: &str) -> Bar {
        let c = Decimal::from_str(close).unwrap();
        Bar::new(symbol, Timeframe::OneMinute, ts, c, c, c, c).with_volume(Decimal::TEN)
    }

    #[tokio::test]
    async fn test_ping_and_empty_query() {
        let store = store().await;
        store.ping().await.unwrap();

        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let window = TimeWindow::new(t0, t0 + Duration::days(1)).unwrap();
        let rows = store
            .range_query(&SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, window))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(store.earliest_ts(BarTable::Raw, Timeframe::OneMinute, &SymbolSet::All).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_round_trip_and_idempotency() {
        let store = store().await;
        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap();
        let row = DerivedBar {
            bar: minute_bar("DXY", t0, "104.12345678").with_source("synthetic"),
            derivation_version: 1,
            quality_score: Some(Decimal::ONE),
        };

        let first = store.upsert(&[row.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);
        let again = store.upsert(&[row.clone()]).await.unwrap();
        assert_eq!(again, UpsertOutcome { inserted: 0, updated: 0, unchanged: 1 });

        let window = TimeWindow::new(t0, t0 + Duration::minutes(1)).unwrap();
        let stored = store
            .range_query_derived(&SeriesQuery::new(BarTable::Derived, Timeframe::OneMinute, window))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].same_content(&row));

        let mut recomputed = row.clone();
        recomputed.derivation_version = 2;
        let third = store.upsert(&[recomputed]).await.unwrap();
        assert_eq!(third.updated, 1);
    }

    #[tokio::test]
    async fn test_series_extent_is_computed_in_sql() {
        let store = store().await;
        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..90).map(|m| minute_bar("EURUSD", t0 + Duration::minutes(m), "1.1")).collect();
        store.append_raw(&bars).await.unwrap();

        let window = TimeWindow::new(t0 + Duration::minutes(30), t0 + Duration::days(1)).unwrap();
        let query = SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, window).with_symbols(SymbolSet::single("EURUSD"));
        let extent = store.series_extent(&query).await.unwrap();
        assert_eq!(extent.bars, 60);
        assert_eq!(extent.first_ts, Some(t0 + Duration::minutes(30)));
        assert_eq!(store.latest_ts(&query).await.unwrap(), Some(t0 + Duration::minutes(89)));

        let other = query.clone().with_symbols(SymbolSet::single("USDJPY"));
        assert_eq!(store.series_extent(&other).await.unwrap(), SeriesExtent::default());
    }

    #[tokio::test]
    async fn test_arrival_order_uses_rowid() {
        let store = store().await;
        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap();
        store
            .append_raw(&[minute_bar("EURUSD", t0 + Duration::minutes(1), "1.1"), minute_bar("EURUSD", t0, "1.0")])
            .await
            .unwrap();

        let window = TimeWindow::new(t0, t0 + Duration::hours(1)).unwrap();
        let arrival = store
            .range_query(&SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, window).in_arrival_order())
            .await
            .unwrap();
        assert_eq!(arrival[0].ts_utc, t0 + Duration::minutes(1));

        let ordered = store
            .range_query(
                &SeriesQuery::new(BarTable::Raw, Timeframe::OneMinute, window)
                    .with_symbols(SymbolSet::single("EURUSD")),
            )
            .await
            .unwrap();
        assert_eq!(ordered[0].ts_utc, t0);
        assert_eq!(store.list_symbols(BarTable::Raw, Timeframe::OneMinute).await.unwrap(), vec!["EURUSD"]);
    }

    #[tokio::test]
    async fn test_ingest_pause_flags() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store.put_state(IngestState::new("EURUSD", Timeframe::OneMinute, now)).await.unwrap();

        assert_eq!(store.set_paused("EURUSD", true, now).await.unwrap(), 1);
        let idle = store
            .list_paused_or_orphaned(&["EURUSD".to_string(), "USDJPY".to_string()])
            .await
            .unwrap();
        assert!(idle.contains("EURUSD"));

        for _ in 0..FAILING_STREAK {
            store.record_failure("USDJPY", Timeframe::OneMinute, "timeout", now).await.unwrap();
        }
        let states = store.get_states("USDJPY").await.unwrap();
        assert_eq!(states[0].status, IngestStatus::Failing);
        assert_eq!(states[0].hard_fail_streak, FAILING_STREAK);
    }
}
