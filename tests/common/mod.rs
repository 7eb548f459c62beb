#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use barsentry::config::Config;
use barsentry::data::Timeframe;
use barsentry::store::{BarStore, Dataset, SchemaDescriptor, SqliteBarStore};
use barsentry::types::Bar;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Monday 2025-04-07 14:00 UTC
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 7, 14, 0, 0).unwrap()
}

pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("bars.db")
}

pub async fn sqlite_store(dir: &Path) -> Arc<SqliteBarStore> {
    let store = SqliteBarStore::open(db_path(dir), SchemaDescriptor::resolve(Dataset::Live)).unwrap();
    store.ensure_schema().await.unwrap();
    Arc::new(store)
}

pub fn minute_bar(symbol: &str, ts: DateTime<Utc>, price: Decimal) -> Bar {
    Bar::new(symbol, Timeframe::OneMinute, ts, price, price, price, price).with_volume(dec!(1))
}

/// `count` consecutive minutes ending one minute before `end`
pub fn minutes_until(symbol: &str, end: DateTime<Utc>, count: i64, price: Decimal) -> Vec<Bar> {
    (1..=count)
        .rev()
        .map(|m| minute_bar(symbol, end - Duration::minutes(m), price))
        .collect()
}

pub fn components() -> Vec<(&'static str, Decimal)> {
    vec![
        ("EURUSD", dec!(1.0800)),
        ("USDJPY", dec!(151.20)),
        ("GBPUSD", dec!(1.2600)),
        ("USDCAD", dec!(1.3600)),
        ("USDSEK", dec!(10.600)),
        ("USDCHF", dec!(0.9000)),
    ]
}

/// Every index component over the two hours before `now()`
pub async fn seed_components(store: &dyn BarStore) {
    let mut bars = Vec::new();
    for (symbol, price) in components() {
        bars.extend(minutes_until(symbol, now(), 120, price));
    }
    store.append_raw(&bars).await.unwrap();
}

pub fn config() -> Config {
    Config::default()
}
