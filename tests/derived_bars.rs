mod common;

use barsentry::data::{AggregationRequest, CoveragePolicy, IndexDefinition, Timeframe, WriteState};
use barsentry::store::{BarStore, BarTable, SeriesQuery};
use barsentry::types::{Bar, SymbolSet};
use barsentry::{TimeWindow, VerificationEngine};
use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

use common::*;

fn reference_price(definition: &IndexDefinition) -> f64 {
    let base = definition.base.to_f64().unwrap();
    components().iter().fold(base, |acc, (symbol, price)| {
        let weight = definition
            .components
            .iter()
            .find(|c| c.symbol == *symbol)
            .and_then(|c| c.weight.to_f64())
            .unwrap();
        acc * price.to_f64().unwrap().powf(weight)
    })
}

#[tokio::test]
async fn test_synthetic_index_on_sqlite_is_idempotent_per_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(dir.path()).await;
    seed_components(store.as_ref()).await;
    let engine = VerificationEngine::new(store.clone(), config());
    let (from, to) = (now() - Duration::minutes(30), now());

    let first = engine.compute_synthetic_index(from, to, 1).await;
    assert!(first.success);
    assert_eq!(first.inserted, 30);

    let again = engine.compute_synthetic_index(from, to, 1).await;
    assert_eq!((again.inserted, again.updated, again.unchanged), (0, 0, 30));

    let bumped = engine.compute_synthetic_index(from, to, 2).await;
    assert_eq!((bumped.inserted, bumped.updated), (0, 30));

    let window = TimeWindow::new(from, to).unwrap();
    let rows = store
        .range_query_derived(
            &SeriesQuery::new(BarTable::Derived, Timeframe::OneMinute, window).with_symbols(SymbolSet::single("DXY")),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 30);
    assert!(rows.iter().all(|r| r.derivation_version == 2));

    let expected = reference_price(&engine.get_config().synthetic);
    let actual = rows[0].bar.close.and_then(|c| c.to_f64()).unwrap();
    assert!(((actual - expected) / expected).abs() < 1e-6, "{} vs {}", actual, expected);
}

#[tokio::test]
async fn test_minutes_missing_a_component_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(dir.path()).await;

    let mut bars: Vec<Bar> = Vec::new();
    for (symbol, price) in components() {
        let count = if symbol == "USDSEK" { 5 } else { 10 };
        bars.extend(minutes_until(symbol, now(), count, price));
    }
    store.append_raw(&bars).await.unwrap();

    let engine = VerificationEngine::new(store.clone(), config());
    let outcome = engine.compute_synthetic_index(now() - Duration::minutes(10), now(), 1).await;
    assert!(outcome.success);
    assert_eq!(outcome.inserted, 5);
    assert_eq!(outcome.skipped, 5);
}

#[tokio::test]
async fn test_five_minute_rollup_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(dir.path()).await;

    let t0 = now() - Duration::minutes(10);
    let prices = [
        (dec!(1.1000), dec!(1.1010), dec!(1.0995), dec!(1.1005)),
        (dec!(1.1005), dec!(1.1020), dec!(1.1000), dec!(1.1015)),
        (dec!(1.1015), dec!(1.1016), dec!(1.0980), dec!(1.0990)),
        (dec!(1.0990), dec!(1.1001), dec!(1.0985), dec!(1.1000)),
        (dec!(1.1000), dec!(1.1008), dec!(1.0996), dec!(1.1007)),
    ];
    let children: Vec<Bar> = prices
        .iter()
        .enumerate()
        .map(|(i, (o, h, l, c))| {
            Bar::new("EURUSD", Timeframe::OneMinute, t0 + Duration::minutes(i as i64), *o, *h, *l, *c)
                .with_volume(dec!(2))
        })
        .collect();
    store.append_raw(&children).await.unwrap();

    let engine = VerificationEngine::new(store.clone(), config());
    let request = AggregationRequest {
        symbol: "EURUSD".to_string(),
        timeframe: Timeframe::FiveMinute,
        window: TimeWindow::new(t0, t0 + Duration::minutes(5)).unwrap(),
        policy: CoveragePolicy::Strict,
        derivation_version: 1,
        child_table: BarTable::Raw,
    };

    let outcome = engine.compute_aggregates(&request).await;
    assert!(outcome.success);
    assert_eq!((outcome.inserted, outcome.complete_buckets), (1, 1));
    assert_eq!(outcome.write_state, WriteState::Complete);

    let rerun = engine.compute_aggregates(&request).await;
    assert_eq!((rerun.inserted, rerun.updated, rerun.unchanged), (0, 0, 1));

    let stored = store
        .range_query_derived(&SeriesQuery::new(BarTable::Derived, Timeframe::FiveMinute, request.window))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    let bar = &stored[0].bar;
    assert_eq!(bar.ts_utc, t0);
    assert_eq!(bar.open, Some(dec!(1.1000)));
    assert_eq!(bar.high, Some(dec!(1.1020)));
    assert_eq!(bar.low, Some(dec!(1.0980)));
    assert_eq!(bar.close, Some(dec!(1.1007)));
    assert_eq!(bar.volume, Some(dec!(10)));
    assert_eq!(stored[0].quality_score, Some(dec!(1)));
}
