/// Ingestion state access: read side for verification, control side for pause/resume
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::data::Timeframe;
use crate::error::StoreError;
use crate::types::{IngestState, IngestStatus};

#[async_trait]
pub trait IngestStateReader: Send + Sync {
    /// Symbols among `symbols` with any series paused or orphaned
    async fn list_paused_or_orphaned(&self, symbols: &[String]) -> Result<HashSet<String>, StoreError>;
}

#[async_trait]
pub trait IngestControl: IngestStateReader {
    /// Set the pause flag on every timeframe of `symbol`. Returns rows touched;
    /// zero means the symbol has never been ingested.
    async fn set_paused(&self, symbol: &str, paused: bool, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn record_failure(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    async fn record_success(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_states(&self, symbol: &str) -> Result<Vec<IngestState>, StoreError>;

    async fn put_state(&self, state: IngestState) -> Result<(), StoreError>;
}

pub(crate) fn pause_note(paused: bool, now: DateTime<Utc>) -> String {
    if paused {
        format!("Data fetching PAUSED by user on {}", now.to_rfc3339())
    } else {
        format!("Data fetching RESUMED by user on {}", now.to_rfc3339())
    }
}

/// Consecutive hard failures after which a series is marked failing
pub const FAILING_STREAK: u32 = 3;

#[derive(Clone, Default)]
pub struct MemoryIngestState {
    states: Arc<RwLock<HashMap<(String, Timeframe), IngestState>>>,
}

impl MemoryIngestState {
    pub fn new() -> Self {
        MemoryIngestState::default()
    }
}

#[async_trait]
impl IngestStateReader for MemoryIngestState {
    async fn list_paused_or_orphaned(&self, symbols: &[String]) -> Result<HashSet<String>, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .values()
            .filter(|s| s.is_idle() && symbols.contains(&s.symbol))
            .map(|s| s.symbol.clone())
            .collect())
    }
}

#[async_trait]
impl IngestControl for MemoryIngestState {
    async fn set_paused(&self, symbol: &str, paused: bool, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut states = self.states.write().await;
        let mut touched = 0;
        for state in states.values_mut().filter(|s| s.symbol == symbol) {
            state.pause_fetch = paused;
            state.notes = Some(pause_note(paused, now));
            state.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn record_failure(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut states = self.states.write().await;
        let state = states
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| IngestState::new(symbol, timeframe, now));
        state.hard_fail_streak += 1;
        if state.hard_fail_streak >= FAILING_STREAK && state.status == IngestStatus::Running {
            state.status = IngestStatus::Failing;
        }
        state.notes = Some(note.to_string());
        state.updated_at = now;
        Ok(state.hard_fail_streak)
    }

    async fn record_success(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        let state = states
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| IngestState::new(symbol, timeframe, now));
        state.hard_fail_streak = 0;
        if state.status == IngestStatus::Failing {
            state.status = IngestStatus::Running;
        }
        state.updated_at = now;
        Ok(())
    }

    async fn get_states(&self, symbol: &str) -> Result<Vec<IngestState>, StoreError> {
        let states = self.states.read().await;
        let mut rows: Vec<IngestState> = states.values().filter(|s| s.symbol == symbol).cloned().collect();
        rows.sort_by_key(|s| s.timeframe);
        Ok(rows)
    }

    async fn put_state(&self, state: IngestState) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        states.insert((state.symbol.clone(), state.timeframe), state);
        Ok(())
    }
}
