/// Run-invocation facade: verification phases, aggregation, synthetic index, ingest control
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::data::{
    AggregationEngine, AggregationOutcome, AggregationRequest, SyntheticIndexCalculator, SyntheticOutcome, Timeframe,
};
use crate::error::{Result, VerifyError};
use crate::store::{BarStore, BarTable, IngestControl, IngestStateReader};
use crate::types::TimeWindow;
use crate::verify::{CatalogRunner, CheckContext, Phase, RunCancellation, VerificationReport, Verdict};

pub struct VerificationEngine {
    store: Arc<dyn BarStore>,
    ingest: Option<Arc<dyn IngestControl>>,
    config: Arc<Config>,
    cancellation: RunCancellation,
}

impl VerificationEngine {
    pub fn new(store: Arc<dyn BarStore>, config: Config) -> Self {
        VerificationEngine {
            store,
            ingest: None,
            config: Arc::new(config),
            cancellation: RunCancellation::new(),
        }
    }

    /// Attach the ingestion state used for idle-symbol exclusion and pause/resume
    pub fn with_ingest_state(mut self, ingest: Arc<dyn IngestControl>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Handle that stops checks not yet started, for this and later runs
    pub fn get_cancellation(&self) -> RunCancellation {
        self.cancellation.clone()
    }

    pub async fn run_verification(&self, phase: Phase, now: DateTime<Utc>) -> Result<VerificationReport> {
        if let Err(e) = self.store.ping().await {
            error!("Store unreachable, aborting phase {}: {}", phase, e);
            return Err(VerifyError::StoreUnreachable(e.to_string()));
        }

        let symbols = self.resolve_active_symbols().await?;
        let idle = self.idle_symbols(&symbols).await;
        let verify = Arc::new(self.config.verify.clone());
        let window = phase.window(now, &verify);

        info!(
            "🔍 Phase {}: {} symbols ({} idle), window {} -> {}",
            phase,
            symbols.len(),
            idle.len(),
            window.from,
            window.to
        );

        let mut idle_symbols: Vec<String> = idle.iter().cloned().collect();
        idle_symbols.sort();

        let ctx = CheckContext {
            store: self.store.clone(),
            window,
            now,
            config: verify.clone(),
            synthetic: Arc::new(self.config.synthetic.clone()),
            symbols: Arc::new(symbols.clone()),
            idle: Arc::new(idle),
        };

        let runner = CatalogRunner::new(verify.max_concurrency, Duration::from_secs(verify.check_timeout_secs))
            .with_cancellation(self.cancellation.clone());
        let checks = runner.run(phase.plan(&self.config.aggregation.policies), ctx).await;
        let verdict = Verdict::from_outcomes(phase, &checks);

        if verdict.passed() {
            info!("✅ Phase {} passed ({} checks)", phase, checks.len());
        } else {
            warn!("❌ Phase {} raised: {}", phase, verdict.raised_flags().join(", "));
        }
        if verdict.historical_findings_incomplete {
            warn!("⚠️ Phase {} findings are incomplete: historical coverage guardrail failed", phase);
        }

        Ok(VerificationReport {
            run_id: Uuid::new_v4(),
            phase,
            generated_at: now,
            window,
            active_symbols: symbols,
            idle_symbols,
            verdict,
            checks,
        })
    }

    /// Configured symbols, or every raw 1m symbol when none are configured.
    /// The synthetic symbol is never an active ingested symbol.
    async fn resolve_active_symbols(&self) -> Result<Vec<String>> {
        let synthetic = self.config.synthetic.symbol.as_str();
        let mut symbols = if self.config.verify.active_symbols.is_empty() {
            self.store.list_symbols(BarTable::Raw, Timeframe::OneMinute).await?
        } else {
            self.config.verify.active_symbols.clone()
        };
        symbols.retain(|s| s != synthetic);
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    /// Paused or orphaned symbols. A failed read excludes nothing.
    async fn idle_symbols(&self, symbols: &[String]) -> HashSet<String> {
        let Some(ingest) = &self.ingest else {
            return HashSet::new();
        };
        match ingest.list_paused_or_orphaned(symbols).await {
            Ok(idle) => idle,
            Err(e) => {
                warn!("Ingest state unavailable, excluding no symbols: {}", e);
                HashSet::new()
            }
        }
    }

    pub async fn compute_aggregates(&self, request: &AggregationRequest) -> AggregationOutcome {
        AggregationEngine::new(self.store.clone(), self.config.aggregation.batch_size)
            .compute(request)
            .await
    }

    /// Aggregate every active symbol, then the synthetic index from its derived 1m rows
    pub async fn aggregate_all(&self, timeframe: Timeframe, window: TimeWindow) -> Result<Vec<AggregationOutcome>> {
        let policy = self
            .config
            .aggregation
            .policies
            .policy_for(timeframe)
            .ok_or_else(|| VerifyError::InvalidParameter(format!("{} is not a derived timeframe", timeframe)))?;
        let version = self.config.aggregation.derivation_version;
        let engine = AggregationEngine::new(self.store.clone(), self.config.aggregation.batch_size);

        let mut requests: Vec<AggregationRequest> = self
            .resolve_active_symbols()
            .await?
            .into_iter()
            .map(|symbol| AggregationRequest {
                symbol,
                timeframe,
                window,
                policy,
                derivation_version: version,
                child_table: BarTable::Raw,
            })
            .collect();

        let synthetic = self.config.synthetic.symbol.clone();
        let derived_1m = self.store.list_symbols(BarTable::Derived, Timeframe::OneMinute).await?;
        if derived_1m.contains(&synthetic) {
            requests.push(AggregationRequest {
                symbol: synthetic,
                timeframe,
                window,
                policy,
                derivation_version: version,
                child_table: BarTable::Derived,
            });
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in &requests {
            let outcome = engine.compute(request).await;
            if outcome.success {
                info!(
                    "📈 {} {}: {} inserted, {} updated, {} unchanged",
                    outcome.symbol, outcome.timeframe, outcome.inserted, outcome.updated, outcome.unchanged
                );
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn compute_synthetic_index(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        derivation_version: u32,
    ) -> SyntheticOutcome {
        SyntheticIndexCalculator::new(
            self.store.clone(),
            self.config.synthetic.clone(),
            self.config.aggregation.batch_size,
        )
        .compute_range(from, to, derivation_version)
        .await
    }

    pub async fn pause_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Result<usize> {
        self.set_paused(symbol, true, now).await
    }

    pub async fn resume_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Result<usize> {
        self.set_paused(symbol, false, now).await
    }

    async fn set_paused(&self, symbol: &str, paused: bool, now: DateTime<Utc>) -> Result<usize> {
        let ingest = self
            .ingest
            .as_ref()
            .ok_or_else(|| VerifyError::ConfigError("no ingest state store attached".to_string()))?;
        let touched = ingest.set_paused(symbol, paused, now).await?;
        if touched == 0 {
            return Err(VerifyError::InvalidParameter(format!("{} has no ingest state", symbol)));
        }
        info!(
            "{} {} ({} series)",
            if paused { "⏸️ Paused" } else { "▶️ Resumed" },
            symbol,
            touched
        );
        Ok(touched)
    }
}
