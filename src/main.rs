/// Command line entry point for the bar verification engine
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barsentry::{
    config::{load_config, LogFormat, ReportFormat, StoreBackend},
    data::{AggregationRequest, Timeframe},
    store::{BarStore, BarTable, IngestControl, MemoryBarStore, MemoryIngestState, SqliteBarStore},
    verify::{CsvDirSink, JsonFileSink, Phase, ReportSink, VerificationReport},
    Config, TimeWindow, VerificationEngine,
};

#[derive(Parser)]
#[command(name = "barsentry", version, about = "OHLCV bar consistency engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "barsentry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    A,
    B,
    All,
}

#[derive(Subcommand)]
enum Command {
    /// Run verification phases and write reports
    Verify {
        #[arg(long, value_enum, default_value = "all")]
        phase: PhaseArg,
    },
    /// Roll 1m bars into a derived timeframe
    Aggregate {
        /// 5m, 1h or 1d
        #[arg(long)]
        timeframe: Timeframe,
        /// Single symbol; every active symbol and the synthetic index when omitted
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long, default_value_t = 1)]
        days: i64,
    },
    /// Compute the synthetic index over the last days
    Synthetic {
        #[arg(long, default_value_t = 1)]
        days: i64,
        /// Defaults to aggregation.derivation_version
        #[arg(long)]
        version: Option<u32>,
    },
    /// Pause ingestion of a symbol
    Pause { symbol: String },
    /// Resume ingestion of a symbol
    Resume { symbol: String },
}

/// Application state
struct App {
    config: Config,
    engine: Arc<VerificationEngine>,
}

impl App {
    async fn new(config: Config) -> anyhow::Result<Self> {
        let (store, ingest): (Arc<dyn BarStore>, Arc<dyn IngestControl>) = match config.store.backend {
            StoreBackend::Sqlite => {
                let schema = config.store.schema()?;
                let sqlite = Arc::new(
                    SqliteBarStore::open(&config.store.path, schema)
                        .with_context(|| format!("opening {}", config.store.path.display()))?,
                );
                if config.store.create_schema {
                    sqlite.ensure_schema().await?;
                }
                let store: Arc<dyn BarStore> = sqlite.clone();
                let ingest: Arc<dyn IngestControl> = sqlite;
                (store, ingest)
            }
            StoreBackend::Memory => {
                warn!("Using in-memory store: nothing is persisted");
                let store: Arc<dyn BarStore> = Arc::new(MemoryBarStore::new());
                let ingest: Arc<dyn IngestControl> = Arc::new(MemoryIngestState::new());
                (store, ingest)
            }
        };

        let engine = VerificationEngine::new(store, config.clone()).with_ingest_state(ingest);
        Ok(App {
            config,
            engine: Arc::new(engine),
        })
    }

    /// Ctrl-C stops checks that have not started yet
    fn setup_shutdown_handler(&self) {
        let cancellation = self.engine.get_cancellation();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling remaining checks");
                cancellation.cancel().await;
            }
        });
    }

    async fn verify(&self, phase: PhaseArg) -> anyhow::Result<bool> {
        let phases = match phase {
            PhaseArg::A => vec![Phase::A],
            PhaseArg::B => vec![Phase::B],
            PhaseArg::All => vec![Phase::A, Phase::B],
        };

        let now = Utc::now();
        let mut reports: Vec<VerificationReport> = Vec::new();
        for phase in phases {
            match self.engine.run_verification(phase, now).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Phase {} aborted: {} ({})", phase, e, e.error_code());
                    return Err(e.into());
                }
            }
        }

        for format in &self.config.report.formats {
            let sink: Box<dyn ReportSink> = match format {
                ReportFormat::Json => Box::new(JsonFileSink::new(&self.config.report.output_dir)),
                ReportFormat::Csv => Box::new(CsvDirSink::new(&self.config.report.output_dir)),
            };
            sink.publish(&reports).await?;
        }

        for report in &reports {
            let verdict = &report.verdict;
            info!(
                "Phase {}: {} ({} failed, {} timed out, {} cancelled)",
                report.phase,
                if report.passed() { "PASS" } else { "FAIL" },
                verdict.failed_checks,
                verdict.timed_out_checks,
                verdict.cancelled_checks
            );
            for (check, note) in &verdict.notes {
                warn!("   {}: {}", check, note);
            }
        }
        Ok(reports.iter().all(|r| r.passed()))
    }

    async fn aggregate(&self, timeframe: Timeframe, symbol: Option<String>, days: i64) -> anyhow::Result<bool> {
        let window = TimeWindow::last_days(Utc::now(), days);
        let outcomes = match symbol {
            Some(symbol) => {
                let Some(policy) = self.config.aggregation.policies.policy_for(timeframe) else {
                    bail!("{} is not a derived timeframe", timeframe);
                };
                let child_table = if symbol == self.config.synthetic.symbol {
                    BarTable::Derived
                } else {
                    BarTable::Raw
                };
                vec![
                    self.engine
                        .compute_aggregates(&AggregationRequest {
                            symbol,
                            timeframe,
                            window,
                            policy,
                            derivation_version: self.config.aggregation.derivation_version,
                            child_table,
                        })
                        .await,
                ]
            }
            None => self.engine.aggregate_all(timeframe, window).await?,
        };

        let mut all_ok = true;
        for outcome in &outcomes {
            if !outcome.success {
                all_ok = false;
                error!(
                    "{} {} failed ({:?}): {}",
                    outcome.symbol,
                    outcome.timeframe,
                    outcome.write_state,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            } else if !outcome.defective_buckets.is_empty() {
                warn!(
                    "{} {}: {} buckets below the {} policy",
                    outcome.symbol,
                    outcome.timeframe,
                    outcome.defective_buckets.len(),
                    outcome.policy.as_str()
                );
            }
        }
        Ok(all_ok)
    }

    async fn synthetic(&self, days: i64, version: Option<u32>) -> anyhow::Result<bool> {
        let now = Utc::now();
        let version = version.unwrap_or(self.config.aggregation.derivation_version);
        let outcome = self
            .engine
            .compute_synthetic_index(now - Duration::days(days), now, version)
            .await;

        if outcome.success {
            info!(
                "💱 {} v{}: {} inserted, {} updated, {} unchanged, {} skipped",
                outcome.symbol, outcome.version, outcome.inserted, outcome.updated, outcome.unchanged, outcome.skipped
            );
        } else {
            error!(
                "{} failed ({:?}): {}",
                outcome.symbol,
                outcome.write_state,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome.success)
    }
}

fn init_logging(config: &Config) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config);
    info!("Starting barsentry with {}", cli.config.display());

    let app = App::new(config).await?;
    app.setup_shutdown_handler();

    let ok = match cli.command {
        Command::Verify { phase } => app.verify(phase).await?,
        Command::Aggregate {
            timeframe,
            symbol,
            days,
        } => app.aggregate(timeframe, symbol, days).await?,
        Command::Synthetic { days, version } => app.synthetic(days, version).await?,
        Command::Pause { symbol } => app.engine.pause_symbol(&symbol, Utc::now()).await.map(|_| true)?,
        Command::Resume { symbol } => app.engine.resume_symbol(&symbol, Utc::now()).await.map(|_| true)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
