/// Verification reports and the sinks that persist them
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, VerifyError};
use crate::types::TimeWindow;
use crate::verify::phase::Phase;
use crate::verify::runner::CheckOutcome;
use crate::verify::verdict::Verdict;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub phase: Phase,
    pub generated_at: DateTime<Utc>,
    pub window: TimeWindow,
    pub active_symbols: Vec<String>,
    /// Symbols excluded from staleness and gap findings
    pub idle_symbols: Vec<String>,
    pub verdict: Verdict,
    pub checks: Vec<CheckOutcome>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }

    pub fn get_check(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name)
    }
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Persist the reports of one invocation; returns the files written
    async fn publish(&self, reports: &[VerificationReport]) -> Result<Vec<PathBuf>>;
}

fn run_stamp(reports: &[VerificationReport]) -> Result<String> {
    let first = reports
        .first()
        .ok_or_else(|| VerifyError::InvalidParameter("no reports to publish".to_string()))?;
    Ok(first.generated_at.format("%Y%m%dT%H%M%SZ").to_string())
}

/// One combined JSON document per invocation
pub struct JsonFileSink {
    output_dir: PathBuf,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        JsonFileSink {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn publish(&self, reports: &[VerificationReport]) -> Result<Vec<PathBuf>> {
        let stamp = run_stamp(reports)?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let path = self.output_dir.join(format!("{}_verification_report.json", stamp));
        let json = serde_json::to_string_pretty(reports)?;
        tokio::fs::write(&path, json).await?;

        info!("💾 Saved verification report to {}", path.display());
        Ok(vec![path])
    }
}

/// One CSV per check table plus a verdict table per phase
pub struct CsvDirSink {
    output_dir: PathBuf,
}

impl CsvDirSink {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        CsvDirSink {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }
}

/// Findings as rows: symbol, timeframe, then the union of metric keys
fn findings_csv(outcome: &CheckOutcome) -> Result<Vec<u8>> {
    let columns: BTreeSet<&str> = outcome
        .result
        .findings
        .iter()
        .flat_map(|f| f.metrics.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["symbol", "timeframe"];
    header.extend(columns.iter().copied());
    writer.write_record(&header)?;

    for finding in &outcome.result.findings {
        let mut row = vec![
            finding.symbol.clone(),
            finding.timeframe.map(|tf| tf.to_string()).unwrap_or_default(),
        ];
        row.extend(
            columns
                .iter()
                .map(|key| finding.get_metric(key).map(|m| m.render()).unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|e| VerifyError::InternalError(format!("CSV buffer flush failed: {}", e)))
}

fn verdict_csv(report: &VerificationReport) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["item", "value"])?;
    let mut rows: Vec<(String, String)> = vec![
        ("run_id".to_string(), report.run_id.to_string()),
        ("passed".to_string(), report.passed().to_string()),
    ];
    rows.extend(report.verdict.flags.iter().map(|(flag, raised)| (flag.clone(), raised.to_string())));
    if let Some(passed) = report.verdict.coverage_guardrail_passed {
        rows.push(("coverage_guardrail_passed".to_string(), passed.to_string()));
        rows.push((
            "historical_findings_incomplete".to_string(),
            report.verdict.historical_findings_incomplete.to_string(),
        ));
    }
    if let Some(staleness) = &report.verdict.staleness {
        rows.push(("staleness_warning_count".to_string(), staleness.warning_count.to_string()));
        rows.push(("staleness_critical_count".to_string(), staleness.critical_count.to_string()));
        rows.push(("staleness_no_data_count".to_string(), staleness.no_data_count.to_string()));
    }
    rows.extend(report.verdict.notes.iter().map(|(check, note)| (format!("note:{}", check), note.clone())));

    for (item, value) in &rows {
        writer.write_record([item, value])?;
    }

    writer
        .into_inner()
        .map_err(|e| VerifyError::InternalError(format!("CSV buffer flush failed: {}", e)))
}

#[async_trait]
impl ReportSink for CsvDirSink {
    async fn publish(&self, reports: &[VerificationReport]) -> Result<Vec<PathBuf>> {
        let stamp = run_stamp(reports)?;
        let dir = self.output_dir.join(&stamp);
        tokio::fs::create_dir_all(&dir).await?;

        let mut written = Vec::new();
        for report in reports {
            let prefix = format!("phase_{}", report.phase.as_str().to_ascii_lowercase());
            for outcome in report.checks.iter().filter(|c| !c.result.findings.is_empty()) {
                let path = dir.join(format!("{}_{}.csv", prefix, outcome.name));
                tokio::fs::write(&path, findings_csv(outcome)?).await?;
                written.push(path);
            }

            let path = dir.join(format!("{}_verdict.csv", prefix));
            tokio::fs::write(&path, verdict_csv(report)?).await?;
            written.push(path);
        }

        info!("📊 Wrote {} CSV tables to {}", written.len(), dir.display());
        Ok(written)
    }
}
