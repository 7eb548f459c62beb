/// Catalog runner: isolated, time-boxed, optionally concurrent check execution
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::CheckError;
use crate::verify::check::{Check, CheckContext, CheckKind, CheckResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Completed,
    Failed,
    TimedOut,
    Panicked,
    /// Not started because the run was cancelled
    Cancelled,
}

impl CheckStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CheckStatus::Completed => "completed",
            CheckStatus::Failed => "failed",
            CheckStatus::TimedOut => "timed_out",
            CheckStatus::Panicked => "panicked",
            CheckStatus::Cancelled => "cancelled",
        }
    }
}

/// What one slot of the catalog produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub result: CheckResult,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CheckOutcome {
    fn completed(check: &dyn Check, result: CheckResult, elapsed: Duration) -> Self {
        let mut result = result;
        // Flags the check owns but did not set read as clean
        for flag in check.flag_names() {
            result.flags.entry(flag).or_insert(false);
        }
        CheckOutcome {
            name: check.name().to_string(),
            kind: check.kind(),
            status: CheckStatus::Completed,
            result,
            error: None,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// Neutral result: every owned flag false, the error kept as a note
    fn neutral(check: &dyn Check, status: CheckStatus, error: Option<String>, elapsed: Duration) -> Self {
        let mut result = CheckResult::new();
        for flag in check.flag_names() {
            result.flag(&flag, false);
        }
        CheckOutcome {
            name: check.name().to_string(),
            kind: check.kind(),
            status,
            result,
            error,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CheckStatus::Completed
    }
}

/// Cooperative cancellation flag checked before each check starts
#[derive(Clone, Default)]
pub struct RunCancellation {
    cancelled: Arc<RwLock<bool>>,
}

impl RunCancellation {
    pub fn new() -> Self {
        RunCancellation::default()
    }

    pub async fn cancel(&self) {
        *self.cancelled.write().await = true;
    }

    pub async fn is_cancelled(&self) -> bool {
        *self.cancelled.read().await
    }
}

pub struct CatalogRunner {
    max_concurrency: usize,
    check_timeout: Duration,
    cancellation: RunCancellation,
}

impl CatalogRunner {
    pub fn new(max_concurrency: usize, check_timeout: Duration) -> Self {
        CatalogRunner {
            max_concurrency: max_concurrency.max(1),
            check_timeout,
            cancellation: RunCancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: RunCancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn get_cancellation(&self) -> RunCancellation {
        self.cancellation.clone()
    }

    /// Run every check; outcomes come back in catalog order
    pub async fn run(&self, checks: Vec<Arc<dyn Check>>, ctx: CheckContext) -> Vec<CheckOutcome> {
        let timeout = self.check_timeout;
        stream::iter(checks)
            .map(|check| {
                let ctx = ctx.clone();
                let cancellation = self.cancellation.clone();
                async move { run_isolated(check, ctx, timeout, cancellation).await }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }
}

async fn run_isolated(
    check: Arc<dyn Check>,
    ctx: CheckContext,
    timeout: Duration,
    cancellation: RunCancellation,
) -> CheckOutcome {
    if cancellation.is_cancelled().await {
        info!("⏹️ {} skipped: run cancelled", check.name());
        return CheckOutcome::neutral(check.as_ref(), CheckStatus::Cancelled, None, Duration::ZERO);
    }

    let started = Instant::now();
    let task_check = check.clone();
    let mut handle = tokio::spawn(async move { task_check.run(&ctx).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(result))) => {
            let outcome = CheckOutcome::completed(check.as_ref(), result, started.elapsed());
            info!(
                "✅ {} [{}] {} findings in {}ms",
                outcome.name,
                outcome.kind.as_str(),
                outcome.result.findings.len(),
                outcome.duration_ms
            );
            outcome
        }
        Ok(Ok(Err(e))) => {
            warn!("❌ {} failed ({}): {}", check.name(), e.error_code(), e);
            CheckOutcome::neutral(check.as_ref(), CheckStatus::Failed, Some(e.to_string()), started.elapsed())
        }
        Ok(Err(join_error)) => {
            let e = CheckError::Panicked(join_error.to_string());
            error!("💥 {} ({}): {}", check.name(), e.error_code(), e);
            CheckOutcome::neutral(check.as_ref(), CheckStatus::Panicked, Some(e.to_string()), started.elapsed())
        }
        Err(_) => {
            handle.abort();
            let e = CheckError::Timeout(timeout.as_millis() as u64);
            warn!("⏱️ {} ({}): {}", check.name(), e.error_code(), e);
            CheckOutcome::neutral(check.as_ref(), CheckStatus::TimedOut, Some(e.to_string()), started.elapsed())
        }
    }
}
