/// Centralized error types for the bar verification engine
use thiserror::Error;

/// Failures raised by a bar store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Failed to decode column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Failure of a single verification check.
///
/// A check error never aborts a run; the runner records it against the
/// check's slot and moves on.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Store query failed: {0}")]
    Store(#[from] StoreError),

    #[error("Check timed out after {0}ms")]
    Timeout(u64),

    #[error("Check panicked: {0}")]
    Panicked(String),

    #[error("Invalid check input: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    // Store Errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store unreachable: {0}")]
    StoreUnreachable(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Computation Errors
    #[error("Computation failed: {0}")]
    ComputationFailed(String),

    // Report Errors
    #[error("Serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV write failed: {0}")]
    CsvError(#[from] csv::Error),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Run Control
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

impl VerifyError {
    /// Check if error is recoverable by retrying the same operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VerifyError::Store(StoreError::Sqlite(_))
                | VerifyError::Store(StoreError::Unavailable(_))
                | VerifyError::Cancelled(_)
        )
    }

    /// Check if error must abort the run without a partial verdict
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VerifyError::StoreUnreachable(_)
                | VerifyError::ConfigError(_)
                | VerifyError::Store(StoreError::UnknownIdentifier(_))
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            VerifyError::Store(_) => "STORE_001",
            VerifyError::StoreUnreachable(_) => "STORE_002",
            VerifyError::ConfigError(_) => "CFG_001",
            VerifyError::InvalidParameter(_) => "CFG_002",
            VerifyError::ComputationFailed(_) => "CALC_001",
            VerifyError::SerializationError(_) => "REPORT_001",
            VerifyError::CsvError(_) => "REPORT_002",
            VerifyError::FileError(_) => "FILE_001",
            VerifyError::Cancelled(_) => "RUN_001",
            VerifyError::InternalError(_) => "INT_001",
        }
    }
}

impl CheckError {
    pub fn error_code(&self) -> &str {
        match self {
            CheckError::Store(_) => "CHECK_001",
            CheckError::Timeout(_) => "CHECK_002",
            CheckError::Panicked(_) => "CHECK_003",
            CheckError::Invalid(_) => "CHECK_004",
        }
    }
}
