use std::fmt;

use reward_oracle_store::StoreError;

use crate::config::OracleConfigError;
use crate::ledger::LedgerError;
use crate::metric_source::MetricSourceError;

/// Stage at which a cycle stopped without touching the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleFailure {
    LoadBaseline(StoreError),
    FetchMetrics(MetricSourceError),
    RecordPending(StoreError),
    SubmitMint(LedgerError),
    ConfirmMint(LedgerError),
}

impl CycleFailure {
    pub fn stage(&self) -> &'static str {
        match self {
            CycleFailure::LoadBaseline(_) => "load_baseline",
            CycleFailure::FetchMetrics(_) => "fetch_metrics",
            CycleFailure::RecordPending(_) => "record_pending",
            CycleFailure::SubmitMint(_) => "submit_mint",
            CycleFailure::ConfirmMint(_) => "confirm_mint",
        }
    }
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFailure::LoadBaseline(err) => write!(f, "load baseline failed: {err}"),
            CycleFailure::FetchMetrics(err) => write!(f, "fetch metrics failed: {err}"),
            CycleFailure::RecordPending(err) => write!(f, "record pending mint failed: {err}"),
            CycleFailure::SubmitMint(err) => write!(f, "submit mint failed: {err}"),
            CycleFailure::ConfirmMint(err) => write!(f, "confirm mint failed: {err}"),
        }
    }
}

impl std::error::Error for CycleFailure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleRuntimeError {
    AlreadyRunning { entity: String },
    NotRunning { entity: String },
    ThreadSpawnFailed { reason: String },
    ThreadJoinFailed { entity: String },
}

impl fmt::Display for OracleRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleRuntimeError::AlreadyRunning { entity } => {
                write!(f, "oracle runtime already running: {entity}")
            }
            OracleRuntimeError::NotRunning { entity } => {
                write!(f, "oracle runtime not running: {entity}")
            }
            OracleRuntimeError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn oracle thread: {reason}")
            }
            OracleRuntimeError::ThreadJoinFailed { entity } => {
                write!(f, "failed to join oracle thread: {entity}")
            }
        }
    }
}

impl std::error::Error for OracleRuntimeError {}

/// Failure assembling a reconciler from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleBuildError {
    Config(OracleConfigError),
    Store(StoreError),
    MetricSource(MetricSourceError),
    Ledger(LedgerError),
}

impl fmt::Display for OracleBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleBuildError::Config(err) => write!(f, "config: {err}"),
            OracleBuildError::Store(err) => write!(f, "baseline store: {err}"),
            OracleBuildError::MetricSource(err) => write!(f, "metric source: {err}"),
            OracleBuildError::Ledger(err) => write!(f, "ledger: {err}"),
        }
    }
}

impl std::error::Error for OracleBuildError {}

impl From<OracleConfigError> for OracleBuildError {
    fn from(err: OracleConfigError) -> Self {
        OracleBuildError::Config(err)
    }
}
