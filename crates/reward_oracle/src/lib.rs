//! Channel reward oracle: reconciles audience counters against a stored baseline and
//! mints the earned reward on a ledger before advancing the baseline.

mod config;
mod cycle_guard;
mod error;
mod evm_ledger;
mod ledger;
mod ledger_gateway;
mod ledger_signature;
mod metric_source;
mod reconciler;
mod reward;
mod rpc_client;
mod runtime;
mod runtime_util;

pub use config::{
    LedgerBackendConfig, OracleConfig, OracleConfigError, StoreBackendConfig,
    DEFAULT_CONFIG_FILE_NAME, DEFAULT_INTERVAL_SECS, ENV_HEALTH_BIND,
};
pub use cycle_guard::{EntityCycleGuard, EntityCyclePermit};
pub use error::{CycleFailure, OracleBuildError, OracleRuntimeError};
pub use evm_ledger::{EvmLedgerConfig, EvmMintLedger};
pub use ledger::{
    mint_idempotency_key, DynMintLedger, LedgerError, MintLedger, MintReceipt, MintRequest,
    PendingMint,
};
pub use ledger_gateway::{
    JsonRpcMintLedger, LedgerGatewayConfig, DEFAULT_CONFIRM_POLL_MS, DEFAULT_CONFIRM_TIMEOUT_MS,
    DUPLICATE_MINT_CODE,
};
pub use metric_source::{
    MetricSource, MetricSourceError, YouTubeConfig, YouTubeMetricSource,
    DEFAULT_YOUTUBE_BASE_URL,
};
pub use reconciler::{
    CycleOutcome, CycleOutcomeKind, CycleReport, MintedCycle, Reconciler, ReconcilerConfig,
    DEFAULT_PROVENANCE_TAG,
};
pub use reward::{
    RewardDelta, RewardPolicy, DEFAULT_SUBSCRIBER_REWARD, DEFAULT_SUBSCRIBER_UNIT,
    DEFAULT_VIEW_REWARD, DEFAULT_VIEW_UNIT,
};
pub use runtime::{
    build_ledger, build_reconciler, build_store, ConfiguredReconciler, DynBaselineStore,
    OracleRuntime, OracleRuntimeSnapshot,
};
pub use runtime_util::now_unix_ms;

pub use reward_oracle_store::{
    BaselineStore, EntityKey, FileBaselineStore, FirestoreBaselineStore, FirestoreConfig,
    FirestoreCredentials, MemoryBaselineStore, MetricSnapshot, MintRecord, PendingMintRecord,
    StoreError,
};

#[cfg(test)]
mod test_http;
