use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use reward_oracle_store::{
    BaselineStore, EntityKey, FileBaselineStore, FirestoreBaselineStore,
};

use crate::config::{LedgerBackendConfig, OracleConfig, StoreBackendConfig};
use crate::error::{OracleBuildError, OracleRuntimeError};
use crate::evm_ledger::EvmMintLedger;
use crate::ledger::{DynMintLedger, MintLedger};
use crate::ledger_gateway::JsonRpcMintLedger;
use crate::metric_source::{MetricSource, YouTubeMetricSource};
use crate::reconciler::{CycleOutcome, CycleOutcomeKind, CycleReport, Reconciler};
use crate::runtime_util::{lock_state, now_unix_ms};

const LOG_TARGET_RUNTIME: &str = "reward_oracle.runtime";

pub type DynBaselineStore = Box<dyn BaselineStore + Send + Sync>;

pub type ConfiguredReconciler = Reconciler<DynBaselineStore, YouTubeMetricSource, DynMintLedger>;

pub fn build_store(config: &StoreBackendConfig) -> Result<DynBaselineStore, OracleBuildError> {
    match config {
        StoreBackendConfig::File { root } => Ok(Box::new(FileBaselineStore::new(root.clone()))),
        StoreBackendConfig::Firestore(firestore) => {
            let store = FirestoreBaselineStore::from_config(firestore)
                .map_err(OracleBuildError::Store)?;
            Ok(Box::new(store))
        }
    }
}

pub fn build_ledger(config: &LedgerBackendConfig) -> Result<DynMintLedger, OracleBuildError> {
    match config {
        LedgerBackendConfig::Evm(evm) => {
            let ledger = EvmMintLedger::from_config(evm).map_err(OracleBuildError::Ledger)?;
            tracing::info!(
                target: LOG_TARGET_RUNTIME,
                backend = "evm",
                sender = %ledger.sender(),
                contract = %evm.contract_address,
                "ledger configured"
            );
            Ok(Box::new(ledger))
        }
        LedgerBackendConfig::Gateway(gateway) => {
            let ledger =
                JsonRpcMintLedger::from_config(gateway).map_err(OracleBuildError::Ledger)?;
            tracing::info!(
                target: LOG_TARGET_RUNTIME,
                backend = "gateway",
                signer = %ledger.public_key_hex(),
                contract = %gateway.contract_address,
                "ledger configured"
            );
            Ok(Box::new(ledger))
        }
    }
}

pub fn build_reconciler(config: &OracleConfig) -> Result<ConfiguredReconciler, OracleBuildError> {
    let store = build_store(&config.store)?;
    let metrics =
        YouTubeMetricSource::from_config(&config.youtube).map_err(OracleBuildError::MetricSource)?;
    let ledger = build_ledger(&config.ledger)?;
    tracing::info!(
        target: LOG_TARGET_RUNTIME,
        entity = %config.entity_id,
        recipient = %config.recipient,
        "reconciler configured"
    );
    Ok(Reconciler::new(
        store,
        metrics,
        ledger,
        config.reconciler_config(),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleRuntimeSnapshot {
    pub entity_id: String,
    pub running: bool,
    pub interval_secs: u64,
    pub cycle_count: u64,
    pub minted_count: u64,
    pub minted_total: u64,
    pub inconsistent_count: u64,
    pub last_cycle_unix_ms: Option<i64>,
    pub last_report: Option<CycleReport>,
}

#[derive(Debug, Default)]
struct RuntimeState {
    cycle_count: u64,
    minted_count: u64,
    minted_total: u64,
    inconsistent_count: u64,
    last_cycle_unix_ms: Option<i64>,
    last_report: Option<CycleReport>,
}

impl RuntimeState {
    fn record_panic(&mut self, entity: &EntityKey, message: &str) {
        let finished_at = now_unix_ms();
        self.cycle_count = self.cycle_count.saturating_add(1);
        self.last_cycle_unix_ms = Some(finished_at);
        self.last_report = Some(CycleReport {
            entity_id: entity.to_string(),
            outcome: CycleOutcomeKind::TransientFailure,
            finished_at_unix_ms: finished_at,
            delta: None,
            receipt_id: None,
            error: Some(format!("cycle panicked: {message}")),
        });
    }

    fn record(&mut self, entity: &EntityKey, outcome: &CycleOutcome) {
        let finished_at = now_unix_ms();
        self.cycle_count = self.cycle_count.saturating_add(1);
        self.last_cycle_unix_ms = Some(finished_at);
        match outcome.kind() {
            CycleOutcomeKind::Minted => {
                self.minted_count = self.minted_count.saturating_add(1);
                if let Some(delta) = outcome.delta() {
                    self.minted_total = self.minted_total.saturating_add(delta.reward_amount);
                }
            }
            CycleOutcomeKind::InconsistentState => {
                self.inconsistent_count = self.inconsistent_count.saturating_add(1);
            }
            _ => {}
        }
        self.last_report = Some(outcome.report(entity, finished_at));
    }
}

/// Runs one cycle immediately after `start`, then one per interval until stopped.
pub struct OracleRuntime<S, M, L> {
    entity: EntityKey,
    interval: Duration,
    reconciler: Arc<Reconciler<S, M, L>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<RuntimeState>>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<S, M, L> OracleRuntime<S, M, L>
where
    S: BaselineStore + Send + Sync + 'static,
    M: MetricSource + Send + Sync + 'static,
    L: MintLedger + Send + Sync + 'static,
{
    pub fn new(entity: EntityKey, interval: Duration, reconciler: Reconciler<S, M, L>) -> Self {
        Self {
            entity,
            interval,
            reconciler: Arc::new(reconciler),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RuntimeState::default())),
            stop_tx: None,
            worker: None,
        }
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn reconciler(&self) -> &Reconciler<S, M, L> {
        &self.reconciler
    }

    /// Runs a single cycle on the calling thread and records it in the snapshot.
    pub fn run_once(&self) -> CycleOutcome {
        let outcome = self.reconciler.run_cycle(&self.entity);
        lock_state(&self.state).record(&self.entity, &outcome);
        outcome
    }

    pub fn start(&mut self) -> Result<(), OracleRuntimeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OracleRuntimeError::AlreadyRunning {
                entity: self.entity.to_string(),
            });
        }

        {
            let mut state = lock_state(&self.state);
            *state = RuntimeState::default();
        }

        let interval = self.interval;
        let worker_name = format!("reward-oracle-{}", self.entity);
        let entity = self.entity.clone();
        let reconciler = Arc::clone(&self.reconciler);
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                tracing::info!(
                    target: LOG_TARGET_RUNTIME,
                    entity = %entity,
                    interval_secs = interval.as_secs(),
                    "oracle loop started"
                );
                loop {
                    match panic::catch_unwind(AssertUnwindSafe(|| reconciler.run_cycle(&entity))) {
                        Ok(outcome) => lock_state(&state).record(&entity, &outcome),
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            tracing::error!(
                                target: LOG_TARGET_RUNTIME,
                                entity = %entity,
                                panic = %message,
                                "oracle cycle panicked; next cycle runs on schedule"
                            );
                            lock_state(&state).record_panic(&entity, message.as_str());
                        }
                    }

                    match stop_rx.recv_timeout(interval) {
                        Ok(()) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
                tracing::info!(target: LOG_TARGET_RUNTIME, entity = %entity, "oracle loop stopped");
            })
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                OracleRuntimeError::ThreadSpawnFailed {
                    reason: err.to_string(),
                }
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    /// Waits for an in-flight cycle to finish; a cycle is never interrupted midway.
    pub fn stop(&mut self) -> Result<(), OracleRuntimeError> {
        if !self.running.load(Ordering::SeqCst) && self.worker.is_none() {
            return Err(OracleRuntimeError::NotRunning {
                entity: self.entity.to_string(),
            });
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| OracleRuntimeError::ThreadJoinFailed {
                    entity: self.entity.to_string(),
                })?;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn snapshot(&self) -> OracleRuntimeSnapshot {
        let state = lock_state(&self.state);
        OracleRuntimeSnapshot {
            entity_id: self.entity.to_string(),
            running: self.running.load(Ordering::SeqCst),
            interval_secs: self.interval.as_secs(),
            cycle_count: state.cycle_count,
            minted_count: state.minted_count,
            minted_total: state.minted_total,
            inconsistent_count: state.inconsistent_count,
            last_cycle_unix_ms: state.last_cycle_unix_ms,
            last_report: state.last_report.clone(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

impl<S, M, L> Drop for OracleRuntime<S, M, L> {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}
