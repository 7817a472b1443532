//! One reconciliation cycle: load baseline, fetch counters, compute reward, mint,
//! advance the baseline and record the audit entry, strictly in that order.
//!
//! The transition being minted is written to the store as a pending mint before the
//! ledger sees it. A cycle that finds a pending mint for the current baseline finishes
//! that mint instead of computing a new reward, so counters that moved while a
//! confirmation was outstanding never produce a second mint.

use serde::Serialize;

use reward_oracle_store::{
    BaselineStore, EntityKey, MetricSnapshot, MintRecord, PendingMintRecord, StoreError,
};

use crate::cycle_guard::EntityCycleGuard;
use crate::error::CycleFailure;
use crate::ledger::{
    mint_idempotency_key, LedgerError, MintLedger, MintReceipt, MintRequest, PendingMint,
};
use crate::metric_source::MetricSource;
use crate::reward::{RewardDelta, RewardPolicy};
use crate::runtime_util::now_unix_ms;

pub const DEFAULT_PROVENANCE_TAG: &str = "Auto-Oracle";

const LOG_TARGET_CYCLE: &str = "reward_oracle.cycle";
const LOG_TARGET_INCONSISTENCY: &str = "reward_oracle.inconsistency";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub recipient: String,
    pub provenance_tag: String,
    pub policy: RewardPolicy,
}

impl ReconcilerConfig {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            provenance_tag: DEFAULT_PROVENANCE_TAG.to_string(),
            policy: RewardPolicy::default(),
        }
    }

    pub fn with_provenance_tag(mut self, tag: impl Into<String>) -> Self {
        self.provenance_tag = tag.into();
        self
    }

    pub fn with_policy(mut self, policy: RewardPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedCycle {
    pub prior: MetricSnapshot,
    pub current: MetricSnapshot,
    pub delta: RewardDelta,
    pub receipt: MintReceipt,
    /// The mint was submitted by an earlier cycle and confirmed by this one.
    pub resumed: bool,
    /// Set when the baseline advanced but the audit record could not be written.
    pub audit_error: Option<StoreError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Minted(MintedCycle),
    /// Reward was zero; neither the ledger nor the baseline was touched.
    NoReward {
        prior: MetricSnapshot,
        current: MetricSnapshot,
        delta: RewardDelta,
    },
    /// Another cycle for the same entity was still in flight.
    Skipped,
    /// The cycle stopped before the baseline was touched; the next cycle retries.
    Failed {
        failure: CycleFailure,
        prior: Option<MetricSnapshot>,
        current: Option<MetricSnapshot>,
        delta: Option<RewardDelta>,
    },
    /// The mint was confirmed but the baseline could not be advanced. The pending mint
    /// stays recorded, so the next cycle confirms it again and retries the save.
    Inconsistent {
        prior: MetricSnapshot,
        current: MetricSnapshot,
        delta: RewardDelta,
        receipt: MintReceipt,
        error: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcomeKind {
    Minted,
    NoReward,
    Skipped,
    TransientFailure,
    InconsistentState,
}

impl CycleOutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleOutcomeKind::Minted => "minted",
            CycleOutcomeKind::NoReward => "no_reward",
            CycleOutcomeKind::Skipped => "skipped",
            CycleOutcomeKind::TransientFailure => "transient_failure",
            CycleOutcomeKind::InconsistentState => "inconsistent_state",
        }
    }
}

impl CycleOutcome {
    pub fn kind(&self) -> CycleOutcomeKind {
        match self {
            CycleOutcome::Minted(_) => CycleOutcomeKind::Minted,
            CycleOutcome::NoReward { .. } => CycleOutcomeKind::NoReward,
            CycleOutcome::Skipped => CycleOutcomeKind::Skipped,
            CycleOutcome::Failed { .. } => CycleOutcomeKind::TransientFailure,
            CycleOutcome::Inconsistent { .. } => CycleOutcomeKind::InconsistentState,
        }
    }

    pub fn delta(&self) -> Option<&RewardDelta> {
        match self {
            CycleOutcome::Minted(minted) => Some(&minted.delta),
            CycleOutcome::NoReward { delta, .. } | CycleOutcome::Inconsistent { delta, .. } => {
                Some(delta)
            }
            CycleOutcome::Failed { delta, .. } => delta.as_ref(),
            CycleOutcome::Skipped => None,
        }
    }

    fn is_ledger_rejection(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Failed {
                failure: CycleFailure::SubmitMint(LedgerError::Rejected { .. })
                    | CycleFailure::ConfirmMint(LedgerError::Rejected { .. }),
                ..
            }
        )
    }

    pub fn report(&self, entity: &EntityKey, finished_at_unix_ms: i64) -> CycleReport {
        let (receipt_id, error) = match self {
            CycleOutcome::Minted(minted) => (
                Some(minted.receipt.receipt_id.clone()),
                minted
                    .audit_error
                    .as_ref()
                    .map(|err| format!("append audit failed: {err}")),
            ),
            CycleOutcome::Failed { failure, .. } => (None, Some(failure.to_string())),
            CycleOutcome::Inconsistent { receipt, error, .. } => (
                Some(receipt.receipt_id.clone()),
                Some(format!("save baseline failed after confirmed mint: {error}")),
            ),
            CycleOutcome::NoReward { .. } | CycleOutcome::Skipped => (None, None),
        };
        CycleReport {
            entity_id: entity.to_string(),
            outcome: self.kind(),
            finished_at_unix_ms,
            delta: self.delta().copied(),
            receipt_id,
            error,
        }
    }
}

/// Serializable summary of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub entity_id: String,
    pub outcome: CycleOutcomeKind,
    pub finished_at_unix_ms: i64,
    pub delta: Option<RewardDelta>,
    pub receipt_id: Option<String>,
    pub error: Option<String>,
}

/// Reconciles one metric source against one ledger through a baseline store.
///
/// Holds no reconciliation state between cycles; the store is the only record of what
/// was last minted.
#[derive(Debug)]
pub struct Reconciler<S, M, L> {
    store: S,
    metrics: M,
    ledger: L,
    config: ReconcilerConfig,
    guard: EntityCycleGuard,
}

impl<S, M, L> Reconciler<S, M, L>
where
    S: BaselineStore,
    M: MetricSource,
    L: MintLedger,
{
    pub fn new(store: S, metrics: M, ledger: L, config: ReconcilerConfig) -> Self {
        Self {
            store,
            metrics,
            ledger,
            config,
            guard: EntityCycleGuard::default(),
        }
    }

    /// Shares an in-flight guard with other reconcilers using the same store.
    pub fn with_guard(mut self, guard: EntityCycleGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn run_cycle(&self, entity: &EntityKey) -> CycleOutcome {
        let Some(_permit) = self.guard.try_acquire(entity) else {
            tracing::warn!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                "previous cycle still in flight; skipping"
            );
            return CycleOutcome::Skipped;
        };
        let outcome = self.reconcile(entity);
        log_outcome(entity, &outcome);
        outcome
    }

    fn reconcile(&self, entity: &EntityKey) -> CycleOutcome {
        let prior = match self.store.load(entity) {
            Ok(prior) => prior,
            Err(err) => return failed(CycleFailure::LoadBaseline(err), None, None, None),
        };

        match self.store.load_pending(entity) {
            Ok(Some(pending)) if pending.previous == prior => {
                let outcome = self.settle(entity, pending, true);
                if !outcome.is_ledger_rejection() {
                    return outcome;
                }
                tracing::warn!(
                    target: LOG_TARGET_CYCLE,
                    entity = %entity,
                    "pending mint rejected by ledger; computing a fresh reward"
                );
            }
            Ok(Some(stale)) => {
                tracing::warn!(
                    target: LOG_TARGET_CYCLE,
                    entity = %entity,
                    mint_id = stale.mint_id.as_deref().unwrap_or("-"),
                    pending_previous = %stale.previous,
                    baseline = %prior,
                    "discarding pending mint that does not start at the baseline"
                );
                if let Err(err) = self.store.clear_pending(entity) {
                    return failed(CycleFailure::LoadBaseline(err), Some(prior), None, None);
                }
            }
            Ok(None) => {}
            Err(err) => return failed(CycleFailure::LoadBaseline(err), Some(prior), None, None),
        }

        let current = match self.metrics.fetch_snapshot(entity) {
            Ok(current) => current,
            Err(err) => {
                return failed(CycleFailure::FetchMetrics(err), Some(prior), None, None)
            }
        };

        let delta = self.config.policy.compute(&prior, &current);
        tracing::info!(
            target: LOG_TARGET_CYCLE,
            entity = %entity,
            prior_views = prior.views,
            prior_subscribers = prior.subscribers,
            current_views = current.views,
            current_subscribers = current.subscribers,
            delta_views = delta.delta_views,
            delta_subscribers = delta.delta_subscribers,
            reward = delta.reward_amount,
            "computed reward"
        );

        if delta.reward_amount == 0 {
            return CycleOutcome::NoReward {
                prior,
                current,
                delta,
            };
        }

        let pending = PendingMintRecord {
            entity_id: entity.to_string(),
            mint_id: None,
            idempotency_key: mint_idempotency_key(entity, &prior, &current),
            recipient: self.config.recipient.clone(),
            reward_amount: delta.reward_amount,
            delta_views: delta.delta_views,
            delta_subscribers: delta.delta_subscribers,
            previous: prior,
            current,
            recorded_at_unix_ms: now_unix_ms(),
        };
        if let Err(err) = self.store.save_pending(entity, &pending) {
            return failed(
                CycleFailure::RecordPending(err),
                Some(prior),
                Some(current),
                Some(delta),
            );
        }
        self.settle(entity, pending, false)
    }

    /// Drives a recorded pending mint through submit, confirm, baseline save and audit.
    fn settle(
        &self,
        entity: &EntityKey,
        mut pending: PendingMintRecord,
        resumed: bool,
    ) -> CycleOutcome {
        let prior = pending.previous;
        let current = pending.current;
        let delta = RewardDelta {
            delta_views: pending.delta_views,
            delta_subscribers: pending.delta_subscribers,
            reward_amount: pending.reward_amount,
        };
        let stop = |failure| failed(failure, Some(prior), Some(current), Some(delta));

        let mint_id = match pending.mint_id.clone() {
            Some(mint_id) => {
                tracing::info!(
                    target: LOG_TARGET_CYCLE,
                    entity = %entity,
                    mint_id = %mint_id,
                    amount = pending.reward_amount,
                    "resuming confirmation of pending mint"
                );
                mint_id
            }
            None => {
                let request = self.mint_request(&pending);
                let mint_id = match self.ledger.submit_mint(&request) {
                    Ok(submitted) => submitted.mint_id,
                    Err(LedgerError::DuplicateMint { mint_id, .. }) => {
                        tracing::info!(
                            target: LOG_TARGET_CYCLE,
                            entity = %entity,
                            mint_id = %mint_id,
                            idempotency_key = %request.idempotency_key,
                            "ledger already holds this mint; confirming it"
                        );
                        mint_id
                    }
                    Err(err) => {
                        self.discard_pending(entity);
                        return stop(CycleFailure::SubmitMint(err));
                    }
                };
                pending.mint_id = Some(mint_id.clone());
                if let Err(err) = self.store.save_pending(entity, &pending) {
                    tracing::warn!(
                        target: LOG_TARGET_CYCLE,
                        entity = %entity,
                        mint_id = %mint_id,
                        error = %err,
                        "recording mint id failed; a resumed cycle will resubmit with the same idempotency key"
                    );
                }
                tracing::info!(
                    target: LOG_TARGET_CYCLE,
                    entity = %entity,
                    mint_id = %mint_id,
                    amount = request.amount,
                    recipient = %request.recipient,
                    idempotency_key = %request.idempotency_key,
                    "mint submitted; awaiting confirmation"
                );
                mint_id
            }
        };

        let receipt = match self.ledger.confirm(&PendingMint {
            mint_id,
            idempotency_key: pending.idempotency_key.clone(),
        }) {
            Ok(receipt) => receipt,
            Err(err) => {
                if matches!(err, LedgerError::Rejected { .. }) {
                    self.discard_pending(entity);
                }
                return stop(CycleFailure::ConfirmMint(err));
            }
        };

        if let Err(error) = self.store.save(entity, &current) {
            return CycleOutcome::Inconsistent {
                prior,
                current,
                delta,
                receipt,
                error,
            };
        }
        if let Err(err) = self.store.clear_pending(entity) {
            tracing::warn!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                error = %err,
                "clearing settled pending mint failed; the next cycle discards it"
            );
        }

        let record = MintRecord {
            timestamp_unix_ms: now_unix_ms(),
            entity_id: entity.to_string(),
            recipient: pending.recipient,
            reward_amount: delta.reward_amount,
            delta_views: delta.delta_views,
            delta_subscribers: delta.delta_subscribers,
            previous: prior,
            current,
            receipt_id: receipt.receipt_id.clone(),
            idempotency_key: pending.idempotency_key,
        };
        let audit_error = self.store.append_audit(entity, &record).err();

        CycleOutcome::Minted(MintedCycle {
            prior,
            current,
            delta,
            receipt,
            resumed,
            audit_error,
        })
    }

    fn mint_request(&self, pending: &PendingMintRecord) -> MintRequest {
        MintRequest {
            recipient: pending.recipient.clone(),
            amount: pending.reward_amount,
            entity_id: pending.entity_id.clone(),
            provenance_tag: self.config.provenance_tag.clone(),
            delta_views: pending.delta_views,
            delta_subscribers: pending.delta_subscribers,
            idempotency_key: pending.idempotency_key.clone(),
        }
    }

    fn discard_pending(&self, entity: &EntityKey) {
        if let Err(err) = self.store.clear_pending(entity) {
            tracing::warn!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                error = %err,
                "clearing abandoned pending mint failed"
            );
        }
    }
}

fn failed(
    failure: CycleFailure,
    prior: Option<MetricSnapshot>,
    current: Option<MetricSnapshot>,
    delta: Option<RewardDelta>,
) -> CycleOutcome {
    CycleOutcome::Failed {
        failure,
        prior,
        current,
        delta,
    }
}

fn log_outcome(entity: &EntityKey, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Minted(minted) => {
            tracing::info!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                outcome = outcome.kind().as_str(),
                reward = minted.delta.reward_amount,
                delta_views = minted.delta.delta_views,
                delta_subscribers = minted.delta.delta_subscribers,
                receipt_id = %minted.receipt.receipt_id,
                resumed = minted.resumed,
                "mint confirmed; baseline advanced"
            );
            if let Some(err) = minted.audit_error.as_ref() {
                tracing::error!(
                    target: LOG_TARGET_CYCLE,
                    entity = %entity,
                    receipt_id = %minted.receipt.receipt_id,
                    error = %err,
                    "append audit record failed"
                );
            }
        }
        CycleOutcome::NoReward { delta, .. } => {
            tracing::info!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                outcome = outcome.kind().as_str(),
                delta_views = delta.delta_views,
                delta_subscribers = delta.delta_subscribers,
                "nothing to mint; baseline kept"
            );
        }
        CycleOutcome::Skipped => {}
        CycleOutcome::Failed { failure, delta, .. } => {
            tracing::warn!(
                target: LOG_TARGET_CYCLE,
                entity = %entity,
                outcome = outcome.kind().as_str(),
                stage = failure.stage(),
                reward = delta.map(|delta| delta.reward_amount).unwrap_or(0),
                error = %failure,
                "cycle failed; baseline untouched"
            );
        }
        CycleOutcome::Inconsistent {
            prior,
            current,
            delta,
            receipt,
            error,
        } => {
            tracing::error!(
                target: LOG_TARGET_INCONSISTENCY,
                entity = %entity,
                outcome = outcome.kind().as_str(),
                receipt_id = %receipt.receipt_id,
                reward = delta.reward_amount,
                delta_views = delta.delta_views,
                delta_subscribers = delta.delta_subscribers,
                stale_views = prior.views,
                stale_subscribers = prior.subscribers,
                confirmed_views = current.views,
                confirmed_subscribers = current.subscribers,
                error = %error,
                "mint confirmed but baseline not saved; the next cycle retries the save from the pending mint"
            );
        }
    }
}
