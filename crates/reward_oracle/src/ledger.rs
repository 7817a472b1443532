use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use reward_oracle_store::{EntityKey, MetricSnapshot};

const IDEMPOTENCY_DOMAIN: &[u8] = b"reward-oracle-mint-v1";

/// One mint call as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    pub recipient: String,
    pub amount: u64,
    pub entity_id: String,
    pub provenance_tag: String,
    pub delta_views: i64,
    pub delta_subscribers: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMint {
    pub mint_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub receipt_id: String,
}

/// Ledger mutation endpoint. `submit_mint` hands over the request and `confirm` blocks
/// until the ledger reports durable acceptance or failure.
pub trait MintLedger {
    fn submit_mint(&self, request: &MintRequest) -> Result<PendingMint, LedgerError>;

    fn confirm(&self, pending: &PendingMint) -> Result<MintReceipt, LedgerError>;
}

pub type DynMintLedger = Box<dyn MintLedger + Send + Sync>;

impl<L> MintLedger for Box<L>
where
    L: MintLedger + ?Sized,
{
    fn submit_mint(&self, request: &MintRequest) -> Result<PendingMint, LedgerError> {
        (**self).submit_mint(request)
    }

    fn confirm(&self, pending: &PendingMint) -> Result<MintReceipt, LedgerError> {
        (**self).confirm(pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    BuildClient { message: String },
    InvalidSigningKey { reason: String },
    EncodeRequest { message: String },
    Http { message: String },
    HttpStatus { code: u16, message: String },
    Rpc { code: i64, message: String },
    DecodeResponse { message: String },
    /// The ledger already holds a mint for this key; `mint_id` names it.
    DuplicateMint { idempotency_key: String, mint_id: String },
    Rejected { mint_id: String, reason: String },
    ConfirmationTimeout { mint_id: String, waited_ms: u64 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::BuildClient { message } => {
                write!(f, "ledger client build failed: {message}")
            }
            LedgerError::InvalidSigningKey { reason } => {
                write!(f, "invalid ledger signing key: {reason}")
            }
            LedgerError::EncodeRequest { message } => {
                write!(f, "encode ledger request failed: {message}")
            }
            LedgerError::Http { message } => write!(f, "ledger request failed: {message}"),
            LedgerError::HttpStatus { code, message } => {
                write!(f, "ledger http status {code}: {message}")
            }
            LedgerError::Rpc { code, message } => write!(f, "ledger rpc error {code}: {message}"),
            LedgerError::DecodeResponse { message } => {
                write!(f, "decode ledger response failed: {message}")
            }
            LedgerError::DuplicateMint {
                idempotency_key,
                mint_id,
            } => write!(
                f,
                "mint for idempotency key {idempotency_key} already submitted as {mint_id}"
            ),
            LedgerError::Rejected { mint_id, reason } => {
                write!(f, "ledger rejected mint {mint_id}: {reason}")
            }
            LedgerError::ConfirmationTimeout { mint_id, waited_ms } => {
                write!(f, "mint {mint_id} not confirmed after {waited_ms}ms")
            }
        }
    }
}

impl Error for LedgerError {}

/// Deterministic key for the transition `prior -> current` of `entity`.
///
/// A retried cycle that recomputes the same transition carries the same key, which
/// lets the ledger point back at the mint it already holds.
pub fn mint_idempotency_key(
    entity: &EntityKey,
    prior: &MetricSnapshot,
    current: &MetricSnapshot,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(IDEMPOTENCY_DOMAIN);
    hasher.update(b"|");
    hasher.update(entity.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(prior.views.to_be_bytes());
    hasher.update(prior.subscribers.to_be_bytes());
    hasher.update(current.views.to_be_bytes());
    hasher.update(current.subscribers.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_depends_on_transition() {
        let entity = EntityKey::new("UCchannel").expect("entity");
        let prior = MetricSnapshot::new(1000, 100);
        let current = MetricSnapshot::new(1020, 110);

        let key = mint_idempotency_key(&entity, &prior, &current);
        assert_eq!(key.len(), 64);
        assert_eq!(key, mint_idempotency_key(&entity, &prior, &current));
        assert_ne!(key, mint_idempotency_key(&entity, &current, &prior));
        assert_ne!(
            key,
            mint_idempotency_key(&EntityKey::new("UCother").expect("entity"), &prior, &current)
        );
    }
}
