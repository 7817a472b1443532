use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::Serialize;

use crate::ledger::{LedgerError, MintRequest};

const MINT_SIGNING_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub(crate) struct MintRequestSigner {
    signing_key: SigningKey,
    public_key_hex: String,
}

impl MintRequestSigner {
    pub(crate) fn from_private_hex(private_key_hex: &str) -> Result<Self, LedgerError> {
        let private_key_hex = private_key_hex.trim();
        let private_key_hex = private_key_hex
            .strip_prefix("0x")
            .unwrap_or(private_key_hex);
        let private_bytes =
            hex::decode(private_key_hex).map_err(|_| LedgerError::InvalidSigningKey {
                reason: "signing key must be valid hex".to_string(),
            })?;
        let private_array: [u8; 32] =
            private_bytes
                .try_into()
                .map_err(|_| LedgerError::InvalidSigningKey {
                    reason: "signing key must be 32-byte hex".to_string(),
                })?;
        let signing_key = SigningKey::from_bytes(&private_array);
        let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Ok(Self {
            signing_key,
            public_key_hex,
        })
    }

    pub(crate) fn public_key_hex(&self) -> &str {
        self.public_key_hex.as_str()
    }

    pub(crate) fn sign_mint(
        &self,
        contract_address: &str,
        request: &MintRequest,
    ) -> Result<String, LedgerError> {
        let payload = mint_signing_bytes(contract_address, request, self.public_key_hex())?;
        let signature: Signature = self.signing_key.sign(&payload);
        Ok(hex::encode(signature.to_bytes()))
    }
}

#[derive(Debug, Serialize)]
struct MintSigningPayload<'a> {
    version: u8,
    contract_address: &'a str,
    recipient: &'a str,
    amount: u64,
    entity_id: &'a str,
    provenance_tag: &'a str,
    delta_views: i64,
    delta_subscribers: i64,
    idempotency_key: &'a str,
    public_key_hex: &'a str,
}

pub(crate) fn mint_signing_bytes(
    contract_address: &str,
    request: &MintRequest,
    public_key_hex: &str,
) -> Result<Vec<u8>, LedgerError> {
    let payload = MintSigningPayload {
        version: MINT_SIGNING_VERSION,
        contract_address,
        recipient: request.recipient.as_str(),
        amount: request.amount,
        entity_id: request.entity_id.as_str(),
        provenance_tag: request.provenance_tag.as_str(),
        delta_views: request.delta_views,
        delta_subscribers: request.delta_subscribers,
        idempotency_key: request.idempotency_key.as_str(),
        public_key_hex,
    };
    serde_json::to_vec(&payload).map_err(|err| LedgerError::EncodeRequest {
        message: err.to_string(),
    })
}
