//! JSON-RPC client for the mint gateway that fronts the reward contract.
//!
//! `oracle_submitMint` accepts a signed mint request and returns a gateway mint id;
//! `oracle_getMintStatus` reports `pending`, `confirmed` (with the transaction receipt
//! id) or `failed`. The gateway deduplicates on `idempotencyKey`: a second submit
//! fails with [`DUPLICATE_MINT_CODE`] and `oracle_findMint` names the mint it kept.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerError, MintLedger, MintReceipt, MintRequest, PendingMint};
use crate::ledger_signature::MintRequestSigner;
use crate::rpc_client::JsonRpcClient;

const METHOD_SUBMIT_MINT: &str = "oracle_submitMint";
const METHOD_GET_MINT_STATUS: &str = "oracle_getMintStatus";
const METHOD_FIND_MINT: &str = "oracle_findMint";

pub const DUPLICATE_MINT_CODE: i64 = -32010;

pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_CONFIRM_POLL_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerGatewayConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub signing_key_hex: String,
    pub timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
}

#[derive(Debug)]
pub struct JsonRpcMintLedger {
    rpc: JsonRpcClient,
    contract_address: String,
    signer: MintRequestSigner,
    confirm_timeout: Duration,
    confirm_poll: Duration,
}

impl JsonRpcMintLedger {
    pub fn from_config(config: &LedgerGatewayConfig) -> Result<Self, LedgerError> {
        let signer = MintRequestSigner::from_private_hex(config.signing_key_hex.as_str())?;
        Ok(Self {
            rpc: JsonRpcClient::new(config.rpc_url.as_str(), config.timeout_ms)?,
            contract_address: config.contract_address.trim().to_string(),
            signer,
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms.max(1)),
            confirm_poll: Duration::from_millis(config.confirm_poll_ms.max(1)),
        })
    }

    pub fn public_key_hex(&self) -> &str {
        self.signer.public_key_hex()
    }

    fn mint_status(&self, mint_id: &str) -> Result<MintStatusResult, LedgerError> {
        self.rpc.call(
            METHOD_GET_MINT_STATUS,
            [MintStatusParams {
                contract: self.contract_address.as_str(),
                mint_id,
            }],
        )
    }

    fn find_mint(&self, idempotency_key: &str) -> Result<LedgerError, LedgerError> {
        let found: SubmitMintResult = self.rpc.call(
            METHOD_FIND_MINT,
            [FindMintParams {
                contract: self.contract_address.as_str(),
                idempotency_key,
            }],
        )?;
        Ok(LedgerError::DuplicateMint {
            idempotency_key: idempotency_key.to_string(),
            mint_id: found.mint_id,
        })
    }
}

impl MintLedger for JsonRpcMintLedger {
    fn submit_mint(&self, request: &MintRequest) -> Result<PendingMint, LedgerError> {
        let signature = self
            .signer
            .sign_mint(self.contract_address.as_str(), request)?;
        let submitted = self.rpc.call::<_, SubmitMintResult>(
            METHOD_SUBMIT_MINT,
            [SubmitMintParams {
                contract: self.contract_address.as_str(),
                recipient: request.recipient.as_str(),
                amount: request.amount,
                entity_id: request.entity_id.as_str(),
                provenance_tag: request.provenance_tag.as_str(),
                delta_views: request.delta_views,
                delta_subscribers: request.delta_subscribers,
                idempotency_key: request.idempotency_key.as_str(),
                public_key: self.signer.public_key_hex(),
                signature: signature.as_str(),
            }],
        );
        let result = match submitted {
            Ok(result) => result,
            Err(LedgerError::Rpc { code, .. }) if code == DUPLICATE_MINT_CODE => {
                return Err(self.find_mint(request.idempotency_key.as_str())?);
            }
            Err(err) => return Err(err),
        };
        if result.mint_id.trim().is_empty() {
            return Err(LedgerError::DecodeResponse {
                message: "gateway returned empty mintId".to_string(),
            });
        }
        Ok(PendingMint {
            mint_id: result.mint_id,
            idempotency_key: request.idempotency_key.clone(),
        })
    }

    fn confirm(&self, pending: &PendingMint) -> Result<MintReceipt, LedgerError> {
        let started = Instant::now();
        loop {
            let status = self.mint_status(pending.mint_id.as_str())?;
            if let Some(receipt) = interpret_mint_status(pending.mint_id.as_str(), status)? {
                return Ok(receipt);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.confirm_timeout {
                return Err(LedgerError::ConfirmationTimeout {
                    mint_id: pending.mint_id.clone(),
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            thread::sleep(self.confirm_poll.min(self.confirm_timeout - elapsed));
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitMintParams<'a> {
    contract: &'a str,
    recipient: &'a str,
    amount: u64,
    entity_id: &'a str,
    provenance_tag: &'a str,
    delta_views: i64,
    delta_subscribers: i64,
    idempotency_key: &'a str,
    public_key: &'a str,
    signature: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MintStatusParams<'a> {
    contract: &'a str,
    mint_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindMintParams<'a> {
    contract: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitMintResult {
    mint_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintStatusResult {
    status: String,
    #[serde(default)]
    receipt_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn interpret_mint_status(
    mint_id: &str,
    status: MintStatusResult,
) -> Result<Option<MintReceipt>, LedgerError> {
    match status.status.trim().to_ascii_lowercase().as_str() {
        "pending" | "submitted" => Ok(None),
        "confirmed" => {
            let receipt_id = status
                .receipt_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| LedgerError::DecodeResponse {
                    message: format!("confirmed mint {mint_id} has no receiptId"),
                })?;
            Ok(Some(MintReceipt { receipt_id }))
        }
        "failed" | "rejected" => Err(LedgerError::Rejected {
            mint_id: mint_id.to_string(),
            reason: status
                .reason
                .unwrap_or_else(|| "no reason given".to_string()),
        }),
        other => Err(LedgerError::DecodeResponse {
            message: format!("unknown mint status {other:?} for {mint_id}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::serve;
    use serde_json::{json, Value};

    fn gateway_config(rpc_url: &str) -> LedgerGatewayConfig {
        LedgerGatewayConfig {
            rpc_url: rpc_url.to_string(),
            contract_address: "0xcontract".to_string(),
            signing_key_hex: "11".repeat(32),
            timeout_ms: 5_000,
            confirm_timeout_ms: 5_000,
            confirm_poll_ms: 10,
        }
    }

    fn rpc_result(result: Value) -> (u16, String) {
        (
            200,
            json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string(),
        )
    }

    fn request() -> MintRequest {
        MintRequest {
            recipient: "0xrecipient".to_string(),
            amount: 105,
            entity_id: "UCchannel".to_string(),
            provenance_tag: "Auto-Oracle".to_string(),
            delta_views: 20,
            delta_subscribers: 10,
            idempotency_key: "key-1".to_string(),
        }
    }

    fn status(raw: Value) -> MintStatusResult {
        serde_json::from_value(raw).expect("status")
    }

    #[test]
    fn pending_status_keeps_polling() {
        let outcome = interpret_mint_status("m-1", status(json!({"status": "pending"})))
            .expect("pending");
        assert_eq!(outcome, None);
    }

    #[test]
    fn confirmed_status_yields_receipt() {
        let outcome = interpret_mint_status(
            "m-1",
            status(json!({"status": "confirmed", "receiptId": "0xhash"})),
        )
        .expect("confirmed");
        assert_eq!(
            outcome,
            Some(MintReceipt {
                receipt_id: "0xhash".to_string()
            })
        );
    }

    #[test]
    fn confirmed_status_requires_receipt_id() {
        let err = interpret_mint_status("m-1", status(json!({"status": "confirmed"})))
            .expect_err("no receipt");
        assert!(err.to_string().contains("receiptId"));
    }

    #[test]
    fn failed_status_is_a_rejection() {
        let err = interpret_mint_status(
            "m-1",
            status(json!({"status": "failed", "reason": "reverted"})),
        )
        .expect_err("failed");
        assert_eq!(
            err,
            LedgerError::Rejected {
                mint_id: "m-1".to_string(),
                reason: "reverted".to_string()
            }
        );
    }

    #[test]
    fn from_config_rejects_bad_signing_key() {
        let err = JsonRpcMintLedger::from_config(&LedgerGatewayConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            contract_address: "0xcontract".to_string(),
            signing_key_hex: "zz".to_string(),
            timeout_ms: 1_000,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
            confirm_poll_ms: DEFAULT_CONFIRM_POLL_MS,
        })
        .expect_err("bad key");
        assert!(matches!(err, LedgerError::InvalidSigningKey { .. }));
    }

    #[test]
    fn confirm_polls_until_gateway_reports_confirmed() {
        let server = serve(vec![
            rpc_result(json!({"status": "pending"})),
            rpc_result(json!({"status": "submitted"})),
            rpc_result(json!({"status": "confirmed", "receiptId": "0xhash"})),
        ]);
        let ledger = JsonRpcMintLedger::from_config(&gateway_config(&server.url)).expect("ledger");

        let receipt = ledger
            .confirm(&PendingMint {
                mint_id: "m-7".to_string(),
                idempotency_key: "key-1".to_string(),
            })
            .expect("confirmed");

        assert_eq!(receipt.receipt_id, "0xhash");
        let requests = server.finish();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            let body: Value = serde_json::from_str(request.body.as_str()).expect("json body");
            assert_eq!(body["method"], METHOD_GET_MINT_STATUS);
            assert_eq!(body["params"][0]["mintId"], "m-7");
            assert_eq!(body["params"][0]["contract"], "0xcontract");
        }
    }

    #[test]
    fn confirm_gives_up_after_timeout() {
        let server = serve(vec![
            rpc_result(json!({"status": "pending"})),
            rpc_result(json!({"status": "pending"})),
        ]);
        let mut config = gateway_config(&server.url);
        config.confirm_timeout_ms = 1;
        config.confirm_poll_ms = 1;
        let ledger = JsonRpcMintLedger::from_config(&config).expect("ledger");

        let err = ledger
            .confirm(&PendingMint {
                mint_id: "m-8".to_string(),
                idempotency_key: "key-1".to_string(),
            })
            .expect_err("timeout");

        assert!(matches!(
            err,
            LedgerError::ConfirmationTimeout { ref mint_id, .. } if mint_id == "m-8"
        ));
    }

    #[test]
    fn submit_sends_signed_request_and_returns_mint_id() {
        let server = serve(vec![rpc_result(json!({"mintId": "m-1"}))]);
        let ledger = JsonRpcMintLedger::from_config(&gateway_config(&server.url)).expect("ledger");

        let pending = ledger.submit_mint(&request()).expect("submit");

        assert_eq!(pending.mint_id, "m-1");
        assert_eq!(pending.idempotency_key, "key-1");
        let requests = server.finish();
        let body: Value = serde_json::from_str(requests[0].body.as_str()).expect("json body");
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["method"], METHOD_SUBMIT_MINT);
        assert_eq!(body["params"][0]["amount"], 105);
        assert_eq!(body["params"][0]["idempotencyKey"], "key-1");
        assert_eq!(body["params"][0]["publicKey"], ledger.public_key_hex());
        assert!(body["params"][0]["signature"]
            .as_str()
            .is_some_and(|signature| !signature.is_empty()));
    }

    #[test]
    fn duplicate_submit_resolves_to_existing_mint() {
        let server = serve(vec![
            (
                200,
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": DUPLICATE_MINT_CODE, "message": "duplicate idempotency key"}
                })
                .to_string(),
            ),
            rpc_result(json!({"mintId": "m-original"})),
        ]);
        let ledger = JsonRpcMintLedger::from_config(&gateway_config(&server.url)).expect("ledger");

        let err = ledger.submit_mint(&request()).expect_err("duplicate");

        assert_eq!(
            err,
            LedgerError::DuplicateMint {
                idempotency_key: "key-1".to_string(),
                mint_id: "m-original".to_string(),
            }
        );
        let requests = server.finish();
        let lookup: Value = serde_json::from_str(requests[1].body.as_str()).expect("json body");
        assert_eq!(lookup["method"], METHOD_FIND_MINT);
        assert_eq!(lookup["params"][0]["idempotencyKey"], "key-1");
    }
}
