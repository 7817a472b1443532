//! Direct contract ledger: signs `mintFromOracle` as a legacy EIP-155 transaction and
//! sends it through a standard Ethereum JSON-RPC endpoint.
//!
//! The mint id is the transaction hash. Confirmation polls for the receipt; a receipt
//! with status `0x0` is a rejection, and a transaction the node never reports during
//! the whole confirmation window is treated as dropped.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use alloy_primitives::{keccak256, Address, U256};
use alloy_sol_types::{sol, SolCall};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{LedgerError, MintLedger, MintReceipt, MintRequest, PendingMint};
use crate::rpc_client::JsonRpcClient;

sol! {
    function mintFromOracle(
        address to,
        uint256 amount,
        string channelId,
        string source,
        uint256 deltaViews,
        uint256 deltaSubs
    );
}

const NO_PARAMS: [u8; 0] = [];
const GAS_ESTIMATE_HEADROOM_PERCENT: u128 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmLedgerConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub private_key_hex: String,
    /// Queried with `eth_chainId` when unset.
    pub chain_id: Option<u64>,
    /// Estimated with `eth_estimateGas` plus headroom when unset.
    pub gas_limit: Option<u64>,
    pub timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
}

#[derive(Debug)]
pub struct EvmMintLedger {
    rpc: JsonRpcClient,
    contract: Address,
    signer: TransactionSigner,
    chain_id: Option<u64>,
    gas_limit: Option<u64>,
    confirm_timeout: Duration,
    confirm_poll: Duration,
}

impl EvmMintLedger {
    pub fn from_config(config: &EvmLedgerConfig) -> Result<Self, LedgerError> {
        let contract = parse_address(config.contract_address.as_str()).map_err(|message| {
            LedgerError::BuildClient {
                message: format!("contract address: {message}"),
            }
        })?;
        Ok(Self {
            rpc: JsonRpcClient::new(config.rpc_url.as_str(), config.timeout_ms)?,
            contract,
            signer: TransactionSigner::from_private_hex(config.private_key_hex.as_str())?,
            chain_id: config.chain_id,
            gas_limit: config.gas_limit,
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms.max(1)),
            confirm_poll: Duration::from_millis(config.confirm_poll_ms.max(1)),
        })
    }

    /// Account that signs and pays for mint transactions.
    pub fn sender(&self) -> Address {
        self.signer.address
    }

    fn chain_id(&self) -> Result<u64, LedgerError> {
        if let Some(chain_id) = self.chain_id {
            return Ok(chain_id);
        }
        let raw: String = self.rpc.call("eth_chainId", NO_PARAMS)?;
        let chain_id = parse_quantity(raw.as_str())?;
        u64::try_from(chain_id).map_err(|_| LedgerError::DecodeResponse {
            message: format!("chain id out of range: {raw}"),
        })
    }

    fn gas_limit(&self, data: &[u8]) -> Result<u128, LedgerError> {
        if let Some(gas_limit) = self.gas_limit {
            return Ok(u128::from(gas_limit));
        }
        let raw: String = self.rpc.call(
            "eth_estimateGas",
            [CallParams {
                from: self.signer.address.to_string(),
                to: self.contract.to_string(),
                data: hex_data(data),
            }],
        )?;
        let estimate = parse_quantity(raw.as_str())?;
        Ok(estimate.saturating_mul(GAS_ESTIMATE_HEADROOM_PERCENT) / 100)
    }

    fn receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, LedgerError> {
        let receipt: Option<TransactionReceipt> =
            self.rpc.call("eth_getTransactionReceipt", [tx_hash])?;
        Ok(receipt.filter(|receipt| receipt.block_number.is_some()))
    }

    fn transaction_known(&self, tx_hash: &str) -> Result<bool, LedgerError> {
        let transaction: Option<Value> = self.rpc.call("eth_getTransactionByHash", [tx_hash])?;
        Ok(transaction.is_some())
    }
}

impl MintLedger for EvmMintLedger {
    fn submit_mint(&self, request: &MintRequest) -> Result<PendingMint, LedgerError> {
        let data = encode_mint_call(request)?;
        let chain_id = self.chain_id()?;
        let sender = self.signer.address.to_string();
        let nonce: String = self
            .rpc
            .call("eth_getTransactionCount", (sender.as_str(), "pending"))?;
        let gas_price: String = self.rpc.call("eth_gasPrice", NO_PARAMS)?;
        let transaction = LegacyTransaction {
            nonce: parse_quantity(nonce.as_str())?,
            gas_price: parse_quantity(gas_price.as_str())?,
            gas_limit: self.gas_limit(data.as_slice())?,
            to: self.contract,
            value: 0,
            data,
        };
        let raw = self.signer.sign_legacy(&transaction, chain_id)?;
        let tx_hash: String = self
            .rpc
            .call("eth_sendRawTransaction", [hex_data(raw.as_slice())])?;
        tracing::debug!(
            target: "reward_oracle.ledger",
            tx_hash = %tx_hash,
            nonce = transaction.nonce,
            gas_limit = transaction.gas_limit,
            chain_id,
            "mint transaction broadcast"
        );
        Ok(PendingMint {
            mint_id: tx_hash,
            idempotency_key: request.idempotency_key.clone(),
        })
    }

    fn confirm(&self, pending: &PendingMint) -> Result<MintReceipt, LedgerError> {
        let tx_hash = pending.mint_id.as_str();
        let started = Instant::now();
        let mut seen = false;
        loop {
            if let Some(receipt) = self.receipt(tx_hash)? {
                return interpret_receipt(tx_hash, &receipt);
            }
            if !seen {
                seen = self.transaction_known(tx_hash)?;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.confirm_timeout {
                if !seen {
                    return Err(LedgerError::Rejected {
                        mint_id: pending.mint_id.clone(),
                        reason: "transaction unknown to the node; dropped".to_string(),
                    });
                }
                return Err(LedgerError::ConfirmationTimeout {
                    mint_id: pending.mint_id.clone(),
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            thread::sleep(self.confirm_poll.min(self.confirm_timeout - elapsed));
        }
    }
}

struct TransactionSigner {
    key: SigningKey,
    address: Address,
}

impl fmt::Debug for TransactionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl TransactionSigner {
    fn from_private_hex(private_key_hex: &str) -> Result<Self, LedgerError> {
        let private_key_hex = private_key_hex.trim();
        let private_key_hex = private_key_hex
            .strip_prefix("0x")
            .unwrap_or(private_key_hex);
        let bytes = hex::decode(private_key_hex).map_err(|_| LedgerError::InvalidSigningKey {
            reason: "private key must be valid hex".to_string(),
        })?;
        if bytes.len() != 32 {
            return Err(LedgerError::InvalidSigningKey {
                reason: "private key must be 32-byte hex".to_string(),
            });
        }
        let key = SigningKey::from_slice(bytes.as_slice()).map_err(|err| {
            LedgerError::InvalidSigningKey {
                reason: err.to_string(),
            }
        })?;
        let public = key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&public.as_bytes()[1..]);
        let address = Address::from_slice(&digest[12..]);
        Ok(Self { key, address })
    }

    /// Returns the RLP of the signed transaction.
    fn sign_legacy(
        &self,
        transaction: &LegacyTransaction,
        chain_id: u64,
    ) -> Result<Vec<u8>, LedgerError> {
        let mut unsigned = RlpStream::new_list(9);
        transaction.append_fields(&mut unsigned);
        unsigned.append(&chain_id);
        unsigned.append(&0u8);
        unsigned.append(&0u8);
        let sighash = keccak256(unsigned.out());

        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(sighash.as_slice())
            .map_err(|err| LedgerError::EncodeRequest {
                message: format!("sign transaction: {err}"),
            })?;
        let v = chain_id
            .saturating_mul(2)
            .saturating_add(35 + u64::from(recovery_id.to_byte()));
        let signature = signature.to_bytes();
        let (r, s) = signature.split_at(32);

        let mut signed = RlpStream::new_list(9);
        transaction.append_fields(&mut signed);
        signed.append(&v);
        signed.append(&trim_leading_zeros(r));
        signed.append(&trim_leading_zeros(s));
        Ok(signed.out().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyTransaction {
    nonce: u128,
    gas_price: u128,
    gas_limit: u128,
    to: Address,
    value: u128,
    data: Vec<u8>,
}

impl LegacyTransaction {
    fn append_fields(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to.as_slice().to_vec());
        stream.append(&self.value);
        stream.append(&self.data);
    }
}

#[derive(Debug, Serialize)]
struct CallParams {
    from: String,
    to: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
}

fn interpret_receipt(
    tx_hash: &str,
    receipt: &TransactionReceipt,
) -> Result<MintReceipt, LedgerError> {
    match receipt.status.as_deref() {
        Some("0x1") => Ok(MintReceipt {
            receipt_id: tx_hash.to_string(),
        }),
        Some("0x0") => Err(LedgerError::Rejected {
            mint_id: tx_hash.to_string(),
            reason: format!(
                "transaction reverted in block {}",
                receipt.block_number.as_deref().unwrap_or("?")
            ),
        }),
        other => Err(LedgerError::DecodeResponse {
            message: format!("receipt for {tx_hash} has unexpected status {other:?}"),
        }),
    }
}

fn encode_mint_call(request: &MintRequest) -> Result<Vec<u8>, LedgerError> {
    let to = parse_address(request.recipient.as_str()).map_err(|message| {
        LedgerError::EncodeRequest {
            message: format!("recipient: {message}"),
        }
    })?;
    let call = mintFromOracleCall {
        to,
        amount: U256::from(request.amount),
        channelId: request.entity_id.clone(),
        source: request.provenance_tag.clone(),
        deltaViews: unsigned_delta("deltaViews", request.delta_views)?,
        deltaSubs: unsigned_delta("deltaSubs", request.delta_subscribers)?,
    };
    Ok(call.abi_encode())
}

fn unsigned_delta(name: &str, value: i64) -> Result<U256, LedgerError> {
    u64::try_from(value)
        .map(U256::from)
        .map_err(|_| LedgerError::EncodeRequest {
            message: format!("{name} is negative ({value}) and the contract takes uint256"),
        })
}

fn parse_address(raw: &str) -> Result<Address, String> {
    raw.trim()
        .parse::<Address>()
        .map_err(|err| format!("invalid address {raw:?}: {err}"))
}

fn parse_quantity(raw: &str) -> Result<u128, LedgerError> {
    let digits = raw.strip_prefix("0x").ok_or_else(|| LedgerError::DecodeResponse {
        message: format!("quantity without 0x prefix: {raw:?}"),
    })?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|err| LedgerError::DecodeResponse {
        message: format!("invalid quantity {raw:?}: {err}"),
    })
}

fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::serve;
    use serde_json::json;

    const EIP155_KEY: &str = "0x4646464646464646464646464646464646464646464646464646464646464646";
    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";
    const CONTRACT: &str = "0x2222222222222222222222222222222222222222";

    fn rpc_result(result: Value) -> (u16, String) {
        (
            200,
            json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string(),
        )
    }

    fn ledger_config(rpc_url: &str) -> EvmLedgerConfig {
        EvmLedgerConfig {
            rpc_url: rpc_url.to_string(),
            contract_address: CONTRACT.to_string(),
            private_key_hex: EIP155_KEY.to_string(),
            chain_id: Some(137),
            gas_limit: None,
            timeout_ms: 5_000,
            confirm_timeout_ms: 5_000,
            confirm_poll_ms: 10,
        }
    }

    fn request() -> MintRequest {
        MintRequest {
            recipient: RECIPIENT.to_string(),
            amount: 105,
            entity_id: "UCchannel".to_string(),
            provenance_tag: "Auto-Oracle".to_string(),
            delta_views: 20,
            delta_subscribers: 10,
            idempotency_key: "key-1".to_string(),
        }
    }

    fn pending(tx_hash: &str) -> PendingMint {
        PendingMint {
            mint_id: tx_hash.to_string(),
            idempotency_key: "key-1".to_string(),
        }
    }

    #[test]
    fn signer_derives_sender_address() {
        let signer = TransactionSigner::from_private_hex(EIP155_KEY).expect("signer");
        assert_eq!(
            signer.address,
            parse_address("0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F").expect("address")
        );
    }

    #[test]
    fn legacy_signature_matches_eip155_example() {
        let signer = TransactionSigner::from_private_hex(EIP155_KEY).expect("signer");
        let transaction = LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: parse_address("0x3535353535353535353535353535353535353535").expect("to"),
            value: 1_000_000_000_000_000_000,
            data: Vec::new(),
        };

        let raw = signer.sign_legacy(&transaction, 1).expect("sign");

        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn mint_call_encodes_contract_arguments() {
        let data = encode_mint_call(&request()).expect("encode");

        assert_eq!(&data[..4], mintFromOracleCall::SELECTOR.as_slice());
        let decoded = mintFromOracleCall::abi_decode(data.as_slice(), true).expect("decode");
        assert_eq!(decoded.to, parse_address(RECIPIENT).expect("address"));
        assert_eq!(decoded.amount, U256::from(105u64));
        assert_eq!(decoded.channelId, "UCchannel");
        assert_eq!(decoded.source, "Auto-Oracle");
        assert_eq!(decoded.deltaViews, U256::from(20u64));
        assert_eq!(decoded.deltaSubs, U256::from(10u64));
    }

    #[test]
    fn negative_delta_cannot_be_encoded() {
        let mut request = request();
        request.delta_views = -40;
        let err = encode_mint_call(&request).expect_err("negative delta");
        assert!(matches!(
            err,
            LedgerError::EncodeRequest { ref message } if message.contains("deltaViews")
        ));
    }

    #[test]
    fn invalid_private_key_is_rejected() {
        let mut config = ledger_config("http://127.0.0.1:1");
        config.private_key_hex = "0x1234".to_string();
        let err = EvmMintLedger::from_config(&config).expect_err("short key");
        assert!(matches!(err, LedgerError::InvalidSigningKey { .. }));
    }

    #[test]
    fn quantities_parse_hex() {
        assert_eq!(parse_quantity("0x0").expect("zero"), 0);
        assert_eq!(parse_quantity("0x").expect("empty"), 0);
        assert_eq!(parse_quantity("0x5208").expect("gas"), 21_000);
        assert!(parse_quantity("5208").is_err());
    }

    #[test]
    fn submit_broadcasts_signed_transaction_and_returns_hash() {
        let server = serve(vec![
            rpc_result(json!("0x7")),
            rpc_result(json!("0x3b9aca00")),
            rpc_result(json!("0x186a0")),
            rpc_result(json!("0xabc123")),
        ]);
        let ledger = EvmMintLedger::from_config(&ledger_config(&server.url)).expect("ledger");

        let pending = ledger.submit_mint(&request()).expect("submit");

        assert_eq!(pending.mint_id, "0xabc123");
        let requests = server.finish();
        let bodies: Vec<Value> = requests
            .iter()
            .map(|request| serde_json::from_str(request.body.as_str()).expect("json body"))
            .collect();
        let methods: Vec<&str> = bodies
            .iter()
            .map(|body| body["method"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(
            methods,
            vec![
                "eth_getTransactionCount",
                "eth_gasPrice",
                "eth_estimateGas",
                "eth_sendRawTransaction"
            ]
        );
        assert_eq!(bodies[0]["params"][1], "pending");
        assert_eq!(
            bodies[2]["params"][0]["to"]
                .as_str()
                .map(str::to_ascii_lowercase)
                .as_deref(),
            Some(CONTRACT)
        );
        let raw = bodies[3]["params"][0].as_str().expect("raw tx");
        assert!(raw.starts_with("0xf9"));
    }

    #[test]
    fn confirm_waits_for_successful_receipt() {
        let server = serve(vec![
            rpc_result(Value::Null),
            rpc_result(json!({"hash": "0xabc"})),
            rpc_result(json!({"status": "0x1", "blockNumber": "0x10"})),
        ]);
        let ledger = EvmMintLedger::from_config(&ledger_config(&server.url)).expect("ledger");

        let receipt = ledger.confirm(&pending("0xabc")).expect("confirmed");

        assert_eq!(receipt.receipt_id, "0xabc");
        assert_eq!(server.finish().len(), 3);
    }

    #[test]
    fn reverted_receipt_is_a_rejection() {
        let server = serve(vec![rpc_result(
            json!({"status": "0x0", "blockNumber": "0x10"}),
        )]);
        let ledger = EvmMintLedger::from_config(&ledger_config(&server.url)).expect("ledger");

        let err = ledger.confirm(&pending("0xdead")).expect_err("reverted");

        assert!(matches!(
            err,
            LedgerError::Rejected { ref mint_id, .. } if mint_id == "0xdead"
        ));
        server.finish();
    }

    #[test]
    fn transaction_never_seen_is_reported_dropped() {
        let server = serve(vec![
            rpc_result(Value::Null),
            rpc_result(Value::Null),
            rpc_result(Value::Null),
            rpc_result(Value::Null),
        ]);
        let mut config = ledger_config(&server.url);
        config.confirm_timeout_ms = 1;
        let ledger = EvmMintLedger::from_config(&config).expect("ledger");

        let err = ledger.confirm(&pending("0xgone")).expect_err("dropped");

        assert!(matches!(
            err,
            LedgerError::Rejected { ref reason, .. } if reason.contains("dropped")
        ));
    }
}
