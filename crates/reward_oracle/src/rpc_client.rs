use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::LedgerError;

/// Blocking JSON-RPC 2.0 client shared by the ledger backends.
#[derive(Debug)]
pub(crate) struct JsonRpcClient {
    url: String,
    client: Client,
    next_request_id: AtomicU64,
}

impl JsonRpcClient {
    pub(crate) fn new(url: &str, timeout_ms: u64) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|err| LedgerError::BuildClient {
                message: err.to_string(),
            })?;
        Ok(Self {
            url: url.trim().to_string(),
            client,
            next_request_id: AtomicU64::new(1),
        })
    }

    /// `params` is sent as-is; callers pass an array or tuple for positional parameters.
    pub(crate) fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, LedgerError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .client
            .post(self.url.as_str())
            .json(&request)
            .send()
            .map_err(|err| LedgerError::Http {
                message: format!("{method}: {err}"),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(LedgerError::HttpStatus {
                code: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .map_err(|err| LedgerError::DecodeResponse {
                message: format!("{method}: {err}"),
            })?;
        decode_rpc_result(body)
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A `null` result decodes into `Option::None` when `R` is an option.
pub(crate) fn decode_rpc_result<R: DeserializeOwned>(mut body: Value) -> Result<R, LedgerError> {
    if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
        let error: JsonRpcError =
            serde_json::from_value(error.clone()).map_err(|err| LedgerError::DecodeResponse {
                message: format!("malformed rpc error: {err}"),
            })?;
        return Err(LedgerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    let result = body
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| LedgerError::DecodeResponse {
            message: "rpc response has neither result nor error".to_string(),
        })?;
    serde_json::from_value(result).map_err(|err| LedgerError::DecodeResponse {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Answer {
        value: u64,
    }

    #[test]
    fn rpc_result_is_decoded() {
        let answer: Answer =
            decode_rpc_result(json!({"jsonrpc": "2.0", "id": 1, "result": {"value": 7}}))
                .expect("result");
        assert_eq!(answer.value, 7);
    }

    #[test]
    fn null_result_decodes_as_none() {
        let answer: Option<Answer> =
            decode_rpc_result(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
                .expect("null result");
        assert!(answer.is_none());
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let err = decode_rpc_result::<Answer>(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "nonce too low"}
        }))
        .expect_err("rpc error");
        assert_eq!(
            err,
            LedgerError::Rpc {
                code: -32000,
                message: "nonce too low".to_string()
            }
        );
    }

    #[test]
    fn rpc_response_without_result_is_rejected() {
        let err = decode_rpc_result::<Answer>(json!({"jsonrpc": "2.0", "id": 1}))
            .expect_err("empty response");
        assert!(matches!(err, LedgerError::DecodeResponse { .. }));
    }
}
