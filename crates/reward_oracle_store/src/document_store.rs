use std::time::Duration;

use chrono::{DateTime, SecondsFormat};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};

use crate::access_token::{AccessTokenSource, FirestoreCredentials};
use crate::{
    escape_path_component, BaselineStore, EntityKey, MetricSnapshot, MintRecord,
    PendingMintRecord, StoreError,
};

pub const DEFAULT_FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const MINTS_SUBCOLLECTION: &str = "mints";
const PENDING_DOCUMENT: &str = "pending/current";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirestoreConfig {
    pub base_url: String,
    pub project_id: String,
    pub collection: String,
    pub credentials: FirestoreCredentials,
    pub timeout_ms: u64,
}

/// Document database backend speaking the Firestore REST protocol.
///
/// The baseline lives in `{collection}/{entity}` as `{ views, subscribers }` and is
/// replaced by a single `PATCH` without a field mask. Audit records are created in the
/// `{collection}/{entity}/mints` sub-collection and the unconfirmed mint, if any, in
/// `{collection}/{entity}/pending/current`.
///
/// Requests carry a bearer token from [`FirestoreCredentials`]; a `401` drops the cached
/// token and the request is sent once more with a fresh one.
#[derive(Debug)]
pub struct FirestoreBaselineStore {
    documents_url: String,
    collection: String,
    tokens: AccessTokenSource,
    client: Client,
}

impl FirestoreBaselineStore {
    pub fn from_config(config: &FirestoreConfig) -> Result<Self, StoreError> {
        if config.project_id.trim().is_empty() {
            return Err(StoreError::Unavailable {
                reason: "firestore project id cannot be empty".to_string(),
            });
        }
        if config.collection.trim().is_empty() || config.collection.contains('/') {
            return Err(StoreError::Unavailable {
                reason: format!("invalid firestore collection: {:?}", config.collection),
            });
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|err| StoreError::Http {
                message: err.to_string(),
            })?;
        Ok(Self {
            documents_url: format!(
                "{}/projects/{}/databases/(default)/documents",
                config.base_url.trim_end_matches('/'),
                config.project_id.trim()
            ),
            collection: config.collection.trim().to_string(),
            tokens: AccessTokenSource::new(config.credentials.clone()),
            client,
        })
    }

    fn document_url(&self, entity: &EntityKey) -> Result<String, StoreError> {
        if entity.as_str().contains('/') {
            return Err(StoreError::InvalidEntity {
                entity: entity.to_string(),
            });
        }
        Ok(format!(
            "{}/{}/{}",
            self.documents_url,
            self.collection,
            escape_path_component(entity.as_str())
        ))
    }

    fn pending_url(&self, entity: &EntityKey) -> Result<String, StoreError> {
        Ok(format!("{}/{}", self.document_url(entity)?, PENDING_DOCUMENT))
    }

    fn send(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response, StoreError> {
        let token = self.tokens.access_token(&self.client)?;
        let response = send_request(build(&self.client).bearer_auth(token))?;
        if response.status() != StatusCode::UNAUTHORIZED || !self.tokens.refreshes() {
            return Ok(response);
        }
        self.tokens.invalidate();
        let token = self.tokens.access_token(&self.client)?;
        send_request(build(&self.client).bearer_auth(token))
    }

    fn get_document(&self, url: &str) -> Result<Option<Value>, StoreError> {
        let response = self.send(|client| client.get(url))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(http_status_error(status, response));
        }
        response
            .json()
            .map(Some)
            .map_err(|err| StoreError::Decode {
                source: url.to_string(),
                message: err.to_string(),
            })
    }

    fn patch_document(&self, url: &str, fields: &Value) -> Result<(), StoreError> {
        let body = json!({ "fields": fields });
        let response = self.send(|client| client.patch(url).json(&body))?;
        expect_success(response)
    }
}

impl BaselineStore for FirestoreBaselineStore {
    fn load_snapshot(&self, entity: &EntityKey) -> Result<Option<MetricSnapshot>, StoreError> {
        let url = self.document_url(entity)?;
        let Some(document) = self.get_document(url.as_str())? else {
            return Ok(None);
        };
        decode_snapshot_document(&document)
            .map(Some)
            .map_err(|message| StoreError::Decode {
                source: url,
                message,
            })
    }

    fn save(&self, entity: &EntityKey, snapshot: &MetricSnapshot) -> Result<(), StoreError> {
        let url = self.document_url(entity)?;
        self.patch_document(url.as_str(), &encode_snapshot_fields(snapshot))
    }

    fn append_audit(&self, entity: &EntityKey, record: &MintRecord) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.document_url(entity)?, MINTS_SUBCOLLECTION);
        let body = json!({ "fields": encode_mint_record_fields(record)? });
        let response = self.send(|client| client.post(url.as_str()).json(&body))?;
        expect_success(response)
    }

    fn load_pending(&self, entity: &EntityKey) -> Result<Option<PendingMintRecord>, StoreError> {
        let url = self.pending_url(entity)?;
        let Some(document) = self.get_document(url.as_str())? else {
            return Ok(None);
        };
        decode_pending_document(&document)
            .map(Some)
            .map_err(|message| StoreError::Decode {
                source: url,
                message,
            })
    }

    fn save_pending(
        &self,
        entity: &EntityKey,
        pending: &PendingMintRecord,
    ) -> Result<(), StoreError> {
        let url = self.pending_url(entity)?;
        self.patch_document(url.as_str(), &encode_pending_fields(pending)?)
    }

    fn clear_pending(&self, entity: &EntityKey) -> Result<(), StoreError> {
        let url = self.pending_url(entity)?;
        let response = self.send(|client| client.delete(url.as_str()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(response)
    }
}

fn send_request(request: RequestBuilder) -> Result<Response, StoreError> {
    request.send().map_err(|err| StoreError::Http {
        message: err.to_string(),
    })
}

fn expect_success(response: Response) -> Result<(), StoreError> {
    let status = response.status();
    if !status.is_success() {
        return Err(http_status_error(status, response));
    }
    Ok(())
}

fn http_status_error(status: StatusCode, response: Response) -> StoreError {
    let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
    StoreError::HttpStatus {
        code: status.as_u16(),
        message,
    }
}

fn integer_value(value: impl ToString) -> Value {
    json!({ "integerValue": value.to_string() })
}

fn string_value(value: &str) -> Value {
    json!({ "stringValue": value })
}

fn encode_snapshot_fields(snapshot: &MetricSnapshot) -> Value {
    json!({
        "views": integer_value(snapshot.views),
        "subscribers": integer_value(snapshot.subscribers),
    })
}

fn encode_mint_record_fields(record: &MintRecord) -> Result<Value, StoreError> {
    Ok(json!({
        "timestamp": { "timestampValue": format_rfc3339_millis(record.timestamp_unix_ms)? },
        "entityId": string_value(record.entity_id.as_str()),
        "to": string_value(record.recipient.as_str()),
        "minted": integer_value(record.reward_amount),
        "deltaViews": integer_value(record.delta_views),
        "deltaSubs": integer_value(record.delta_subscribers),
        "prev": { "mapValue": { "fields": encode_snapshot_fields(&record.previous) } },
        "curr": { "mapValue": { "fields": encode_snapshot_fields(&record.current) } },
        "txHash": string_value(record.receipt_id.as_str()),
        "idempotencyKey": string_value(record.idempotency_key.as_str()),
    }))
}

/// The pending mint is kept whole in `payload`; `mintId` is duplicated for the console.
fn encode_pending_fields(pending: &PendingMintRecord) -> Result<Value, StoreError> {
    let payload = serde_json::to_string(pending).map_err(|err| StoreError::Encode {
        message: err.to_string(),
    })?;
    Ok(json!({
        "mintId": string_value(pending.mint_id.as_deref().unwrap_or("")),
        "payload": string_value(payload.as_str()),
    }))
}

fn decode_pending_document(document: &Value) -> Result<PendingMintRecord, String> {
    let payload = document
        .get("fields")
        .and_then(|fields| fields.get("payload"))
        .and_then(|field| field.get("stringValue"))
        .and_then(Value::as_str)
        .ok_or_else(|| "pending document has no payload".to_string())?;
    serde_json::from_str(payload).map_err(|err| err.to_string())
}

fn decode_snapshot_document(document: &Value) -> Result<MetricSnapshot, String> {
    let fields = document
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| "document has no fields".to_string())?;
    Ok(MetricSnapshot {
        views: decode_counter(fields, "views")?,
        subscribers: decode_counter(fields, "subscribers")?,
    })
}

fn decode_counter(fields: &Map<String, Value>, name: &str) -> Result<u64, String> {
    let field = fields
        .get(name)
        .ok_or_else(|| format!("missing field {name}"))?;
    if let Some(raw) = field.get("integerValue") {
        let parsed = match raw {
            Value::String(text) => text.parse::<u64>().ok(),
            Value::Number(number) => number.as_u64(),
            _ => None,
        };
        return parsed.ok_or_else(|| format!("field {name} is not a non-negative integer"));
    }
    if let Some(raw) = field.get("doubleValue").and_then(Value::as_f64) {
        if raw >= 0.0 && raw.fract() == 0.0 && raw <= u64::MAX as f64 {
            return Ok(raw as u64);
        }
        return Err(format!("field {name} is not a whole non-negative number"));
    }
    Err(format!("field {name} has unsupported value type"))
}

fn format_rfc3339_millis(unix_ms: i64) -> Result<String, StoreError> {
    DateTime::from_timestamp_millis(unix_ms)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| StoreError::Encode {
            message: format!("timestamp out of range: {unix_ms}"),
        })
}
