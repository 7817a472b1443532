use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reward_oracle_store::{
    EntityKey, FirestoreConfig, FirestoreCredentials, DEFAULT_FIRESTORE_BASE_URL,
};

use crate::evm_ledger::EvmLedgerConfig;
use crate::ledger_gateway::{
    LedgerGatewayConfig, DEFAULT_CONFIRM_POLL_MS, DEFAULT_CONFIRM_TIMEOUT_MS,
};
use crate::metric_source::{YouTubeConfig, DEFAULT_YOUTUBE_BASE_URL};
use crate::reconciler::{ReconcilerConfig, DEFAULT_PROVENANCE_TAG};
use crate::reward::{
    RewardPolicy, DEFAULT_SUBSCRIBER_REWARD, DEFAULT_SUBSCRIBER_UNIT, DEFAULT_VIEW_REWARD,
    DEFAULT_VIEW_UNIT,
};

pub const ENV_ENTITY_ID: &str = "REWARD_ORACLE_ENTITY_ID";
pub const ENV_RECIPIENT: &str = "REWARD_ORACLE_RECIPIENT";
pub const ENV_PROVENANCE_TAG: &str = "REWARD_ORACLE_PROVENANCE_TAG";
pub const ENV_YOUTUBE_API_KEY: &str = "REWARD_ORACLE_YOUTUBE_API_KEY";
pub const ENV_YOUTUBE_BASE_URL: &str = "REWARD_ORACLE_YOUTUBE_BASE_URL";
pub const ENV_RPC_URL: &str = "REWARD_ORACLE_RPC_URL";
pub const ENV_SIGNING_KEY: &str = "REWARD_ORACLE_SIGNING_KEY";
pub const ENV_PRIVATE_KEY: &str = "REWARD_ORACLE_PRIVATE_KEY";
pub const ENV_CONTRACT_ADDRESS: &str = "REWARD_ORACLE_CONTRACT_ADDRESS";
pub const ENV_LEDGER: &str = "REWARD_ORACLE_LEDGER";
pub const ENV_CHAIN_ID: &str = "REWARD_ORACLE_CHAIN_ID";
pub const ENV_GAS_LIMIT: &str = "REWARD_ORACLE_GAS_LIMIT";
/// Unprefixed names read when the prefixed key is absent, as deployed validators set them.
pub const ENV_LEGACY_RPC_URL: &str = "RPC_URL";
pub const ENV_LEGACY_PRIVATE_KEY: &str = "PRIVATE_KEY";
pub const ENV_LEGACY_CONTRACT_ADDRESS: &str = "CONTRACT_ADDRESS";
pub const ENV_SUBSCRIBER_UNIT: &str = "REWARD_ORACLE_SUBSCRIBER_UNIT";
pub const ENV_SUBSCRIBER_REWARD: &str = "REWARD_ORACLE_SUBSCRIBER_REWARD";
pub const ENV_VIEW_UNIT: &str = "REWARD_ORACLE_VIEW_UNIT";
pub const ENV_VIEW_REWARD: &str = "REWARD_ORACLE_VIEW_REWARD";
pub const ENV_INTERVAL_SECS: &str = "REWARD_ORACLE_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT_MS: &str = "REWARD_ORACLE_HTTP_TIMEOUT_MS";
pub const ENV_CONFIRM_TIMEOUT_MS: &str = "REWARD_ORACLE_CONFIRM_TIMEOUT_MS";
pub const ENV_CONFIRM_POLL_MS: &str = "REWARD_ORACLE_CONFIRM_POLL_MS";
pub const ENV_STORE: &str = "REWARD_ORACLE_STORE";
pub const ENV_STORE_DIR: &str = "REWARD_ORACLE_STORE_DIR";
pub const ENV_FIRESTORE_PROJECT: &str = "REWARD_ORACLE_FIRESTORE_PROJECT";
pub const ENV_FIRESTORE_ACCESS_TOKEN: &str = "REWARD_ORACLE_FIRESTORE_ACCESS_TOKEN";
pub const ENV_FIRESTORE_COLLECTION: &str = "REWARD_ORACLE_FIRESTORE_COLLECTION";
pub const ENV_FIRESTORE_BASE_URL: &str = "REWARD_ORACLE_FIRESTORE_BASE_URL";
pub const ENV_GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const ENV_HOME: &str = "HOME";
const GCLOUD_ADC_RELATIVE_PATH: &str = ".config/gcloud/application_default_credentials.json";
pub const ENV_HEALTH_BIND: &str = "REWARD_ORACLE_HEALTH_BIND";

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STORE_DIR: &str = "output/reward-oracle";
pub const DEFAULT_FIRESTORE_COLLECTION: &str = "youtubeValidators";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackendConfig {
    File { root: PathBuf },
    Firestore(FirestoreConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackendConfig {
    /// Signs contract transactions locally and sends them to an Ethereum RPC node.
    Evm(EvmLedgerConfig),
    /// Hands signed mint requests to a mint gateway.
    Gateway(LedgerGatewayConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    pub entity_id: String,
    pub recipient: String,
    pub provenance_tag: String,
    pub policy: RewardPolicy,
    pub interval: Duration,
    pub youtube: YouTubeConfig,
    pub ledger: LedgerBackendConfig,
    pub store: StoreBackendConfig,
    pub health_bind: Option<String>,
}

impl OracleConfig {
    /// Reads `path` when it exists and the environment alone otherwise.
    pub fn load(path: &Path) -> Result<Self, OracleConfigError> {
        if path.exists() {
            return Self::from_config_file(path);
        }
        Self::from_env()
    }

    /// Reads top-level keys named like the environment variables; keys absent from the
    /// file fall back to the process environment.
    pub fn from_config_file(path: &Path) -> Result<Self, OracleConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| OracleConfigError::ReadConfigFile {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let value: toml::Value =
            toml::from_str(&content).map_err(|err| OracleConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let table = value
            .as_table()
            .ok_or_else(|| OracleConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: "root is not a TOML table".to_string(),
            })?;

        Self::from_env_with(|key| {
            table
                .get(key)
                .and_then(toml_value_to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_env() -> Result<Self, OracleConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_env_with<F>(mut getter: F) -> Result<Self, OracleConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let entity_id = required_env(&mut getter, ENV_ENTITY_ID)?;
        EntityKey::new(entity_id.as_str()).map_err(|_| OracleConfigError::EmptyEnv {
            key: ENV_ENTITY_ID,
        })?;
        let recipient = required_env(&mut getter, ENV_RECIPIENT)?;
        let provenance_tag = optional_env(&mut getter, ENV_PROVENANCE_TAG)
            .unwrap_or_else(|| DEFAULT_PROVENANCE_TAG.to_string());

        let policy = RewardPolicy {
            subscriber_unit: positive_u64(&mut getter, ENV_SUBSCRIBER_UNIT, DEFAULT_SUBSCRIBER_UNIT)?,
            subscriber_reward: any_u64(&mut getter, ENV_SUBSCRIBER_REWARD, DEFAULT_SUBSCRIBER_REWARD)?,
            view_unit: positive_u64(&mut getter, ENV_VIEW_UNIT, DEFAULT_VIEW_UNIT)?,
            view_reward: any_u64(&mut getter, ENV_VIEW_REWARD, DEFAULT_VIEW_REWARD)?,
        };
        let interval_secs = positive_u64(&mut getter, ENV_INTERVAL_SECS, DEFAULT_INTERVAL_SECS)?;
        let timeout_ms = positive_u64(&mut getter, ENV_HTTP_TIMEOUT_MS, DEFAULT_HTTP_TIMEOUT_MS)?;

        let youtube = YouTubeConfig {
            base_url: optional_env(&mut getter, ENV_YOUTUBE_BASE_URL)
                .unwrap_or_else(|| DEFAULT_YOUTUBE_BASE_URL.to_string()),
            api_key: required_env(&mut getter, ENV_YOUTUBE_API_KEY)?,
            timeout_ms,
        };

        let confirm_timeout_ms =
            positive_u64(&mut getter, ENV_CONFIRM_TIMEOUT_MS, DEFAULT_CONFIRM_TIMEOUT_MS)?;
        let confirm_poll_ms =
            positive_u64(&mut getter, ENV_CONFIRM_POLL_MS, DEFAULT_CONFIRM_POLL_MS)?;
        let ledger_backend =
            optional_env(&mut getter, ENV_LEDGER).unwrap_or_else(|| "evm".to_string());
        let ledger = match ledger_backend.trim().to_ascii_lowercase().as_str() {
            "evm" => LedgerBackendConfig::Evm(EvmLedgerConfig {
                rpc_url: required_env_or_legacy(&mut getter, ENV_RPC_URL, ENV_LEGACY_RPC_URL)?,
                contract_address: required_env_or_legacy(
                    &mut getter,
                    ENV_CONTRACT_ADDRESS,
                    ENV_LEGACY_CONTRACT_ADDRESS,
                )?,
                private_key_hex: required_env_or_legacy(
                    &mut getter,
                    ENV_PRIVATE_KEY,
                    ENV_LEGACY_PRIVATE_KEY,
                )?,
                chain_id: optional_positive_u64(&mut getter, ENV_CHAIN_ID)?,
                gas_limit: optional_positive_u64(&mut getter, ENV_GAS_LIMIT)?,
                timeout_ms,
                confirm_timeout_ms,
                confirm_poll_ms,
            }),
            "gateway" => LedgerBackendConfig::Gateway(LedgerGatewayConfig {
                rpc_url: required_env_or_legacy(&mut getter, ENV_RPC_URL, ENV_LEGACY_RPC_URL)?,
                contract_address: required_env_or_legacy(
                    &mut getter,
                    ENV_CONTRACT_ADDRESS,
                    ENV_LEGACY_CONTRACT_ADDRESS,
                )?,
                signing_key_hex: required_env(&mut getter, ENV_SIGNING_KEY)?,
                timeout_ms,
                confirm_timeout_ms,
                confirm_poll_ms,
            }),
            _ => {
                return Err(OracleConfigError::UnknownLedgerBackend {
                    value: ledger_backend,
                })
            }
        };

        let backend = optional_env(&mut getter, ENV_STORE).unwrap_or_else(|| "file".to_string());
        let store = match backend.trim().to_ascii_lowercase().as_str() {
            "file" => StoreBackendConfig::File {
                root: optional_env(&mut getter, ENV_STORE_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
            },
            "firestore" => StoreBackendConfig::Firestore(FirestoreConfig {
                base_url: optional_env(&mut getter, ENV_FIRESTORE_BASE_URL)
                    .unwrap_or_else(|| DEFAULT_FIRESTORE_BASE_URL.to_string()),
                project_id: required_env(&mut getter, ENV_FIRESTORE_PROJECT)?,
                collection: optional_env(&mut getter, ENV_FIRESTORE_COLLECTION)
                    .unwrap_or_else(|| DEFAULT_FIRESTORE_COLLECTION.to_string()),
                credentials: firestore_credentials(&mut getter)?,
                timeout_ms,
            }),
            _ => return Err(OracleConfigError::UnknownStoreBackend { value: backend }),
        };

        Ok(Self {
            entity_id: entity_id.trim().to_string(),
            recipient,
            provenance_tag,
            policy,
            interval: Duration::from_secs(interval_secs),
            youtube,
            ledger,
            store,
            health_bind: optional_env(&mut getter, ENV_HEALTH_BIND),
        })
    }

    pub fn entity_key(&self) -> Result<EntityKey, OracleConfigError> {
        EntityKey::new(self.entity_id.as_str())
            .map_err(|_| OracleConfigError::EmptyEnv { key: ENV_ENTITY_ID })
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::new(self.recipient.clone())
            .with_provenance_tag(self.provenance_tag.clone())
            .with_policy(self.policy)
    }
}

/// An explicit access token wins, then an application default credentials file, then
/// the metadata server of the instance the oracle runs on.
fn firestore_credentials<F>(getter: &mut F) -> Result<FirestoreCredentials, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(access_token) = optional_env(getter, ENV_FIRESTORE_ACCESS_TOKEN) {
        return Ok(FirestoreCredentials::Static { access_token });
    }
    let credentials_file = optional_env(getter, ENV_GOOGLE_APPLICATION_CREDENTIALS)
        .map(PathBuf::from)
        .or_else(|| {
            optional_env(getter, ENV_HOME)
                .map(|home| Path::new(home.as_str()).join(GCLOUD_ADC_RELATIVE_PATH))
                .filter(|path| path.is_file())
        });
    match credentials_file {
        Some(path) => FirestoreCredentials::from_credentials_file(&path).map_err(|err| {
            OracleConfigError::Credentials {
                path: path.display().to_string(),
                message: err.to_string(),
            }
        }),
        None => Ok(FirestoreCredentials::metadata_server()),
    }
}

fn toml_value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(value) => Some(value.clone()),
        toml::Value::Integer(value) => Some(value.to_string()),
        toml::Value::Float(value) => Some(value.to_string()),
        toml::Value::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn required_env<F>(getter: &mut F, key: &'static str) -> Result<String, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = getter(key).ok_or(OracleConfigError::MissingEnv { key })?;
    if value.trim().is_empty() {
        return Err(OracleConfigError::EmptyEnv { key });
    }
    Ok(value.trim().to_string())
}

fn required_env_or_legacy<F>(
    getter: &mut F,
    key: &'static str,
    legacy_key: &'static str,
) -> Result<String, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match optional_env(getter, key) {
        Some(value) => Ok(value),
        None => required_env(getter, legacy_key).map_err(|err| match err {
            OracleConfigError::MissingEnv { .. } => OracleConfigError::MissingEnv { key },
            other => other,
        }),
    }
}

fn optional_env<F>(getter: &mut F, key: &str) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    getter(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_u64<F>(getter: &mut F, key: &'static str, default: u64) -> Result<u64, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match optional_env(getter, key) {
        Some(value) => value
            .parse::<u64>()
            .ok()
            .filter(|parsed| *parsed > 0)
            .ok_or(OracleConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn optional_positive_u64<F>(
    getter: &mut F,
    key: &'static str,
) -> Result<Option<u64>, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_env(getter, key)
        .map(|value| {
            value
                .parse::<u64>()
                .ok()
                .filter(|parsed| *parsed > 0)
                .ok_or(OracleConfigError::InvalidValue { key, value })
        })
        .transpose()
}

fn any_u64<F>(getter: &mut F, key: &'static str, default: u64) -> Result<u64, OracleConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    match optional_env(getter, key) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| OracleConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleConfigError {
    MissingEnv { key: &'static str },
    EmptyEnv { key: &'static str },
    InvalidValue { key: &'static str, value: String },
    UnknownStoreBackend { value: String },
    UnknownLedgerBackend { value: String },
    Credentials { path: String, message: String },
    ReadConfigFile { path: String, message: String },
    ParseConfigFile { path: String, message: String },
}

impl fmt::Display for OracleConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleConfigError::MissingEnv { key } => write!(f, "missing config value: {key}"),
            OracleConfigError::EmptyEnv { key } => write!(f, "empty config value: {key}"),
            OracleConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
            OracleConfigError::UnknownStoreBackend { value } => {
                write!(f, "unknown store backend {value:?}; expected file or firestore")
            }
            OracleConfigError::UnknownLedgerBackend { value } => {
                write!(f, "unknown ledger backend {value:?}; expected evm or gateway")
            }
            OracleConfigError::Credentials { path, message } => {
                write!(f, "load credentials failed ({path}): {message}")
            }
            OracleConfigError::ReadConfigFile { path, message } => {
                write!(f, "read config file failed ({path}): {message}")
            }
            OracleConfigError::ParseConfigFile { path, message } => {
                write!(f, "parse config file failed ({path}): {message}")
            }
        }
    }
}

impl Error for OracleConfigError {}
