//! Channel statistics source backed by the YouTube Data API v3.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use reward_oracle_store::{EntityKey, MetricSnapshot};

pub const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const STATISTICS_FIELDS: &str = "items(statistics(viewCount,subscriberCount))";

pub trait MetricSource {
    /// Cumulative counters for `entity` as reported by the provider, unsmoothed.
    fn fetch_snapshot(&self, entity: &EntityKey) -> Result<MetricSnapshot, MetricSourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSourceError {
    BuildClient { message: String },
    Http { message: String },
    HttpStatus { code: u16, message: String },
    DecodeResponse { message: String },
    EntityNotFound { entity: String },
    InvalidCounter { field: &'static str, value: String },
}

impl fmt::Display for MetricSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSourceError::BuildClient { message } => {
                write!(f, "metric client build failed: {message}")
            }
            MetricSourceError::Http { message } => {
                write!(f, "metric request failed: {message}")
            }
            MetricSourceError::HttpStatus { code, message } => {
                write!(f, "metric http status {code}: {message}")
            }
            MetricSourceError::DecodeResponse { message } => {
                write!(f, "decode metric response failed: {message}")
            }
            MetricSourceError::EntityNotFound { entity } => {
                write!(f, "metric source has no statistics for {entity}")
            }
            MetricSourceError::InvalidCounter { field, value } => {
                write!(f, "invalid {field} counter: {value:?}")
            }
        }
    }
}

impl Error for MetricSourceError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YouTubeConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct YouTubeMetricSource {
    base_url: String,
    api_key: String,
    client: Client,
}

impl YouTubeMetricSource {
    pub fn from_config(config: &YouTubeConfig) -> Result<Self, MetricSourceError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|err| MetricSourceError::BuildClient {
                message: err.to_string(),
            })?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    #[serde(default)]
    statistics: Option<ChannelStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    #[serde(default)]
    view_count: Option<String>,
    #[serde(default)]
    subscriber_count: Option<String>,
}

impl MetricSource for YouTubeMetricSource {
    fn fetch_snapshot(&self, entity: &EntityKey) -> Result<MetricSnapshot, MetricSourceError> {
        let url = format!("{}/channels", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("part", "statistics"),
                ("id", entity.as_str()),
                ("fields", STATISTICS_FIELDS),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .map_err(|err| MetricSourceError::Http {
                message: err.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(MetricSourceError::HttpStatus {
                code: status.as_u16(),
                message,
            });
        }

        let body: ChannelListResponse =
            response
                .json()
                .map_err(|err| MetricSourceError::DecodeResponse {
                    message: err.to_string(),
                })?;
        snapshot_from_response(body, entity)
    }
}

fn snapshot_from_response(
    body: ChannelListResponse,
    entity: &EntityKey,
) -> Result<MetricSnapshot, MetricSourceError> {
    let statistics = body
        .items
        .into_iter()
        .next()
        .and_then(|item| item.statistics)
        .ok_or_else(|| MetricSourceError::EntityNotFound {
            entity: entity.to_string(),
        })?;
    Ok(MetricSnapshot {
        views: parse_counter("viewCount", statistics.view_count)?,
        subscribers: parse_counter("subscriberCount", statistics.subscriber_count)?,
    })
}

// Hidden subscriber counts are omitted by the API and read as zero.
fn parse_counter(field: &'static str, raw: Option<String>) -> Result<u64, MetricSourceError> {
    match raw {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| MetricSourceError::InvalidCounter { field, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> ChannelListResponse {
        serde_json::from_str(raw).expect("decode response")
    }

    fn entity() -> EntityKey {
        EntityKey::new("UCchannel").expect("entity")
    }

    #[test]
    fn statistics_counters_are_parsed_from_strings() {
        let body = decode(
            r#"{"items":[{"statistics":{"viewCount":"1020","subscriberCount":"110"}}]}"#,
        );
        assert_eq!(
            snapshot_from_response(body, &entity()).expect("snapshot"),
            MetricSnapshot::new(1020, 110)
        );
    }

    #[test]
    fn missing_channel_is_an_error() {
        let body = decode(r#"{}"#);
        let err = snapshot_from_response(body, &entity()).expect_err("no items");
        assert_eq!(
            err,
            MetricSourceError::EntityNotFound {
                entity: "UCchannel".to_string()
            }
        );
    }

    #[test]
    fn hidden_subscriber_count_reads_as_zero() {
        let body = decode(r#"{"items":[{"statistics":{"viewCount":"55"}}]}"#);
        assert_eq!(
            snapshot_from_response(body, &entity()).expect("snapshot"),
            MetricSnapshot::new(55, 0)
        );
    }

    #[test]
    fn malformed_counter_is_rejected() {
        let body = decode(
            r#"{"items":[{"statistics":{"viewCount":"-3","subscriberCount":"1"}}]}"#,
        );
        let err = snapshot_from_response(body, &entity()).expect_err("negative counter");
        assert!(matches!(
            err,
            MetricSourceError::InvalidCounter {
                field: "viewCount",
                ..
            }
        ));
    }
}
