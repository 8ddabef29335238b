//! ExternalSink - HTTP POST of a JSON payload to a third-party endpoint
//!
//! Every request carries `Idempotency-Key: engagement-<id>` so the endpoint
//! can discard duplicates. Status codes map onto the failure taxonomy in
//! [`classify_status`].

use std::time::Duration;

use contracts::{
    ContractError, DeliveryOutcome, EnrichedEvent, EventId, ExternalSinkConfig, SinkKind,
    SinkWriter,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMetadata {
    pub content_title: Option<String>,
    pub content_type: Option<String>,
    pub device: Option<String>,
    pub engagement_seconds: Option<f64>,
    pub engagement_pct: Option<f64>,
    pub raw_payload: Option<serde_json::Value>,
}

/// Body POSTed for each event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPayload {
    pub event_id: EventId,
    pub content_id: String,
    pub user_id: String,
    pub event_type: String,
    /// RFC 3339
    pub timestamp: String,
    pub metadata: ExternalMetadata,
}

impl From<&EnrichedEvent> for ExternalPayload {
    fn from(event: &EnrichedEvent) -> Self {
        Self {
            event_id: event.id,
            content_id: event.content_id.to_string(),
            user_id: event.user_id.to_string(),
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.event_ts.to_rfc3339(),
            metadata: ExternalMetadata {
                content_title: event.content_title.clone(),
                content_type: event.content_type.map(|t| t.to_string()),
                device: event.device.clone(),
                engagement_seconds: event.engagement_seconds,
                engagement_pct: event.engagement_pct,
                raw_payload: event.extra.clone(),
            },
        }
    }
}

/// Map an HTTP status onto a delivery outcome.
///
/// 409 means the endpoint already holds this idempotency key, which counts
/// as delivered.
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    let code = status.as_u16();
    match code {
        _ if status.is_success() => DeliveryOutcome::Delivered,
        409 => DeliveryOutcome::Delivered,
        408 | 425 | 429 => DeliveryOutcome::capacity(format!("endpoint throttled: {status}")),
        _ if status.is_server_error() => {
            DeliveryOutcome::transient(format!("endpoint error: {status}"))
        }
        _ => DeliveryOutcome::permanent(format!("endpoint rejected payload: {status}")),
    }
}

fn classify_transport(error: &reqwest::Error) -> DeliveryOutcome {
    if error.is_builder() {
        DeliveryOutcome::permanent(format!("invalid request: {error}"))
    } else if error.is_timeout() {
        DeliveryOutcome::transient(format!("request timed out: {error}"))
    } else {
        DeliveryOutcome::transient(format!("request failed: {error}"))
    }
}

pub struct ExternalSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl ExternalSink {
    pub fn new(config: &ExternalSinkConfig) -> Result<Self, ContractError> {
        let name = "external".to_string();
        let url = config
            .url
            .clone()
            .ok_or_else(|| ContractError::config_validation("sinks.external.url", "required when enabled"))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ContractError::config_validation("sinks.external.headers", format!("{key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ContractError::config_validation("sinks.external.headers", format!("{key}: {e}")))?;
            headers.insert(header, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| ContractError::SinkConnection {
                sink_name: name.clone(),
                message: e.to_string(),
            })?;

        Ok(Self { name, url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SinkWriter for ExternalSink {
    fn kind(&self) -> SinkKind {
        SinkKind::External
    }

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "external_sink_deliver",
        skip(self, event),
        fields(sink = %self.name, event_id = event.id)
    )]
    async fn deliver(&self, event: &EnrichedEvent) -> DeliveryOutcome {
        let response = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, event.idempotency_key())
            .json(&ExternalPayload::from(event))
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                debug!(%status, "External endpoint responded");
                classify_status(status)
            }
            Err(e) => classify_transport(&e),
        }
    }

    #[instrument(name = "external_sink_flush", skip(self))]
    async fn flush(&self) -> Result<(), ContractError> {
        Ok(())
    }

    #[instrument(name = "external_sink_close", skip(self))]
    async fn close(&self) -> Result<(), ContractError> {
        debug!(sink = %self.name, "ExternalSink closed");
        Ok(())
    }
}
