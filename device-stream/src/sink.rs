//! Downstream event sink.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use cms_sink::CmsClient;

use crate::error::SinkError;
use crate::types::{Event, EventKind};

/// Receives normalized events from the consumer workers.
///
/// Delivery is at-most-once: a failed forward is logged and dropped by the
/// caller, never retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn forward(&self, event: &Event) -> Result<(), SinkError>;
}

/// JSON body posted to the CMS for one event
#[derive(Debug, Clone, Serialize)]
pub struct CmsEnvelope {
    pub id: Uuid,
    pub device_handle: u64,
    pub kind: EventKind,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<i64>,
    pub payload_base64: String,
}

impl From<&Event> for CmsEnvelope {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            device_handle: event.handle.as_u64(),
            kind: event.kind,
            sequence: event.sequence,
            received_at: event.received_at,
            command: event.command,
            payload_base64: BASE64.encode(&event.payload),
        }
    }
}

impl CmsEnvelope {
    pub fn to_json(&self) -> Result<Bytes, SinkError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SinkError::Encoding(e.to_string()))
    }
}

/// [`EventSink`] that signs and POSTs events to the CMS
#[derive(Debug, Clone)]
pub struct CmsEventSink {
    client: CmsClient,
}

impl CmsEventSink {
    pub fn new(client: CmsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for CmsEventSink {
    async fn forward(&self, event: &Event) -> Result<(), SinkError> {
        let body = CmsEnvelope::from(event).to_json()?;
        self.client.forward(body).await?;
        Ok(())
    }
}
