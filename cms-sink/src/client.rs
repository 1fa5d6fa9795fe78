//! HTTP client bound to a single CMS endpoint.

use std::time::Duration;

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CmsError;
use crate::signer::sign_body;

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Connection settings for the CMS endpoint
#[derive(Debug, Clone)]
pub struct CmsConfig {
    /// Endpoint events are POSTed to
    pub endpoint: Url,

    /// Shared HMAC key
    pub hmac_key: SecretString,

    /// Per-request timeout enforced by the HTTP client
    /// Default: 10 seconds
    pub request_timeout: Duration,
}

impl CmsConfig {
    /// Create a config, validating that the endpoint is an http(s) URL
    pub fn new(endpoint: &str, hmac_key: impl Into<String>) -> Result<Self, CmsError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| CmsError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(CmsError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(Self {
            endpoint,
            hmac_key: SecretString::from(hmac_key.into()),
            request_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Signs and POSTs encoded event bodies to the CMS
#[derive(Debug, Clone)]
pub struct CmsClient {
    http: reqwest::Client,
    config: CmsConfig,
}

impl CmsClient {
    /// Build a client for the given endpoint
    pub fn new(config: CmsConfig) -> Result<Self, CmsError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CmsError::Client(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// The configured endpoint
    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    /// POST one JSON body to the CMS.
    ///
    /// Succeeds only on a 2xx response. The body of a failed response is
    /// captured in [`CmsError::Status`].
    pub async fn forward(&self, body: Bytes) -> Result<(), CmsError> {
        let signature = sign_body(self.config.hmac_key.expose_secret().as_bytes(), &body)?;

        let response = self
            .http
            .post(self.config.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::trace!(status = status.as_u16(), "CMS accepted event");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(CmsError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_non_http_scheme() {
        let result = CmsConfig::new("ftp://cms.local/events", "key");
        assert!(matches!(result, Err(CmsError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_config_rejects_garbage() {
        assert!(CmsConfig::new("not a url", "key").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = CmsConfig::new("https://cms.local/events", "key").unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.endpoint.host_str(), Some("cms.local"));

        let config = config.with_request_timeout(Duration::from_millis(250));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let config = CmsConfig::new("https://cms.local/events", "super-secret").unwrap();
        assert!(!format!("{:?}", config).contains("super-secret"));
    }
}
