//! Error types for the CMS forwarder

use thiserror::Error;

/// Errors that can occur while forwarding to the CMS
#[derive(Debug, Error)]
pub enum CmsError {
    /// The endpoint URL could not be parsed or is not http(s)
    #[error("Invalid CMS endpoint: {0}")]
    InvalidEndpoint(String),

    /// The HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(String),

    /// Network or transport failure before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout
    #[error("CMS request timed out")]
    Timeout,

    /// The CMS answered with a non-success status
    #[error("CMS returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The request body could not be signed
    #[error("Signing error: {0}")]
    Signing(String),
}

impl From<reqwest::Error> for CmsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CmsError::Timeout
        } else {
            CmsError::Network(err.to_string())
        }
    }
}
