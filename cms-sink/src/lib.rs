//! Generic HTTP forwarder for delivering device events to a CMS.
//!
//! This crate knows nothing about devices, sessions or event kinds. It takes an
//! already-encoded request body, signs it and POSTs it to a single configured
//! endpoint. Device-specific encoding lives in the consuming crate.
//!
//! # Overview
//!
//! - [`CmsClient`]: one `reqwest` client bound to one endpoint.
//! - [`CmsConfig`]: endpoint, signing key and request timeout.
//! - [`sign_body`]: hex HMAC-SHA256 of the body, sent as `x-signature`.
//!
//! # Example
//!
//! ```no_run
//! use cms_sink::{CmsClient, CmsConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cms_sink::CmsError> {
//!     let config = CmsConfig::new("http://cms.local/api/events", "change_me")?;
//!     let client = CmsClient::new(config)?;
//!
//!     client.forward(r#"{"kind":"alarm"}"#.into()).await?;
//!     Ok(())
//! }
//! ```
//!
//! Delivery is single-shot: a failed POST is reported to the caller and never
//! retried here.

mod client;
mod error;
mod signer;

pub use client::{CmsClient, CmsConfig, SIGNATURE_HEADER};
pub use error::CmsError;
pub use signer::sign_body;
