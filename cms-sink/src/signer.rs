//! Request body signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CmsError;

type HmacSha256 = Hmac<Sha256>;

/// Compute the lowercase hex HMAC-SHA256 of `body` under `key`.
///
/// The CMS verifies this value against the `x-signature` header.
pub fn sign_body(key: &[u8], body: &[u8]) -> Result<String, CmsError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| CmsError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
