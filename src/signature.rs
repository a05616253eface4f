use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Validate an `x-hub-signature-256` header against the raw request body.
/// The header carries `sha256=<hex>`; comparison happens inside
/// `Mac::verify_slice`, which is constant-time and rejects a length mismatch
/// before comparing.
pub fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Signature checking is opportunistic: without a configured secret or a
/// presented header the caller skips verification entirely.
pub fn signing_applies(secret: &str, signature_header: Option<&str>) -> bool {
    !secret.trim().is_empty() && signature_header.map(|h| !h.trim().is_empty()).unwrap_or(false)
}
