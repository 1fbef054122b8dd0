//! HMAC-SHA256 signing and verification for the Webhook Gateway.
//!
//! The Webhook Gateway *receives* signed requests from an external issue
//! tracker and from its own worker processes. `sign` exists for
//! completeness (the gateway also forwards signed notifications to
//! downstream listeners) but `verify` is the security-relevant half:
//! HMAC-SHA256 over the raw body, a hex-encoded `sha256=<hex>` header
//! format, and a constant-time comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The header name both webhook endpoints expect the signature under.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("secret key is empty")]
    EmptySecret,
    #[error("signature header is malformed: {0}")]
    Malformed(String),
    #[error("signature does not match")]
    Mismatch,
}

/// Compute the `sha256=<hex>` signature for a raw request body under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    Ok(format!("sha256={}", hex::encode(digest)))
}

/// Verify a `sha256=<hex>`-formatted signature header against the raw body,
/// using a constant-time comparison so response timing does not leak how
/// many leading bytes matched.
pub fn verify(secret: &str, body: &[u8], header_value: &str) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let hex_part = header_value
        .strip_prefix("sha256=")
        .ok_or_else(|| SignatureError::Malformed(header_value.to_string()))?;

    let given = hex::decode(hex_part)
        .map_err(|e| SignatureError::Malformed(format!("invalid hex: {e}")))?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.len() != given.len() || expected.ct_eq(&given).unwrap_u8() != 1 {
        return Err(SignatureError::Mismatch);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let secret = "topsecret";
        let body = br#"{"issue_id":123}"#;
        let sig = sign(secret, body).unwrap();
        assert!(sig.starts_with("sha256="));
        verify(secret, body, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let secret = "topsecret";
        let sig = sign(secret, b"original").unwrap();
        let err = verify(secret, b"tampered", &sig).unwrap_err();
        assert!(matches!(err, SignatureError::Mismatch));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let body = b"payload";
        let sig = sign("secret-a", body).unwrap();
        let err = verify("secret-b", body, &sig).unwrap_err();
        assert!(matches!(err, SignatureError::Mismatch));
    }

    #[test]
    fn verify_rejects_malformed_header() {
        let err = verify("secret", b"payload", "not-a-signature").unwrap_err();
        assert!(matches!(err, SignatureError::Malformed(_)));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        let err = verify("secret", b"payload", "sha256=not-hex!!").unwrap_err();
        assert!(matches!(err, SignatureError::Malformed(_)));
    }

    #[test]
    fn sign_rejects_empty_secret() {
        assert!(matches!(sign("", b"x"), Err(SignatureError::EmptySecret)));
    }

    #[test]
    fn signature_is_real_hmac_not_naive_concatenation() {
        // Guards against regressing to SHA256(payload || secret), which is
        // length-extension vulnerable and not what HMAC computes.
        use sha2::Digest;
        let secret = "s";
        let body = b"b";
        let naive = {
            let mut hasher = Sha256::new();
            hasher.update(body);
            hasher.update(secret.as_bytes());
            hex::encode(hasher.finalize())
        };
        let real = sign(secret, body).unwrap();
        assert_ne!(real, format!("sha256={naive}"));
    }
}
