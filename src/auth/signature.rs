//! HMAC-SHA256 signatures over subscriber identities.
//!
//! The Dispatch Worker vouches for the subscriber a callback acts for by
//! signing its `pe_id` with a secret shared with the Callback Handler. The
//! signature travels in the `x-notify-signature` header as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::SubscriberId;

type HmacSha256 = Hmac<Sha256>;

/// Parses a signature header (e.g., "sha256=abc123...") into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex, etc.).
/// Never panics.
///
/// # Examples
///
/// ```
/// use notify_digest::auth::parse_signature_header;
///
/// assert!(parse_signature_header("sha256=abcd1234").is_some());
/// assert!(parse_signature_header("abcd1234").is_none());
/// assert!(parse_signature_header("sha1=abcd1234").is_none());
/// assert!(parse_signature_header("sha256=xyz").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 signature of a payload using the given secret.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value: "sha256=<hex>".
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a signature header against the payload and secret.
///
/// Uses constant-time comparison.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected_signature) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected_signature).is_ok()
}

/// Signs and verifies subscriber identities with one shared secret.
#[derive(Clone)]
pub struct IdentitySigner {
    secret: Vec<u8>,
}

impl IdentitySigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        IdentitySigner {
            secret: secret.into(),
        }
    }

    /// Returns the signature header value for `subscriber`.
    pub fn sign(&self, subscriber: SubscriberId) -> String {
        let payload = subscriber.to_string();
        format_signature_header(&compute_signature(payload.as_bytes(), &self.secret))
    }

    pub fn verify(&self, subscriber: SubscriberId, signature_header: &str) -> bool {
        verify_signature(
            subscriber.to_string().as_bytes(),
            signature_header,
            &self.secret,
        )
    }
}

impl std::fmt::Debug for IdentitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_signature_header_cases() {
        assert_eq!(
            parse_signature_header("sha256=1234abcd"),
            Some(vec![0x12, 0x34, 0xab, 0xcd])
        );
        assert_eq!(
            parse_signature_header("sha256=ABCD1234"),
            Some(vec![0xab, 0xcd, 0x12, 0x34])
        );
        assert_eq!(parse_signature_header(""), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
        assert_eq!(parse_signature_header("sha256="), Some(vec![]));
    }

    #[test]
    fn malformed_headers_never_verify() {
        let payload = b"42";
        let secret = b"secret";
        for header in ["", "sha256=", "sha256=invalid", "sha1=abc123", "sha256=zzzz"] {
            assert!(!verify_signature(payload, header, secret), "{header}");
        }
    }

    #[test]
    fn signer_roundtrip() {
        let signer = IdentitySigner::new("s3cret");
        let header = signer.sign(SubscriberId(42));
        assert!(header.starts_with("sha256="));
        assert!(signer.verify(SubscriberId(42), &header));
        assert!(!signer.verify(SubscriberId(43), &header));
        assert!(!IdentitySigner::new("other").verify(SubscriberId(42), &header));
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", IdentitySigner::new("s3cret"));
        assert!(!rendered.contains("s3cret"));
    }

    proptest! {
        #[test]
        fn prop_sign_verify_roundtrip(payload: Vec<u8>, secret: Vec<u8>) {
            let header = format_signature_header(&compute_signature(&payload, &secret));
            prop_assert!(verify_signature(&payload, &header, &secret));
        }

        #[test]
        fn prop_wrong_identity_fails(a: u64, b: u64, secret: Vec<u8>) {
            prop_assume!(a != b);
            let signer = IdentitySigner::new(secret);
            let header = signer.sign(SubscriberId(a));
            prop_assert!(!signer.verify(SubscriberId(b), &header));
        }

        #[test]
        fn prop_malformed_header_no_panic(header: String, payload: Vec<u8>, secret: Vec<u8>) {
            let _ = parse_signature_header(&header);
            let _ = verify_signature(&payload, &header, &secret);
        }
    }
}
