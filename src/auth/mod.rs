//! Authentication of callback callers.
//!
//! The Callback Handler only needs to know which subscriber a request acts
//! for. An [`Authenticator`] maps request headers to that identity, or to
//! `None` when the caller is not authenticated.

use axum::http::HeaderMap;

pub mod signature;

pub use signature::{
    IdentitySigner, compute_signature, format_signature_header, parse_signature_header,
    verify_signature,
};

use crate::types::SubscriberId;

/// Header carrying the subscriber id the caller acts for.
pub const SUBSCRIBER_HEADER: &str = "x-notify-subscriber";

/// Header carrying the HMAC signature of [`SUBSCRIBER_HEADER`].
pub const SIGNATURE_HEADER: &str = "x-notify-signature";

/// Resolves the authenticated identity of a request.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<SubscriberId>;
}

/// Trusts a subscriber header only when it carries a valid signature.
#[derive(Debug, Clone)]
pub struct SignedIdentity {
    signer: IdentitySigner,
}

impl SignedIdentity {
    pub fn new(signer: IdentitySigner) -> Self {
        SignedIdentity { signer }
    }

    /// Headers that authenticate a request as `subscriber`.
    pub fn headers_for(&self, subscriber: SubscriberId) -> [(&'static str, String); 2] {
        [
            (SUBSCRIBER_HEADER, subscriber.to_string()),
            (SIGNATURE_HEADER, self.signer.sign(subscriber)),
        ]
    }
}

impl Authenticator for SignedIdentity {
    fn authenticate(&self, headers: &HeaderMap) -> Option<SubscriberId> {
        let subscriber: SubscriberId = headers
            .get(SUBSCRIBER_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let signature = headers.get(SIGNATURE_HEADER)?.to_str().ok()?;
        self.signer
            .verify(subscriber, signature)
            .then_some(subscriber)
    }
}
