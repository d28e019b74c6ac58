//! Error types for trustforge identity operations.
//!
//! Attestation and signing failures are terminal for the call that raised
//! them. Messages name the offending path or field but never carry token text
//! or key material.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating or parsing a SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpiffeIdError {
    #[error("could not parse SPIFFE ID: {0}")]
    Parse(String),

    #[error("{id:?} is not a valid {kind}SPIFFE ID: {reason}")]
    Invalid {
        id: String,
        /// Either empty, `"workload "` or `"agent "`; keeps the message readable.
        kind: &'static str,
        reason: String,
    },
}

/// Errors raised by the PSAT node attestor.
#[derive(Debug, Error)]
pub enum AttestorError {
    #[error("k8s-psat: not configured")]
    NotConfigured,

    #[error("k8s-psat: {0}")]
    ConfigValidation(String),

    #[error("k8s-psat: unable to load token from {}: {source}", .path.display())]
    TokenUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("k8s-psat: unable to load token from {}: {:?} is empty", .path.display(), .path)]
    TokenEmpty { path: PathBuf },

    #[error("k8s-psat: error parsing token: {0}")]
    Parse(String),

    #[error("k8s-psat: fail to get claims from token: {0}")]
    ClaimDecode(String),

    #[error("k8s-psat: token claim pod UID is empty")]
    MissingPodUid,

    #[error("k8s-psat: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while minting a JWT-SVID.
#[derive(Debug, Error)]
pub enum SignError {
    #[error(transparent)]
    InvalidIdentity(#[from] SpiffeIdError),

    #[error("audience is required")]
    EmptyAudience,

    #[error("expiration is required")]
    MissingExpiration,

    #[error("kid is required")]
    MissingKeyId,

    #[error("unable to sign token: {0}")]
    Signing(String),

    #[error("unable to encode token: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AttestorResult<T> = Result<T, AttestorError>;
pub type SignResult<T> = Result<T, SignError>;
