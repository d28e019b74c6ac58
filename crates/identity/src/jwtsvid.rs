//! JWT-SVID minting.
//!
//! Produces compact ES256 tokens with a fixed claim set (`sub`, `exp`, `aud`,
//! `iat`) and the signing key's identifier in the `kid` header. The signer
//! is any `signature::Signer` over P-256 ECDSA signatures, so the key can sit
//! in memory, behind an HSM, or in a test double.

use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use trustforge_core::clock;

use crate::claims::{encode_segment, AudienceClaim};
use crate::error::{SignError, SignResult};
use crate::spiffe_id::{self, ValidationMode};

pub const ALGORITHM: &str = "ES256";
pub const KEY_ID_HEADER: &str = "kid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvidHeader {
    pub alg: String,
    pub kid: String,
    pub typ: String,
}

/// Claim set of a JWT-SVID. Keys serialize in lexical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvidClaims {
    pub aud: AudienceClaim,
    pub exp: i64,
    pub iat: i64,
    pub sub: String,
}

fn prune_empty_values(values: &[String]) -> Vec<String> {
    values.iter().filter(|v| !v.is_empty()).cloned().collect()
}

/// Sign a JWT-SVID for `spiffe_id`.
///
/// Empty audience entries are dropped before the audience is checked. The
/// returned token is `<header>.<claims>.<r||s>`, each segment unpadded
/// base64url.
pub fn sign_token<S>(
    spiffe_id: &str,
    audience: &[String],
    expires_at: SystemTime,
    signer: &S,
    kid: &str,
) -> SignResult<String>
where
    S: signature::Signer<Signature>,
{
    spiffe_id::validate(spiffe_id, &ValidationMode::AnyTrustDomainWorkload)?;

    let audience = prune_empty_values(audience);

    if expires_at <= UNIX_EPOCH {
        return Err(SignError::MissingExpiration);
    }
    if audience.is_empty() {
        return Err(SignError::EmptyAudience);
    }
    if kid.is_empty() {
        return Err(SignError::MissingKeyId);
    }

    let header = SvidHeader {
        alg: ALGORITHM.to_string(),
        kid: kid.to_string(),
        typ: "JWT".to_string(),
    };
    let claims = SvidClaims {
        aud: AudienceClaim::from_values(audience),
        exp: clock::unix_seconds(expires_at),
        iat: clock::now_unix(),
        sub: spiffe_id.to_string(),
    };

    let signing_input = format!(
        "{}.{}",
        encode_segment(&serde_json::to_vec(&header)?),
        encode_segment(&serde_json::to_vec(&claims)?)
    );
    let signature: Signature = signer
        .try_sign(signing_input.as_bytes())
        .map_err(|e| SignError::Signing(e.to_string()))?;

    debug!(spiffe_id = %spiffe_id, kid = %kid, exp = claims.exp, "JWT-SVID signed");

    Ok(format!(
        "{signing_input}.{}",
        encode_segment(&signature.to_bytes())
    ))
}

/// Stable key identifier: hex of the first 16 bytes of BLAKE3 over the
/// uncompressed SEC1 public key.
pub fn key_id(verifying_key: &VerifyingKey) -> String {
    let hash = blake3::hash(verifying_key.to_encoded_point(false).as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}
