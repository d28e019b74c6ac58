//! Structural parsing of compact JWS tokens and PSAT claim extraction.
//!
//! Nothing here verifies a signature. The projected service account token is
//! verified by the server-side attestor against the cluster's token review
//! API; the agent only needs the pod UID to predict its own identity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{AttestorError, AttestorResult};

/// Protected header of a compact JWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// A compact JWS split into its decoded parts.
#[derive(Debug, Clone)]
pub struct CompactJws {
    pub header: JwsHeader,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    /// `<header>.<payload>` exactly as received; the bytes the signature covers.
    pub signing_input: String,
}

impl CompactJws {
    /// Decode the payload into `T` without verifying the signature.
    pub fn claims_unverified<T: DeserializeOwned>(&self) -> AttestorResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| AttestorError::ClaimDecode(e.to_string()))
    }
}

/// The `aud` claim: a bare string for a single audience, an array otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudienceClaim {
    Single(String),
    Multiple(Vec<String>),
}

impl AudienceClaim {
    pub fn from_values(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            AudienceClaim::Single(values.remove(0))
        } else {
            AudienceClaim::Multiple(values)
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            AudienceClaim::Single(value) => vec![value.as_str()],
            AudienceClaim::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

/// The `kubernetes.io` private claim of a projected service account token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sClaims {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub namespace: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pod: ObjectRef,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        rename = "serviceaccount"
    )]
    pub service_account: ObjectRef,
}

// `null` reads as the zero value, same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Claim set of a projected service account token (PSAT).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsatClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<AudienceClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, rename = "kubernetes.io", skip_serializing_if = "Option::is_none")]
    pub k8s: Option<K8sClaims>,
}

impl PsatClaims {
    /// Pod UID, or `""` when the claim is absent.
    pub fn pod_uid(&self) -> &str {
        self.k8s.as_ref().map(|k| k.pod.uid.as_str()).unwrap_or("")
    }
}

fn decode_segment(segment: &str, what: &str) -> AttestorResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AttestorError::Parse(format!("illegal base64 data in {what}: {e}")))
}

/// Split a compact JWS and decode its header, payload and signature.
///
/// Surrounding whitespace (a trailing newline in a mounted token file) is
/// ignored.
pub fn parse_compact(token: &str) -> AttestorResult<CompactJws> {
    let token = token.trim();
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AttestorError::Parse(
            "compact JWS format must have three parts".to_string(),
        ));
    }

    let header_bytes = decode_segment(parts[0], "header")?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| AttestorError::Parse(format!("invalid protected header: {e}")))?;
    if header.alg.is_empty() {
        return Err(AttestorError::Parse(
            "protected header missing alg".to_string(),
        ));
    }

    let payload = decode_segment(parts[1], "payload")?;
    let signature = decode_segment(parts[2], "signature")?;

    Ok(CompactJws {
        header,
        payload,
        signature,
        signing_input: format!("{}.{}", parts[0], parts[1]),
    })
}

/// Extract PSAT claims without verification, requiring a non-empty pod UID.
pub fn parse_unverified(token: &str) -> AttestorResult<PsatClaims> {
    let jws = parse_compact(token)?;
    let claims: PsatClaims = jws.claims_unverified()?;
    if claims.pod_uid().is_empty() {
        return Err(AttestorError::MissingPodUid);
    }
    Ok(claims)
}

/// Encode bytes as an unpadded base64url segment.
pub(crate) fn encode_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}
