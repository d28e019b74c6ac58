//! Node attestation and identity document signing for trustforge.
//!
//! This crate turns a platform-issued, node-bound credential into attestation
//! evidence and a deterministic agent identity, and mints short-lived signed
//! identity documents for registered workloads.
//!
//! # Core Concepts
//!
//! - **SPIFFE ID**: URI identity `spiffe://<trust-domain>/<path>`
//! - **PSAT**: Kubernetes projected service account token bound to the agent pod
//! - **Attestation evidence**: `{cluster, token}` forwarded to the server for verification
//! - **JWT-SVID**: ES256-signed identity document scoped to one or more audiences
//!
//! # Security Model
//!
//! The agent never verifies its own PSAT; the server-side attestor holds the
//! cluster trust material and does that. Token contents and key material are
//! never logged or carried in error messages.

pub mod claims;
pub mod error;
pub mod jwtsvid;
pub mod psat;
pub mod spiffe_id;

pub use claims::{parse_unverified, AudienceClaim, CompactJws, PsatClaims};
pub use error::{AttestorError, SignError, SpiffeIdError};
pub use jwtsvid::{key_id, sign_token, SvidClaims};
pub use psat::{
    AttestationData, AttestationResponse, AttestorPlugin, ConfigureRequest, PsatAttestationData,
    DEFAULT_TOKEN_PATH, PLUGIN_NAME,
};
pub use spiffe_id::{agent_id, parse_agent_id, AgentId, ValidationMode};
