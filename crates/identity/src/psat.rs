//! Kubernetes projected service account token (PSAT) node attestor.
//!
//! The agent reads the token mounted into its pod, pulls the pod UID out of
//! the claims, and emits attestation evidence for the server alongside the
//! agent identity it expects to be issued.
//!
//! # Configuration
//!
//! The plugin receives its own section as TOML text plus the global trust
//! domain:
//!
//! ```toml
//! cluster = "production"
//! token_path = "/var/run/secrets/tokens/spire-agent"
//! ```
//!
//! Configuration is held behind a reader/writer lock. Readers take a cheap
//! `Arc` snapshot and release the lock before touching the filesystem, so a
//! reconfigure never waits on a slow token read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use trustforge_core::GlobalConfig;

use crate::claims;
use crate::error::{AttestorError, AttestorResult};
use crate::spiffe_id;

/// Plugin name; also the attestation data type and the agent path segment.
pub const PLUGIN_NAME: &str = "k8s_psat";

/// Where kubelet projects the agent's service account token by default.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/tokens/spire-agent";

/// Options decoded from the plugin's configuration text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttestorConfig {
    /// Cluster name where the agent lives
    #[serde(default)]
    pub cluster: String,
    /// File path of the PSAT
    #[serde(default)]
    pub token_path: String,
}

/// Validated configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestorState {
    pub trust_domain: String,
    pub cluster: String,
    pub token_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureRequest {
    pub configuration: String,
    pub global_config: Option<GlobalConfig>,
}

/// Typed, opaque evidence forwarded to the server-side attestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationData {
    pub data_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationResponse {
    pub attestation_data: AttestationData,
    pub spiffe_id: String,
}

/// Wire form of the evidence. Field order is part of the format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsatAttestationData {
    pub cluster: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: &'static str,
    pub plugin_type: &'static str,
}

/// Encode the `{cluster, token}` evidence payload.
pub fn build_evidence(cluster: &str, token: &str) -> AttestorResult<Vec<u8>> {
    Ok(serde_json::to_vec(&PsatAttestationData {
        cluster: cluster.to_string(),
        token: token.to_string(),
    })?)
}

/// PSAT node attestor plugin.
#[derive(Debug, Default)]
pub struct AttestorPlugin {
    config: RwLock<Option<Arc<AttestorState>>>,
}

impl AttestorPlugin {
    /// Create an unconfigured plugin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME,
            plugin_type: "NodeAttestor",
        }
    }

    /// Decode and validate configuration, replacing any previous one.
    pub fn configure(&self, req: ConfigureRequest) -> AttestorResult<()> {
        let config: AttestorConfig = toml::from_str(&req.configuration).map_err(|e| {
            AttestorError::ConfigValidation(format!("unable to decode configuration: {e}"))
        })?;

        let global = req.global_config.ok_or_else(|| {
            AttestorError::ConfigValidation("global configuration is required".to_string())
        })?;
        if global.trust_domain.is_empty() {
            return Err(AttestorError::ConfigValidation(
                "global configuration missing trust domain".to_string(),
            ));
        }
        if config.cluster.is_empty() {
            return Err(AttestorError::ConfigValidation(
                "configuration missing cluster".to_string(),
            ));
        }

        let token_path = if config.token_path.is_empty() {
            PathBuf::from(DEFAULT_TOKEN_PATH)
        } else {
            PathBuf::from(config.token_path)
        };

        let state = AttestorState {
            trust_domain: global.trust_domain,
            cluster: config.cluster,
            token_path,
        };

        info!(
            trust_domain = %state.trust_domain,
            cluster = %state.cluster,
            token_path = %state.token_path.display(),
            "k8s-psat attestor configured"
        );

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(state));
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn state(&self) -> AttestorResult<Arc<AttestorState>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AttestorError::NotConfigured)
    }

    /// Load the token and produce attestation evidence plus the agent ID.
    ///
    /// Exactly one response is produced per call; nothing partial is emitted
    /// on failure.
    pub fn fetch_attestation_data(&self) -> AttestorResult<AttestationResponse> {
        let config = self.state()?;

        let token = load_token_from_file(&config.token_path).map_err(|e| {
            warn!(token_path = %config.token_path.display(), error = %e, "Token load failed");
            e
        })?;

        let claims = claims::parse_unverified(&token)?;
        let spiffe_id = spiffe_id::agent_id(
            PLUGIN_NAME,
            &config.trust_domain,
            &config.cluster,
            claims.pod_uid(),
        );
        let data = build_evidence(&config.cluster, &token)?;

        debug!(spiffe_id = %spiffe_id, "Attestation data produced");

        Ok(AttestationResponse {
            attestation_data: AttestationData {
                data_type: PLUGIN_NAME.to_string(),
                data,
            },
            spiffe_id,
        })
    }
}

/// Read a token file, distinguishing a missing file from an empty one.
pub fn load_token_from_file(path: &Path) -> AttestorResult<String> {
    let data = std::fs::read(path).map_err(|source| AttestorError::TokenUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    if data.is_empty() {
        return Err(AttestorError::TokenEmpty {
            path: path.to_path_buf(),
        });
    }
    String::from_utf8(data).map_err(|_| AttestorError::Parse("token is not valid UTF-8".to_string()))
}
