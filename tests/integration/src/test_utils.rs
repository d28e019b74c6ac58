//! Fixtures shared by the pipeline tests

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use trustforge_core::GlobalConfig;
use trustforge_identity::{AttestorPlugin, ConfigureRequest};

pub const TRUST_DOMAIN: &str = "example.org";
pub const CLUSTER: &str = "production";

/// Scratch directory removed on drop
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn new() -> Self {
        let dir =
            std::env::temp_dir().join(format!("trustforge-integration-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, name: &str, data: &str) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, data).expect("write scratch file");
        path
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// A projected service account token for `pod_uid`, signed by a throwaway
/// cluster key the agent never checks.
pub fn create_psat(pod_uid: &str) -> String {
    let cluster_key = SigningKey::random(&mut OsRng);
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "iss": "kubernetes/serviceaccount",
        "aud": ["spire-server"],
        "kubernetes.io": {
            "namespace": "spire",
            "pod": {"name": "spire-agent-0", "uid": pod_uid},
            "serviceaccount": {"name": "spire-agent", "uid": "SA-UID"}
        }
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{header}.{payload}");
    let signature: Signature = cluster_key.sign(signing_input.as_bytes());
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Attestor configured for [`TRUST_DOMAIN`]/[`CLUSTER`] reading `token_path`.
pub fn configured_attestor(token_path: &Path) -> AttestorPlugin {
    let plugin = AttestorPlugin::new();
    plugin
        .configure(ConfigureRequest {
            configuration: format!(
                "cluster = {CLUSTER:?}\ntoken_path = {:?}",
                token_path.display().to_string()
            ),
            global_config: Some(GlobalConfig {
                trust_domain: TRUST_DOMAIN.to_string(),
            }),
        })
        .expect("configure attestor");
    plugin
}

pub fn in_five_minutes() -> SystemTime {
    SystemTime::now() + Duration::from_secs(300)
}
