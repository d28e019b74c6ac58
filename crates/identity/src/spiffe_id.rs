//! SPIFFE ID construction, parsing and validation.
//!
//! Agent identities are positional: consumers read the plugin, cluster and
//! pod UID straight out of the path, so [`agent_id`] and [`parse_agent_id`]
//! must stay exact inverses for segments without a `/`.

use url::Url;

use crate::error::SpiffeIdError;

pub const SCHEME: &str = "spiffe";

/// Path prefix reserved for server and agent identities.
pub const RESERVED_PREFIX: &str = "/spire/";

const AGENT_PREFIX: &str = "/spire/agent/";

/// What kind of SPIFFE ID a caller is willing to accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationMode {
    /// Any well-formed SPIFFE ID.
    Any,
    /// A workload ID in any trust domain (non-empty path outside `/spire/`).
    AnyTrustDomainWorkload,
    /// A workload ID in the given trust domain.
    TrustDomainWorkload(String),
    /// An agent ID (`/spire/agent/...`) in the given trust domain.
    TrustDomainAgent(String),
}

impl ValidationMode {
    fn kind(&self) -> &'static str {
        match self {
            ValidationMode::Any => "",
            ValidationMode::AnyTrustDomainWorkload | ValidationMode::TrustDomainWorkload(_) => {
                "workload "
            }
            ValidationMode::TrustDomainAgent(_) => "agent ",
        }
    }

    fn required_trust_domain(&self) -> Option<&str> {
        match self {
            ValidationMode::TrustDomainWorkload(td) | ValidationMode::TrustDomainAgent(td) => {
                Some(td)
            }
            _ => None,
        }
    }
}

/// Parse `id` and check it against `mode`.
pub fn parse(id: &str, mode: &ValidationMode) -> Result<Url, SpiffeIdError> {
    let invalid = |reason: &str| SpiffeIdError::Invalid {
        id: id.to_string(),
        kind: mode.kind(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("SPIFFE ID is empty"));
    }

    let url = Url::parse(id).map_err(|e| SpiffeIdError::Parse(e.to_string()))?;

    if url.scheme() != SCHEME {
        return Err(invalid("invalid scheme"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("user info is not allowed"));
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(invalid("trust domain is empty")),
    };
    if url.port().is_some() {
        return Err(invalid("port is not allowed"));
    }
    if url.fragment().is_some() {
        return Err(invalid("fragment is not allowed"));
    }
    if url.query().is_some() {
        return Err(invalid("query is not allowed"));
    }

    if let Some(td) = mode.required_trust_domain() {
        if !host.eq_ignore_ascii_case(td) {
            return Err(invalid(&format!(
                "trust domain {td:?} does not belong to {host:?}"
            )));
        }
    }

    let path = url.path();
    match mode {
        ValidationMode::Any => {}
        ValidationMode::AnyTrustDomainWorkload | ValidationMode::TrustDomainWorkload(_) => {
            if path.is_empty() || path == "/" {
                return Err(invalid("path is empty"));
            }
            if path.starts_with(RESERVED_PREFIX) {
                return Err(invalid(r#"invalid path: "/spire/*" namespace is reserved"#));
            }
        }
        ValidationMode::TrustDomainAgent(_) => {
            if !path.starts_with(AGENT_PREFIX) {
                return Err(invalid(r#"invalid path: expecting "/spire/agent/*""#));
            }
        }
    }

    Ok(url)
}

/// Validate `id` against `mode`, discarding the parsed form.
pub fn validate(id: &str, mode: &ValidationMode) -> Result<(), SpiffeIdError> {
    parse(id, mode).map(|_| ())
}

/// Build the agent identity for a node attested by `plugin_name`.
pub fn agent_id(plugin_name: &str, trust_domain: &str, cluster: &str, pod_uid: &str) -> String {
    format!("{SCHEME}://{trust_domain}{AGENT_PREFIX}{plugin_name}/{cluster}/{pod_uid}")
}

/// Positional components of an agent identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentId {
    pub trust_domain: String,
    pub plugin_name: String,
    pub cluster: String,
    pub pod_uid: String,
}

/// Split an agent identity produced by [`agent_id`] back into its segments.
pub fn parse_agent_id(id: &str) -> Result<AgentId, SpiffeIdError> {
    let url = parse(id, &ValidationMode::Any)?;
    let invalid = |reason: &str| SpiffeIdError::Invalid {
        id: id.to_string(),
        kind: "agent ",
        reason: reason.to_string(),
    };

    let rest = url
        .path()
        .strip_prefix(AGENT_PREFIX)
        .ok_or_else(|| invalid(r#"invalid path: expecting "/spire/agent/*""#))?;
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [plugin, cluster, pod_uid]
            if !plugin.is_empty() && !cluster.is_empty() && !pod_uid.is_empty() =>
        {
            Ok(AgentId {
                trust_domain: url.host_str().unwrap_or_default().to_string(),
                plugin_name: plugin.to_string(),
                cluster: cluster.to_string(),
                pod_uid: pod_uid.to_string(),
            })
        }
        _ => Err(invalid("expected <plugin>/<cluster>/<pod-uid> after agent prefix")),
    }
}
