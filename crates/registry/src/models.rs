//! Canonical registry entities.
//!
//! Every persisted entity embeds a [`Model`] base (surrogate id and
//! timestamps). Values passed to create operations may leave it defaulted;
//! the store fills it in on write. There is no soft delete.

use serde::{Deserialize, Serialize};

/// Base record shared by all entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
}

/// A type/value pair asserting an observed attribute of a node or workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub value: String,
}

impl Selector {
    pub fn new(selector_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            selector_type: selector_type.into(),
            value: value.into(),
        }
    }
}

/// Trust bundle for a trust domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(skip)]
    pub model: Model,
    pub trust_domain: String,
    pub data: Vec<u8>,
}

impl Bundle {
    pub fn new(trust_domain: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            model: Model::default(),
            trust_domain: trust_domain.into(),
            data: data.into(),
        }
    }
}

/// An agent that completed node attestation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedNode {
    #[serde(skip)]
    pub model: Model,
    pub spiffe_id: String,
    /// Attestation data type (the attestor plugin name)
    pub data_type: String,
    pub serial_number: String,
    /// Credential expiration, Unix seconds
    pub expires_at: i64,
}

/// One resolved selector for an attested node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelector {
    #[serde(skip)]
    pub model: Model,
    pub spiffe_id: String,
    pub selector_type: String,
    pub value: String,
}

/// Registration entry mapping selectors and parentage to an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredEntry {
    #[serde(skip)]
    pub model: Model,
    /// Assigned by the store when empty
    pub entry_id: String,
    pub spiffe_id: String,
    pub parent_id: String,
    pub ttl: i32,
    /// Insertion order is preserved
    pub selectors: Vec<Selector>,
    /// Trust domains of federated bundles
    pub federates_with: Vec<String>,
    pub admin: bool,
    pub downstream: bool,
}

/// Selector row owned by a registration entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySelector {
    pub model: Model,
    pub registered_entry_id: i64,
    pub selector_type: String,
    pub value: String,
}

/// Link row of the entry ⇄ bundle federation relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FederationLink {
    pub bundle_id: i64,
    pub registered_entry_id: i64,
}

/// Single-use bootstrap credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    #[serde(skip)]
    pub model: Model,
    pub token: String,
    /// Unix seconds
    pub expiry: i64,
}

impl JoinToken {
    pub fn new(token: impl Into<String>, expiry: i64) -> Self {
        Self {
            model: Model::default(),
            token: token.into(),
            expiry,
        }
    }
}

/// Applied schema version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Migration {
    pub model: Model,
    pub version: i32,
}

/// How `delete_bundle` treats entries federated with the bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Refuse while any entry federates with the bundle.
    #[default]
    Restrict,
    /// Remove the federation links, keep the entries.
    Dissociate,
    /// Delete the federated entries along with the bundle.
    Delete,
}

/// Filters for `list_registration_entries`; all set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEntriesRequest {
    pub by_parent_id: Option<String>,
    pub by_spiffe_id: Option<String>,
}

/// Borrowed view over any persisted entity, the input of dialect mapping.
#[derive(Debug, Clone, Copy)]
pub enum Row<'a> {
    Bundle(&'a Bundle),
    AttestedNode(&'a AttestedNode),
    NodeSelector(&'a NodeSelector),
    RegisteredEntry(&'a RegisteredEntry),
    Selector(&'a EntrySelector),
    FederationLink(&'a FederationLink),
    JoinToken(&'a JoinToken),
    Migration(&'a Migration),
}
