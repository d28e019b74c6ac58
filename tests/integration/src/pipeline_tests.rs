//! Attestation → registry → JWT-SVID issuance

use p256::ecdsa::{signature::Verifier, Signature, SigningKey};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;

use trustforge_core::{clock, Config};
use trustforge_identity::claims::parse_compact;
use trustforge_identity::{
    key_id, parse_agent_id, sign_token, AttestorPlugin, ConfigureRequest, PsatAttestationData,
    SvidClaims, PLUGIN_NAME,
};
use trustforge_registry::{
    AttestedNode, DatabaseType, ListEntriesRequest, RegisteredEntry, Selector, SqlStore,
};

use crate::test_utils::{
    configured_attestor, create_psat, in_five_minutes, Scratch, CLUSTER, TRUST_DOMAIN,
};

#[test]
fn test_attest_register_and_issue() {
    let _ = trustforge_core::logging::try_init();

    // Step 1: agent side, produce evidence from the projected token
    let scratch = Scratch::new();
    let token = create_psat("POD-UID");
    let attestor = configured_attestor(&scratch.write("token", &token));
    let response = attestor.fetch_attestation_data().unwrap();

    let evidence: PsatAttestationData =
        serde_json::from_slice(&response.attestation_data.data).unwrap();
    assert_eq!(evidence.cluster, CLUSTER);
    assert_eq!(evidence.token, token);

    let agent = parse_agent_id(&response.spiffe_id).unwrap();
    assert_eq!(agent.trust_domain, TRUST_DOMAIN);
    assert_eq!(agent.plugin_name, PLUGIN_NAME);
    assert_eq!(agent.pod_uid, "POD-UID");

    // Step 2: server side, record the node and its selectors
    let store = SqlStore::open_in_memory(DatabaseType::Sqlite3).unwrap();
    let node = store
        .create_attested_node(&AttestedNode {
            spiffe_id: response.spiffe_id.clone(),
            data_type: response.attestation_data.data_type.clone(),
            serial_number: "1".to_string(),
            expires_at: clock::now_unix() + 3600,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(node.data_type, PLUGIN_NAME);

    let node_selectors = vec![
        Selector::new(PLUGIN_NAME, format!("cluster:{CLUSTER}")),
        Selector::new(PLUGIN_NAME, "agent_ns:spire"),
        Selector::new(PLUGIN_NAME, "agent_sa:spire-agent"),
    ];
    store
        .set_node_selectors(&response.spiffe_id, &node_selectors)
        .unwrap();
    assert_eq!(
        store.get_node_selectors(&response.spiffe_id).unwrap(),
        node_selectors
    );

    // Step 3: register a workload under the agent
    let workload = format!("spiffe://{TRUST_DOMAIN}/ns/default/sa/web");
    let entry = store
        .create_registration_entry(&RegisteredEntry {
            spiffe_id: workload.clone(),
            parent_id: response.spiffe_id.clone(),
            ttl: 300,
            selectors: vec![Selector::new("k8s", "ns:default"), Selector::new("k8s", "sa:web")],
            ..Default::default()
        })
        .unwrap();

    let children = store
        .list_registration_entries(&ListEntriesRequest {
            by_parent_id: Some(response.spiffe_id.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(children, vec![entry.clone()]);

    // Step 4: mint a JWT-SVID for the registered workload
    let server_key = SigningKey::random(&mut OsRng);
    let kid = key_id(server_key.verifying_key());
    let expires_at = in_five_minutes();
    let svid = sign_token(
        &entry.spiffe_id,
        &["spire-server".to_string()],
        expires_at,
        &server_key,
        &kid,
    )
    .unwrap();

    let jws = parse_compact(&svid).unwrap();
    assert_eq!(jws.header.kid.as_deref(), Some(kid.as_str()));
    let claims: SvidClaims = serde_json::from_slice(&jws.payload).unwrap();
    assert_eq!(claims.sub, workload);
    assert_eq!(claims.exp, clock::unix_seconds(expires_at));

    let signature = Signature::from_slice(&jws.signature).unwrap();
    server_key
        .verifying_key()
        .verify(jws.signing_input.as_bytes(), &signature)
        .unwrap();

    tracing::info!(agent = %response.spiffe_id, workload = %workload, "Pipeline complete");
}

#[test]
fn test_agent_identity_cannot_be_issued_as_workload() {
    let scratch = Scratch::new();
    let attestor = configured_attestor(&scratch.write("token", &create_psat("POD-UID")));
    let response = attestor.fetch_attestation_data().unwrap();

    let server_key = SigningKey::random(&mut OsRng);
    let err = sign_token(
        &response.spiffe_id,
        &["spire-server".to_string()],
        in_five_minutes(),
        &server_key,
        &key_id(server_key.verifying_key()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("reserved"), "{err}");
}

#[test]
fn test_config_file_drives_attestor_and_store() {
    let scratch = Scratch::new();
    let token_path = scratch.write("token", &create_psat("POD-UID"));
    let config_path = scratch.write(
        "server.toml",
        &format!(
            r#"
trust_domain = "{TRUST_DOMAIN}"

[node_attestor]
plugin_name = "{PLUGIN_NAME}"

[node_attestor.plugin_data]
cluster = "{CLUSTER}"
token_path = {:?}

[datastore]
database_type = "sqlite3"
connection_string = {:?}
"#,
            token_path.display().to_string(),
            scratch.path().join("registry.db").display().to_string()
        ),
    );

    let config = Config::from_file(&config_path).unwrap();
    let section = config.node_attestor.clone().unwrap();
    assert_eq!(section.plugin_name, PLUGIN_NAME);

    let attestor = AttestorPlugin::new();
    attestor
        .configure(ConfigureRequest {
            configuration: section.plugin_data_text().unwrap(),
            global_config: Some(config.global()),
        })
        .unwrap();
    let response = attestor.fetch_attestation_data().unwrap();

    let store = SqlStore::open(&config.datastore).unwrap();
    store
        .create_attested_node(&AttestedNode {
            spiffe_id: response.spiffe_id.clone(),
            data_type: response.attestation_data.data_type,
            serial_number: "1".to_string(),
            expires_at: clock::now_unix() + 60,
            ..Default::default()
        })
        .unwrap();
    assert!(store
        .create_attested_node(&AttestedNode {
            spiffe_id: response.spiffe_id.clone(),
            ..Default::default()
        })
        .unwrap_err()
        .is_conflict());
}

#[tokio::test]
async fn test_attestation_under_caller_deadline() {
    let scratch = Scratch::new();
    let attestor = Arc::new(configured_attestor(
        &scratch.write("token", &create_psat("POD-UID")),
    ));

    let worker = Arc::clone(&attestor);
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || worker.fetch_attestation_data()),
    )
    .await
    .expect("attestation exceeded deadline")
    .expect("attestation task panicked")
    .unwrap();

    assert!(response
        .spiffe_id
        .ends_with(&format!("/spire/agent/{PLUGIN_NAME}/{CLUSTER}/POD-UID")));
}
