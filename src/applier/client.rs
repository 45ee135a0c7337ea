//! Kubernetes client construction from tenant cluster credentials
//!
//! The broker talks to a different cluster per request, so clients are built
//! on the fly from the credentials snapshot the creator returned rather than
//! from a kubeconfig on disk.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;

use crate::creator::ClusterCredentials;
use crate::error::Error;
use crate::Result;

use super::NAMESPACE;

/// Build a [`kube::Client`] for one tenant cluster
pub async fn client_for(creds: &ClusterCredentials, insecure_skip_verify: bool) -> Result<Client> {
    let kubeconfig = kubeconfig_for(creds, insecure_skip_verify)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("cannot build cluster config: {e}")))?;
    Client::try_from(config).map_err(Error::from)
}

/// Assemble an in-memory kubeconfig from the credentials snapshot
fn kubeconfig_for(creds: &ClusterCredentials, insecure_skip_verify: bool) -> Result<Kubeconfig> {
    let mut cluster = json!({ "server": creds.api_server_url });
    match (&creds.ca_cert, insecure_skip_verify) {
        (Some(ca), false) => {
            cluster["certificate-authority-data"] = json!(BASE64.encode(ca.as_bytes()));
        }
        _ => {
            cluster["insecure-skip-tls-verify"] = json!(true);
        }
    }

    let mut user = json!({
        "username": creds.username,
        "password": creds.password,
    });
    if let (Some(cert), Some(key)) = (&creds.admin_cert, &creds.admin_key) {
        user["client-certificate-data"] = json!(BASE64.encode(cert.as_bytes()));
        user["client-key-data"] = json!(BASE64.encode(key.as_bytes()));
    }

    let value = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "tenant", "cluster": cluster }],
        "users": [{ "name": "broker", "user": user }],
        "contexts": [{
            "name": "tenant",
            "context": { "cluster": "tenant", "user": "broker", "namespace": NAMESPACE }
        }],
        "current-context": "tenant"
    });

    serde_json::from_value(value)
        .map_err(|e| Error::config(format!("cannot assemble kubeconfig: {e}")))
}
