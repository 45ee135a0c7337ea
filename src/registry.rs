//! Service registry (Consul-compatible agent API)
//!
//! Tenant clusters run a Consul-style registry; services become externally
//! reachable when their registry entry carries the `Public` tag. The broker
//! only ever toggles that one tag, re-registering the service with its
//! existing fields otherwise untouched.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::Result;

/// Registry tag marking a service as publicly routable
pub const PUBLIC_TAG: &str = "Public";

/// One service entry as the agent reports it
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentService {
    /// Registration id
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Service name
    #[serde(rename = "Service", default)]
    pub service: String,
    /// Address the service is reachable at
    #[serde(rename = "Address", default)]
    pub address: String,
    /// Registered port
    #[serde(rename = "Port", default)]
    pub port: i32,
    /// Tags, possibly containing [`PUBLIC_TAG`]
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

/// Registration payload for the agent's register endpoint
#[derive(Clone, Debug, Serialize)]
pub struct AgentServiceRegistration {
    /// Registration id
    #[serde(rename = "ID")]
    pub id: String,
    /// Service name
    #[serde(rename = "Name")]
    pub name: String,
    /// Address the service is reachable at
    #[serde(rename = "Address")]
    pub address: String,
    /// Registered port
    #[serde(rename = "Port")]
    pub port: i32,
    /// Full replacement tag set
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    /// Allow tag updates from re-registration
    #[serde(rename = "EnableTagOverride")]
    pub enable_tag_override: bool,
}

/// Desired visibility of one registry entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibilityUpdate {
    /// Registry service name (`<svc>[-<port-name>]`)
    pub name: String,
    /// Node port the entry is registered under
    pub port: i32,
    /// Whether the `Public` tag should be present afterwards
    pub public: bool,
}

/// Operations against one cluster's service registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Per-service public-tag status, keyed by service name
    async fn public_status(&self, endpoint: &str) -> Result<HashMap<String, bool>>;

    /// Apply visibility updates by re-registering the matching services
    async fn update_visibility(&self, endpoint: &str, updates: &[VisibilityUpdate]) -> Result<()>;
}

/// REST client for the Consul agent API
pub struct ConsulRegistry {
    http: reqwest::Client,
}

impl ConsulRegistry {
    /// Build the registry client
    pub fn new(timeout: std::time::Duration, insecure_skip_verify: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(|e| Error::config(format!("cannot build registry http client: {e}")))?;
        Ok(Self { http })
    }

    async fn services(&self, endpoint: &str) -> Result<HashMap<String, AgentService>> {
        let url = format!("{}/v1/agent/services", normalize_endpoint(endpoint));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "registry GET services returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn public_status(&self, endpoint: &str) -> Result<HashMap<String, bool>> {
        let services = self.services(endpoint).await?;
        Ok(services
            .into_values()
            .map(|s| {
                let public = s.tags.iter().any(|t| t == PUBLIC_TAG);
                (s.service, public)
            })
            .collect())
    }

    async fn update_visibility(&self, endpoint: &str, updates: &[VisibilityUpdate]) -> Result<()> {
        let endpoint = normalize_endpoint(endpoint);
        for update in updates {
            let services = self.services(&endpoint).await?;
            let matched = services
                .into_values()
                .find(|s| s.service == update.name && s.port == update.port)
                .ok_or_else(|| {
                    Error::upstream(format!(
                        "service {} with port {} not found in registry",
                        update.name, update.port
                    ))
                })?;

            let registration = apply_visibility(&matched, update.public);
            debug!(service = %registration.name, tags = ?registration.tags, "re-registering service");

            let url = format!("{endpoint}/v1/agent/service/register");
            let response = self.http.put(&url).json(&registration).send().await?;
            if !response.status().is_success() {
                return Err(Error::upstream(format!(
                    "registry register returned {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }
}

/// Re-registration payload with the `Public` tag added or removed
fn apply_visibility(service: &AgentService, public: bool) -> AgentServiceRegistration {
    let mut tags: Vec<String> = service
        .tags
        .iter()
        .filter(|t| t.as_str() != PUBLIC_TAG)
        .cloned()
        .collect();
    if public {
        tags.push(PUBLIC_TAG.to_string());
    }
    AgentServiceRegistration {
        id: service.id.clone(),
        name: service.service.clone(),
        address: service.address.clone(),
        port: service.port,
        tags,
        enable_tag_override: true,
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tags: &[&str]) -> AgentService {
        AgentService {
            id: "svc-1".into(),
            service: "xabc-pg".into(),
            address: "10.0.0.2".into(),
            port: 31432,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn making_public_appends_tag_once() {
        let reg = apply_visibility(&entry(&["db"]), true);
        assert_eq!(reg.tags, vec!["db".to_string(), PUBLIC_TAG.to_string()]);
        assert!(reg.enable_tag_override);

        // already public stays single-tagged
        let reg = apply_visibility(&entry(&["db", PUBLIC_TAG]), true);
        assert_eq!(reg.tags, vec!["db".to_string(), PUBLIC_TAG.to_string()]);
    }

    #[test]
    fn making_private_strips_tag_and_keeps_rest() {
        let reg = apply_visibility(&entry(&["db", PUBLIC_TAG, "primary"]), false);
        assert_eq!(reg.tags, vec!["db".to_string(), "primary".to_string()]);
    }

    #[test]
    fn registration_preserves_identity_fields() {
        let reg = apply_visibility(&entry(&[]), true);
        assert_eq!(reg.id, "svc-1");
        assert_eq!(reg.name, "xabc-pg");
        assert_eq!(reg.address, "10.0.0.2");
        assert_eq!(reg.port, 31432);
    }

    #[test]
    fn endpoint_normalization() {
        assert_eq!(normalize_endpoint("http://consul:8500/"), "http://consul:8500");
        assert_eq!(normalize_endpoint("consul:8500"), "http://consul:8500");
        assert_eq!(normalize_endpoint("https://consul:8500"), "https://consul:8500");
    }
}
