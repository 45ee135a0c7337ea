//! Bound-instance credential rendering
//!
//! Turns the plan's credential-mapping template plus the instance's live
//! state (services, node ports, container environments) into the JSON
//! fragment handed to a consuming application. Placeholders:
//!
//! - `$hostname`, `$nodeName`, `$port_<target>` per service
//! - `$nodes` in the mapping, filled from the replica template on clustered
//!   plans
//! - `$name` (offering name), `$env_<NAME>` (union of container envs)
//! - `$uri` stays a literal `NOTSUPPORTED://yet`

use std::collections::HashMap;

use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::applier::{PodEnvs, ServiceCredential};
use crate::catalog::blueprint::KubernetesBlueprint;
use crate::error::Error;
use crate::Result;

/// Render the credentials fragment for one bound instance.
///
/// Clustered plans (a replica template is present) render the template once
/// per service and join the results into `$nodes`; simple plans render the
/// mapping against the first service only, deliberately ignoring the rest.
pub fn render_credentials(
    service_name: &str,
    svc_creds: &[ServiceCredential],
    pod_envs: &[PodEnvs],
    blueprint: &KubernetesBlueprint,
) -> Result<String> {
    let mapping = blueprint
        .credentials_mapping
        .as_deref()
        .ok_or_else(|| Error::template("plan has no credentials mapping"))?;

    let mut rendered = match blueprint.replica_template.as_deref() {
        Some(replica_template) => render_clustered(mapping, replica_template, svc_creds)?,
        None => render_simple(mapping, svc_creds)?,
    };

    rendered = rendered.replace("$name", service_name);
    rendered = rendered.replace("$uri", "NOTSUPPORTED://yet");
    rendered = substitute_envs(&rendered, pod_envs);

    Ok(rendered)
}

fn render_clustered(
    mapping: &str,
    replica_template: &str,
    svc_creds: &[ServiceCredential],
) -> Result<String> {
    let mut nodes = Vec::new();
    for svc in svc_creds {
        let mut node = replica_template.replace("$hostname", &svc.host);
        node = node.replace("$nodeName", &svc.name);
        node = substitute_ports(&node, &svc.ports)?;
        nodes.push(node);
    }
    Ok(mapping.replace("$nodes", &nodes.join(",")))
}

fn render_simple(mapping: &str, svc_creds: &[ServiceCredential]) -> Result<String> {
    // simple-plan mappings describe a single service; extra services are
    // ignored, a known limitation of the catalog format
    match svc_creds.first() {
        Some(svc) => {
            let rendered = mapping.replace("$hostname", &svc.host);
            substitute_ports(&rendered, &svc.ports)
        }
        None => Ok(mapping.to_string()),
    }
}

/// Replace each `$port_<digits>` with the node port of the service port
/// whose target port equals `<digits>`. A `$port_` not followed by a digit
/// is not a token and stays literal.
fn substitute_ports(template: &str, ports: &[ServicePort]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("$port_") {
        let after = &rest[start + "$port_".len()..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            let skip = start + "$port_".len();
            out.push_str(&rest[..skip]);
            rest = &rest[skip..];
            continue;
        }
        out.push_str(&rest[..start]);
        let target: i32 = digits
            .parse()
            .map_err(|_| Error::template(format!("port value has incorrect format: {digits}")))?;

        match node_port_for_target(ports, target) {
            Some(node_port) => out.push_str(&node_port.to_string()),
            // unresolvable targets stay literal, exactly as rendered
            None => {
                out.push_str("$port_");
                out.push_str(&digits);
            }
        }
        rest = &after[digits.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

fn node_port_for_target(ports: &[ServicePort], target: i32) -> Option<i32> {
    ports
        .iter()
        .find(|p| target_port_of(p) == Some(target))
        .and_then(|p| p.node_port)
}

/// The effective target port of a service port; defaults to `port` when the
/// manifest leaves it unset
fn target_port_of(port: &ServicePort) -> Option<i32> {
    match &port.target_port {
        Some(IntOrString::Int(n)) => Some(*n),
        Some(IntOrString::String(s)) => s.parse().ok(),
        None => Some(port.port),
    }
}

/// Replace each `$env_<NAME>` with the value found in the union of all
/// container environments; unknown names resolve to the empty string.
/// Names span letters, `_` and `-` only, so a digit ends the token.
fn substitute_envs(template: &str, pod_envs: &[PodEnvs]) -> String {
    let mut all_envs: HashMap<&str, &str> = HashMap::new();
    for pod in pod_envs {
        for container in &pod.containers {
            for (name, value) in &container.envs {
                all_envs.insert(name.as_str(), value.as_str());
            }
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("$env_") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "$env_".len()..];
        let name: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphabetic() || *c == '_' || *c == '-')
            .collect();
        out.push_str(all_envs.get(name.as_str()).copied().unwrap_or(""));
        rest = &after[name.len()..];
    }
    out.push_str(rest);
    out
}
