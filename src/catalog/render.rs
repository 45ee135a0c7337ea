//! Manifest rendering
//!
//! Turns the raw manifest strings of a [`KubernetesBlueprint`] into the typed
//! objects of a [`KubernetesComponent`] by substituting per-instance
//! placeholders and deserializing the result.
//!
//! Substitutions, applied left-to-right per manifest:
//! `$org`, `$space`, `$catalog_service_id`, `$catalog_plan_id`, `$service_id`,
//! `$idx_and_short_serviceid`, `$short_serviceid`, `$random0`..`$random8`,
//! `$base64-<literal>"`. Credential-mapping placeholders (`$hostname`,
//! `$port_<n>`, `$env_<NAME>`, `$name`, `$uri`) survive rendering; they are
//! resolved at bind time against live cluster state.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::Error;
use crate::Result;

use super::blueprint::{JobHook, KubernetesBlueprint, KubernetesComponent, Workload};

/// Per-instance values substituted into manifests
#[derive(Clone, Debug)]
pub struct RenderParams {
    /// Instance uuid supplied by the upstream control plane
    pub instance_id: String,
    /// Tenant organization
    pub org: String,
    /// Tenant space
    pub space: String,
    /// Catalog-visible service id
    pub catalog_service_id: String,
    /// Catalog-visible plan id
    pub catalog_plan_id: String,
}

/// Render a blueprint into typed Kubernetes objects.
///
/// Every manifest string is substituted independently (fresh random draws per
/// manifest, a single draw per `$randomN` name) and deserialized into its
/// resource type. A parse failure surfaces as [`Error::Template`].
pub fn render_component(
    blueprint: &KubernetesBlueprint,
    params: &RenderParams,
) -> Result<KubernetesComponent> {
    let mut component = KubernetesComponent::default();

    for (idx, raw) in blueprint.secrets.iter().enumerate() {
        component
            .secrets
            .push(parse(&substitute(raw, params, idx), "Secret")?);
    }
    for (idx, raw) in blueprint.persistent_volume_claims.iter().enumerate() {
        component
            .persistent_volume_claims
            .push(parse(&substitute(raw, params, idx), "PersistentVolumeClaim")?);
    }
    for (idx, raw) in blueprint.deployments.iter().enumerate() {
        let dep = parse(&substitute(raw, params, idx), "Deployment")?;
        component.workloads.push(Workload::Deployment(dep));
    }
    for (idx, raw) in blueprint.replication_controllers.iter().enumerate() {
        let rc = parse(&substitute(raw, params, idx), "ReplicationController")?;
        component.workloads.push(Workload::ReplicationController(rc));
    }
    for (idx, raw) in blueprint.services.iter().enumerate() {
        component
            .services
            .push(parse(&substitute(raw, params, idx), "Service")?);
    }
    for (idx, raw) in blueprint.service_accounts.iter().enumerate() {
        component
            .service_accounts
            .push(parse(&substitute(raw, params, idx), "ServiceAccount")?);
    }
    for (idx, (kind, raw)) in blueprint.jobs.iter().enumerate() {
        let job = parse(&substitute(raw, params, idx), "Job")?;
        component.hooks.push(JobHook { kind: *kind, job });
    }

    Ok(component)
}

/// Substitute every placeholder in one manifest string
pub fn substitute(manifest: &str, params: &RenderParams, idx: usize) -> String {
    let mut out = manifest.to_string();

    out = out.replace("$org", &params.org);
    out = out.replace("$space", &params.space);
    out = out.replace("$catalog_service_id", &params.catalog_service_id);
    out = out.replace("$catalog_plan_id", &params.catalog_plan_id);

    out = out.replace("$service_id", &params.instance_id);
    out = out.replace(
        "$idx_and_short_serviceid",
        &indexed_dns_name(&params.instance_id, idx),
    );
    out = out.replace("$short_serviceid", &dns_name(&params.instance_id));

    for i in 0..9 {
        let token = format!("$random{i}");
        if out.contains(&token) {
            out = out.replace(&token, &random_string(10));
        }
    }

    substitute_base64(&out)
}

/// `x` + first 15 chars of the id, dashes removed
///
/// Kubernetes object names must be DNS labels; raw uuids may start with a
/// digit and contain dashes, so they are prefixed and stripped. Ids shorter
/// than 15 chars are used whole.
fn dns_name(id: &str) -> String {
    let prefix: String = id.chars().take(15).collect();
    format!("x{}", prefix.replace('-', ""))
}

/// `x` + first 15 chars + `x` + index, dashes removed
fn indexed_dns_name(id: &str, idx: usize) -> String {
    format!("{}x{idx}", dns_name(id))
}

fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Replace each `$base64-<literal>"` with the standard encoding of
/// `<literal>` followed by the closing quote
fn substitute_base64(manifest: &str) -> String {
    const TOKEN: &str = "$base64-";
    let mut out = String::with_capacity(manifest.len());
    let mut rest = manifest;

    while let Some(start) = rest.find(TOKEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + TOKEN.len()..];
        match after.find('"') {
            Some(end) => {
                out.push_str(&BASE64.encode(&after[..end]));
                out.push('"');
                rest = &after[end + 1..];
            }
            None => {
                // unterminated token, leave as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn parse<T: serde::de::DeserializeOwned>(manifest: &str, kind: &str) -> Result<T> {
    serde_json::from_str(manifest)
        .map_err(|e| Error::template(format!("unmarshalling {kind} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::blueprint::JobKind;

    fn params() -> RenderParams {
        RenderParams {
            instance_id: "181864c5-7114-45ab-9d0c-111111111111".into(),
            org: "org-1".into(),
            space: "space-1".into(),
            catalog_service_id: "S1".into(),
            catalog_plan_id: "P1".into(),
        }
    }

    const ALL_PLACEHOLDERS: [&str; 8] = [
        "$org",
        "$space",
        "$catalog_service_id",
        "$catalog_plan_id",
        "$service_id",
        "$short_serviceid",
        "$idx_and_short_serviceid",
        "$base64-",
    ];

    #[test]
    fn literal_placeholders_replaced() {
        let out = substitute(
            r#"{"org":"$org","space":"$space","svc":"$catalog_service_id","plan":"$catalog_plan_id","id":"$service_id"}"#,
            &params(),
            0,
        );
        assert_eq!(
            out,
            r#"{"org":"org-1","space":"space-1","svc":"S1","plan":"P1","id":"181864c5-7114-45ab-9d0c-111111111111"}"#
        );
    }

    #[test]
    fn short_serviceid_is_dns_safe() {
        let out = substitute(r#"{"name":"$short_serviceid"}"#, &params(), 0);
        // first 15 chars of the uuid with dashes removed, x-prefixed
        assert_eq!(out, r#"{"name":"x181864c5711445a"}"#);
    }

    #[test]
    fn indexed_name_appends_index() {
        let out = substitute(r#"{"name":"$idx_and_short_serviceid"}"#, &params(), 3);
        assert_eq!(out, r#"{"name":"x181864c5711445ax3"}"#);
    }

    #[test]
    fn short_id_does_not_panic_on_small_ids() {
        let mut p = params();
        p.instance_id = "ab-cd-ef-gh-14".into(); // 14 chars
        let out = substitute("$short_serviceid and $idx_and_short_serviceid", &p, 1);
        assert_eq!(out, "xabcdefgh14 and xabcdefgh14x1");
    }

    #[test]
    fn random_token_single_draw_per_manifest() {
        let out = substitute(r#"{"a":"$random0","b":"$random0","c":"$random1"}"#, &params(), 0);
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        let a = v["a"].as_str().unwrap();
        let b = v["b"].as_str().unwrap();
        let c = v["c"].as_str().unwrap();

        assert_eq!(a, b, "repeated $random0 must resolve to one value");
        assert_eq!(a.len(), 10);
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric()));
        assert_ne!(a, c, "independent names draw independently");
    }

    #[test]
    fn base64_token_encodes_up_to_quote() {
        let out = substitute(r#"{"password":"$base64-hunter2"}"#, &params(), 0);
        assert_eq!(out, r#"{"password":"aHVudGVyMg=="}"#);
    }

    #[test]
    fn base64_sees_earlier_substitutions() {
        // base64 runs last, so it encodes the substituted org value
        let out = substitute(r#"{"blob":"$base64-$org"}"#, &params(), 0);
        assert_eq!(out, format!(r#"{{"blob":"{}"}}"#, BASE64.encode("org-1")));
    }

    #[test]
    fn no_instance_placeholder_survives_rendering() {
        let manifest = r#"{
            "metadata": {"name": "$idx_and_short_serviceid", "labels": {"managed_by": "broker", "service_id": "$service_id", "org": "$org", "space": "$space"}},
            "data": {"user": "$base64-admin", "pass": "$base64-$random0"},
            "ids": ["$catalog_service_id", "$catalog_plan_id", "$short_serviceid", "$random1"]
        }"#;
        let out = substitute(manifest, &params(), 0);
        for token in ALL_PLACEHOLDERS {
            assert!(!out.contains(token), "token {token} survived: {out}");
        }
        assert!(!out.contains("$random"));
    }

    #[test]
    fn render_component_parses_typed_objects_with_labels() {
        let blueprint = KubernetesBlueprint {
            secrets: vec![
                r#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"$short_serviceid-creds","labels":{"managed_by":"broker","service_id":"$service_id"}},"data":{"password":"$base64-$random0"}}"#.into(),
            ],
            deployments: vec![
                r#"{"apiVersion":"apps/v1","kind":"Deployment","metadata":{"name":"$short_serviceid","labels":{"managed_by":"broker","service_id":"$service_id"}},"spec":{"selector":{"matchLabels":{"service_id":"$service_id"}},"template":{"metadata":{"labels":{"managed_by":"broker","service_id":"$service_id"}},"spec":{"containers":[{"name":"main","image":"postgres:15"}]}}}}"#.into(),
            ],
            services: vec![
                r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"$short_serviceid","labels":{"managed_by":"broker","service_id":"$service_id"}},"spec":{"ports":[{"port":5432,"protocol":"TCP"}]}}"#.into(),
            ],
            ..KubernetesBlueprint::default()
        };

        let component = render_component(&blueprint, &params()).unwrap();
        assert_eq!(component.resource_count(), 3);

        let id = params().instance_id;
        let secret_labels = component.secrets[0].metadata.labels.as_ref().unwrap();
        assert_eq!(secret_labels.get("managed_by").unwrap(), "broker");
        assert_eq!(secret_labels.get("service_id").unwrap(), &id);

        let svc_labels = component.services[0].metadata.labels.as_ref().unwrap();
        assert_eq!(svc_labels.get("service_id").unwrap(), &id);

        let workload = &component.workloads[0];
        assert_eq!(workload.name(), "x181864c5711445a");
        assert_eq!(workload.containers()[0].image.as_deref(), Some("postgres:15"));
    }

    #[test]
    fn render_component_rejects_garbage_manifest() {
        let blueprint = KubernetesBlueprint {
            services: vec![r#"{"apiVersion":"v1","kind":"Service","spec":{"ports":"oops"}}"#.into()],
            ..KubernetesBlueprint::default()
        };
        assert!(matches!(
            render_component(&blueprint, &params()),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn hooks_render_separately_from_apply_pipeline() {
        let blueprint = KubernetesBlueprint {
            jobs: vec![(
                JobKind::OnCreate,
                r#"{"apiVersion":"batch/v1","kind":"Job","metadata":{"name":"init-$short_serviceid","labels":{"managed_by":"broker","service_id":"$service_id"}}}"#.into(),
            )],
            ..KubernetesBlueprint::default()
        };

        let component = render_component(&blueprint, &params()).unwrap();
        assert_eq!(component.resource_count(), 0, "hooks are not applied resources");
        assert_eq!(component.hooks.len(), 1);
        assert_eq!(component.hooks[0].kind, JobKind::OnCreate);
        assert_eq!(
            component.hooks[0].job.metadata.name.as_deref(),
            Some("init-x181864c5711445a")
        );
    }
}
