// Copyright (c) Microsoft. All rights reserved.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use core_objects::{ResourceMeta, TrustDomain};
use entry_renderer::{CompiledTemplates, TemplateSources};

use crate::{error::Error, label_selector::LabelSelector, resource_meta};

/// Template-driven rule producing zero or more registration entries, one
/// per selected pod.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpiffeId {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ClusterSpiffeIdSpec,
    pub status: Option<ClusterSpiffeIdStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpiffeIdSpec {
    #[serde(rename = "spiffeIDTemplate")]
    pub spiffe_id_template: String,
    pub dns_name_templates: Vec<String>,
    pub workload_selector_templates: Vec<String>,
    #[serde(rename = "parentIDTemplate")]
    pub parent_id_template: Option<String>,
    pub pod_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    /// X.509-SVID TTL in seconds; zero means the server default.
    #[serde(rename = "ttl")]
    pub ttl_seconds: u64,
    /// JWT-SVID TTL in seconds; zero means the server default.
    #[serde(rename = "jwtTtl")]
    pub jwt_ttl_seconds: u64,
    pub federates_with: Vec<String>,
    pub admin: bool,
    pub downstream: bool,
    #[serde(rename = "autoPopulateDNSNames")]
    pub auto_populate_dns_names: bool,
    pub hint: String,
    pub class_name: String,
    /// Applies only when no non-fallback rule selects the same workload.
    pub fallback: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpiffeIdStatus {
    pub stats: ClusterSpiffeIdStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpiffeIdStats {
    pub namespaces_selected: u64,
    pub namespaces_ignored: u64,
    pub pods_selected: u64,
    pub entry_render_failures: u64,
    pub entries_masked: u64,
    pub entries_to_set: u64,
    pub entry_failures: u64,
}

/// The admitted, normalized form the entry reconciler consumes.
pub struct ParsedClusterSpiffeId {
    pub meta: ResourceMeta,
    pub templates: CompiledTemplates,
    pub pod_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
    pub x509_svid_ttl: u64,
    pub jwt_svid_ttl: u64,
    pub federates_with: BTreeSet<TrustDomain>,
    pub admin: bool,
    pub downstream: bool,
    pub auto_populate_dns_names: bool,
    pub hint: String,
    pub class_name: String,
    pub fallback: bool,
}

/// Parse and validate one ClusterSPIFFEID. All admission failures surface
/// here: template problems, bad selectors and bad federated trust domains.
pub fn parse_cluster_spiffe_id(
    resource: &ClusterSpiffeId,
    default_parent_id_template: &str,
) -> Result<ParsedClusterSpiffeId, Error> {
    let spec = &resource.spec;

    let templates = CompiledTemplates::new(
        &TemplateSources {
            spiffe_id_template: &spec.spiffe_id_template,
            parent_id_template: spec.parent_id_template.as_deref(),
            dns_name_templates: &spec.dns_name_templates,
            workload_selector_templates: &spec.workload_selector_templates,
        },
        default_parent_id_template,
    )?;

    if let Some(selector) = &spec.pod_selector {
        selector.validate()?;
    }
    if let Some(selector) = &spec.namespace_selector {
        selector.validate()?;
    }

    let mut federates_with = BTreeSet::new();
    for name in &spec.federates_with {
        let trust_domain =
            TrustDomain::new(name).map_err(|_| Error::FederatesWith(name.clone()))?;
        federates_with.insert(trust_domain);
    }

    Ok(ParsedClusterSpiffeId {
        meta: resource_meta(&resource.metadata),
        templates,
        pod_selector: spec.pod_selector.clone(),
        namespace_selector: spec.namespace_selector.clone(),
        x509_svid_ttl: spec.ttl_seconds,
        jwt_svid_ttl: spec.jwt_ttl_seconds,
        federates_with,
        admin: spec.admin,
        downstream: spec.downstream,
        auto_populate_dns_names: spec.auto_populate_dns_names,
        hint: spec.hint.clone(),
        class_name: spec.class_name.clone(),
        fallback: spec.fallback,
    })
}

/// Admission validator: accept or reject, nothing else.
pub fn validate_cluster_spiffe_id(
    resource: &ClusterSpiffeId,
    default_parent_id_template: &str,
) -> Result<(), Error> {
    parse_cluster_spiffe_id(resource, default_parent_id_template).map(|_| ())
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use crate::label_selector::LabelSelectorRequirement;

    use super::*;

    const DEFAULT_PARENT: &str = entry_renderer::DEFAULT_PARENT_ID_TEMPLATE;

    fn resource(spec: ClusterSpiffeIdSpec) -> ClusterSpiffeId {
        ClusterSpiffeId {
            api_version: crate::API_VERSION.to_string(),
            kind: crate::KIND_CLUSTER_SPIFFE_ID.to_string(),
            metadata: ObjectMeta {
                name: Some("rule".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn accepts_a_plain_rule() {
        let parsed = parse_cluster_spiffe_id(
            &resource(ClusterSpiffeIdSpec {
                spiffe_id_template:
                    "spiffe://td.test/ns/{{ PodMeta.namespace }}/sa/{{ PodSpec.serviceAccountName }}"
                        .to_string(),
                federates_with: vec!["other.test".to_string()],
                ..Default::default()
            }),
            DEFAULT_PARENT,
        )
        .unwrap();

        assert_eq!(parsed.meta.name, "rule");
        assert_eq!(parsed.federates_with.len(), 1);
    }

    #[test]
    fn rejects_empty_spiffe_id_template() {
        let error = validate_cluster_spiffe_id(
            &resource(ClusterSpiffeIdSpec::default()),
            DEFAULT_PARENT,
        )
        .unwrap_err();
        assert_matches!(
            error,
            Error::Template(entry_renderer::error::Error::EmptySpiffeIdTemplate)
        );
    }

    #[test]
    fn rejects_duplicate_dns_name_templates() {
        let error = validate_cluster_spiffe_id(
            &resource(ClusterSpiffeIdSpec {
                spiffe_id_template: "spiffe://td.test/x".to_string(),
                dns_name_templates: vec!["a.example".to_string(), "a.example".to_string()],
                ..Default::default()
            }),
            DEFAULT_PARENT,
        )
        .unwrap_err();
        assert_matches!(
            error,
            Error::Template(entry_renderer::error::Error::DuplicateDnsNameTemplate(_))
        );
    }

    #[test]
    fn rejects_bad_federates_with() {
        let error = validate_cluster_spiffe_id(
            &resource(ClusterSpiffeIdSpec {
                spiffe_id_template: "spiffe://td.test/x".to_string(),
                federates_with: vec!["NOT a domain".to_string()],
                ..Default::default()
            }),
            DEFAULT_PARENT,
        )
        .unwrap_err();
        assert_matches!(error, Error::FederatesWith(_));
    }

    #[test]
    fn rejects_bad_label_selector() {
        let error = validate_cluster_spiffe_id(
            &resource(ClusterSpiffeIdSpec {
                spiffe_id_template: "spiffe://td.test/x".to_string(),
                pod_selector: Some(LabelSelector {
                    match_expressions: vec![LabelSelectorRequirement {
                        key: "k".to_string(),
                        operator: "Maybe".to_string(),
                        values: Vec::new(),
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }),
            DEFAULT_PARENT,
        )
        .unwrap_err();
        assert_matches!(error, Error::LabelSelector(_));
    }

    #[test]
    fn spec_parses_from_yaml() {
        let yaml = r#"
apiVersion: spire.spiffe.io/v1alpha1
kind: ClusterSPIFFEID
metadata:
  name: default-rule
spec:
  spiffeIDTemplate: spiffe://td.test/ns/{{ PodMeta.namespace }}
  dnsNameTemplates:
    - "{{ PodMeta.name }}.svc.example"
  podSelector:
    matchLabels:
      app: api
  ttl: 300
  autoPopulateDNSNames: true
"#;
        let resource: ClusterSpiffeId = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.spec.ttl_seconds, 300);
        assert!(resource.spec.auto_populate_dns_names);
        assert!(resource.spec.pod_selector.is_some());

        parse_cluster_spiffe_id(&resource, DEFAULT_PARENT).unwrap();
    }
}
