// Copyright (c) Microsoft. All rights reserved.

//! Template and selector rendering.
//!
//! Every accepted ClusterSPIFFEID carries text templates for the SPIFFE ID,
//! the parent ID, DNS names and workload selectors. They are compiled once
//! at admission and rendered per pod against a fixed data context:
//! `TrustDomain`, `ClusterName`, `ClusterDomain`, `PodMeta`, `PodSpec`,
//! `NodeMeta`, `NodeSpec` (object fields use their wire names, e.g.
//! `{{ PodSpec.serviceAccountName }}`).

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

pub mod error;

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Endpoints, Node, Pod};
use tera::Tera;

use core_objects::{Selector, SPIFFEID, TrustDomain};

use error::Error;

/// Default parent ID template: the PSAT-attested agent running the pod's
/// node.
pub const DEFAULT_PARENT_ID_TEMPLATE: &str =
    "spiffe://{{ TrustDomain }}/spire/agent/k8s_psat/{{ ClusterName }}/{{ NodeMeta.uid }}";

const SPIFFE_ID_TEMPLATE: &str = "spiffe_id";
const PARENT_ID_TEMPLATE: &str = "parent_id";
const DNS_NAME_TEMPLATE_PREFIX: &str = "dns_name_";
const SELECTOR_TEMPLATE_PREFIX: &str = "selector_";

/// Process-wide inputs of every render.
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub trust_domain: TrustDomain,
    pub cluster_name: String,
    pub cluster_domain: Option<String>,
}

/// The compiled template set of one ClusterSPIFFEID.
#[derive(Debug)]
pub struct CompiledTemplates {
    tera: Tera,
    dns_name_count: usize,
    selector_count: usize,
}

/// Raw template sources, as they appear in the resource spec.
pub struct TemplateSources<'a> {
    pub spiffe_id_template: &'a str,
    /// Per-spec override of the process-wide parent template.
    pub parent_id_template: Option<&'a str>,
    pub dns_name_templates: &'a [String],
    pub workload_selector_templates: &'a [String],
}

/// What one pod renders to. The reconciler combines this with the literal
/// spec fields (TTLs, flags, federation) into a registration entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedIdentity {
    pub spiffe_id: SPIFFEID,
    pub parent_id: SPIFFEID,
    pub selectors: Vec<Selector>,
    pub dns_names: Vec<String>,
}

impl CompiledTemplates {
    /// Compile all templates. Parse failures and duplicate DNS-name
    /// templates (by raw source text) are admission errors.
    pub fn new(
        sources: &TemplateSources<'_>,
        default_parent_id_template: &str,
    ) -> Result<Self, Error> {
        if sources.spiffe_id_template.is_empty() {
            return Err(Error::EmptySpiffeIdTemplate);
        }

        let mut seen_dns_templates = HashSet::new();
        for raw in sources.dns_name_templates {
            if !seen_dns_templates.insert(raw.as_str()) {
                return Err(Error::DuplicateDnsNameTemplate(raw.clone()));
            }
        }

        let mut tera = Tera::default();

        tera.add_raw_template(SPIFFE_ID_TEMPLATE, sources.spiffe_id_template)
            .map_err(|err| Error::TemplateParse {
                template: sources.spiffe_id_template.to_string(),
                source: err,
            })?;

        let parent = sources
            .parent_id_template
            .unwrap_or(default_parent_id_template);
        tera.add_raw_template(PARENT_ID_TEMPLATE, parent)
            .map_err(|err| Error::TemplateParse {
                template: parent.to_string(),
                source: err,
            })?;

        for (index, raw) in sources.dns_name_templates.iter().enumerate() {
            tera.add_raw_template(&format!("{DNS_NAME_TEMPLATE_PREFIX}{index}"), raw)
                .map_err(|err| Error::TemplateParse {
                    template: raw.clone(),
                    source: err,
                })?;
        }

        for (index, raw) in sources.workload_selector_templates.iter().enumerate() {
            tera.add_raw_template(&format!("{SELECTOR_TEMPLATE_PREFIX}{index}"), raw)
                .map_err(|err| Error::TemplateParse {
                    template: raw.clone(),
                    source: err,
                })?;
        }

        Ok(CompiledTemplates {
            tera,
            dns_name_count: sources.dns_name_templates.len(),
            selector_count: sources.workload_selector_templates.len(),
        })
    }

    /// Render one pod. `endpoints` holds the Endpoints objects referencing
    /// this pod; they only contribute names when `auto_populate_dns_names`
    /// is set.
    pub fn render(
        &self,
        config: &RenderConfig,
        pod: &Pod,
        node: &Node,
        endpoints: &[Endpoints],
        auto_populate_dns_names: bool,
    ) -> Result<RenderedIdentity, Error> {
        let context = render_context(config, pod, node)?;

        let spiffe_id = self.render_spiffe_id(SPIFFE_ID_TEMPLATE, &context, config)?;
        let parent_id = self.render_spiffe_id(PARENT_ID_TEMPLATE, &context, config)?;

        let mut selectors = Vec::with_capacity(self.selector_count + 1);
        let pod_uid = pod.metadata.uid.clone().unwrap_or_default();
        selectors.push(Selector::new("k8s", &format!("pod-uid:{pod_uid}")));
        for index in 0..self.selector_count {
            let rendered = self.render_one(&format!("{SELECTOR_TEMPLATE_PREFIX}{index}"), &context)?;
            let selector = rendered
                .parse()
                .map_err(|_| Error::InvalidRenderedSelector(rendered))?;
            selectors.push(selector);
        }

        let mut dns_names = Vec::new();
        let mut seen = HashSet::new();
        for index in 0..self.dns_name_count {
            let rendered = self.render_one(&format!("{DNS_NAME_TEMPLATE_PREFIX}{index}"), &context)?;
            if rendered.is_empty() {
                return Err(Error::EmptyRenderedDnsName);
            }
            push_dns_name(&mut dns_names, &mut seen, rendered);
        }

        if auto_populate_dns_names {
            for name in endpoint_dns_names(endpoints, config.cluster_domain.as_deref()) {
                push_dns_name(&mut dns_names, &mut seen, name);
            }
        }

        Ok(RenderedIdentity {
            spiffe_id,
            parent_id,
            selectors,
            dns_names,
        })
    }

    fn render_one(&self, name: &str, context: &tera::Context) -> Result<String, Error> {
        self.tera
            .render(name, context)
            .map_err(|err| Error::TemplateRender {
                template: name.to_string(),
                source: err,
            })
    }

    fn render_spiffe_id(
        &self,
        name: &str,
        context: &tera::Context,
        config: &RenderConfig,
    ) -> Result<SPIFFEID, Error> {
        let rendered = self.render_one(name, context)?;
        let id: SPIFFEID = rendered
            .parse()
            .map_err(|_| Error::InvalidRenderedSpiffeId(rendered.clone()))?;

        if id.trust_domain != config.trust_domain {
            return Err(Error::WrongTrustDomain {
                id: rendered,
                expected: config.trust_domain.to_string(),
            });
        }

        Ok(id)
    }
}

fn render_context(config: &RenderConfig, pod: &Pod, node: &Node) -> Result<tera::Context, Error> {
    let mut context = tera::Context::new();

    context.insert("TrustDomain", config.trust_domain.as_str());
    context.insert("ClusterName", &config.cluster_name);
    context.insert(
        "ClusterDomain",
        config.cluster_domain.as_deref().unwrap_or(""),
    );

    context.insert("PodMeta", &object_value(&pod.metadata)?);
    context.insert("PodSpec", &object_value(&pod.spec.clone().unwrap_or_default())?);
    context.insert("NodeMeta", &object_value(&node.metadata)?);
    context.insert("NodeSpec", &object_value(&node.spec.clone().unwrap_or_default())?);

    Ok(context)
}

// Serialize through JSON so templates address fields by their wire names.
// Explicit nulls become empty strings; a template referencing a field the
// object does not carry at all is a render failure.
fn object_value<T: serde::Serialize>(object: &T) -> Result<tera::Value, Error> {
    let serialized = serde_json::to_value(object).map_err(Error::ContextSerialization)?;
    Ok(normalize(serialized))
}

fn normalize(value: tera::Value) -> tera::Value {
    match value {
        tera::Value::Object(map) => tera::Value::Object(
            map.into_iter().map(|(k, v)| (k, normalize(v))).collect(),
        ),
        tera::Value::Null => tera::Value::String(String::new()),
        other => other,
    }
}

fn push_dns_name(names: &mut Vec<String>, seen: &mut HashSet<String>, name: String) {
    if seen.insert(name.clone()) {
        names.push(name);
    }
}

/// The names a service endpoint contributes for a pod:
/// `{name}`, `{name}.{ns}`, `{name}.{ns}.svc` and, when the cluster domain
/// is known, `{name}.{ns}.svc.{domain}`. Returned sorted; they are appended
/// after all template-rendered names.
fn endpoint_dns_names(endpoints: &[Endpoints], cluster_domain: Option<&str>) -> Vec<String> {
    let mut names = Vec::new();

    for endpoint in endpoints {
        let (name, namespace) = match (&endpoint.metadata.name, &endpoint.metadata.namespace) {
            (Some(name), Some(namespace)) => (name, namespace),
            _ => continue,
        };

        names.push(name.clone());
        names.push(format!("{name}.{namespace}"));
        names.push(format!("{name}.{namespace}.svc"));
        if let Some(domain) = cluster_domain {
            if !domain.is_empty() {
                names.push(format!("{name}.{namespace}.svc.{domain}"));
            }
        }
    }

    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeSpec, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use matches::assert_matches;

    use super::*;

    fn config() -> RenderConfig {
        RenderConfig {
            trust_domain: TrustDomain::new("td.test").unwrap(),
            cluster_name: "demo".to_string(),
            cluster_domain: Some("cluster.local".to_string()),
        }
    }

    fn pod(namespace: &str, service_account: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{uid}")),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(service_account.to_string()),
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(uid: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            ..Default::default()
        }
    }

    fn endpoints(name: &str, namespace: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn compile(sources: &TemplateSources<'_>) -> CompiledTemplates {
        CompiledTemplates::new(sources, DEFAULT_PARENT_ID_TEMPLATE).unwrap()
    }

    #[test]
    fn renders_spiffe_id_and_default_parent() {
        let templates = compile(&TemplateSources {
            spiffe_id_template:
                "spiffe://td.test/ns/{{ PodMeta.namespace }}/sa/{{ PodSpec.serviceAccountName }}",
            parent_id_template: None,
            dns_name_templates: &[],
            workload_selector_templates: &[],
        });

        let rendered = templates
            .render(&config(), &pod("a", "default", "uid-1"), &node("node-uid"), &[], false)
            .unwrap();

        assert_eq!(
            rendered.spiffe_id.to_string(),
            "spiffe://td.test/ns/a/sa/default"
        );
        assert_eq!(
            rendered.parent_id.to_string(),
            "spiffe://td.test/spire/agent/k8s_psat/demo/node-uid"
        );
        assert_eq!(
            rendered.selectors,
            vec![Selector::new("k8s", "pod-uid:uid-1")]
        );
    }

    #[test]
    fn parent_override_wins() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: Some("spiffe://td.test/my-agent/{{ NodeMeta.uid }}"),
            dns_name_templates: &[],
            workload_selector_templates: &[],
        });

        let rendered = templates
            .render(&config(), &pod("a", "sa", "u"), &node("n-uid"), &[], false)
            .unwrap();
        assert_eq!(
            rendered.parent_id.to_string(),
            "spiffe://td.test/my-agent/n-uid"
        );
    }

    #[test]
    fn foreign_trust_domain_is_a_render_failure() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://other.test/workload",
            parent_id_template: None,
            dns_name_templates: &[],
            workload_selector_templates: &[],
        });

        let error = templates
            .render(&config(), &pod("a", "sa", "u"), &node("n"), &[], false)
            .unwrap_err();
        assert_matches!(error, Error::WrongTrustDomain { .. });
    }

    #[test]
    fn selector_templates_are_parsed() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: None,
            dns_name_templates: &[],
            workload_selector_templates: &[
                "k8s:ns:{{ PodMeta.namespace }}".to_string(),
                "k8s:sa:{{ PodSpec.serviceAccountName }}".to_string(),
            ],
        });

        let rendered = templates
            .render(&config(), &pod("prod", "api", "u"), &node("n"), &[], false)
            .unwrap();

        assert_eq!(
            rendered.selectors,
            vec![
                Selector::new("k8s", "pod-uid:u"),
                Selector::new("k8s", "ns:prod"),
                Selector::new("k8s", "sa:api"),
            ]
        );
    }

    #[test]
    fn bad_selector_rendering_fails() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: None,
            dns_name_templates: &[],
            workload_selector_templates: &["noseparator".to_string()],
        });

        let error = templates
            .render(&config(), &pod("a", "sa", "u"), &node("n"), &[], false)
            .unwrap_err();
        assert_matches!(error, Error::InvalidRenderedSelector(_));
    }

    #[test]
    fn dns_names_dedupe_in_first_occurrence_order() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: None,
            dns_name_templates: &[
                "{{ PodMeta.name }}.example".to_string(),
                "static.example".to_string(),
                // Renders to the same value as the first template.
                "pod-{{ PodMeta.uid }}.example".to_string(),
            ],
            workload_selector_templates: &[],
        });

        let rendered = templates
            .render(&config(), &pod("a", "sa", "u"), &node("n"), &[], false)
            .unwrap();

        assert_eq!(
            rendered.dns_names,
            vec!["pod-u.example".to_string(), "static.example".to_string()]
        );
    }

    #[test]
    fn duplicate_dns_templates_are_rejected_at_compile() {
        let error = CompiledTemplates::new(
            &TemplateSources {
                spiffe_id_template: "spiffe://td.test/workload",
                parent_id_template: None,
                dns_name_templates: &["same.example".to_string(), "same.example".to_string()],
                workload_selector_templates: &[],
            },
            DEFAULT_PARENT_ID_TEMPLATE,
        )
        .unwrap_err();

        assert_matches!(error, Error::DuplicateDnsNameTemplate(_));
    }

    #[test]
    fn endpoint_names_append_sorted_after_templates() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: None,
            dns_name_templates: &["first.example".to_string()],
            workload_selector_templates: &[],
        });

        let rendered = templates
            .render(
                &config(),
                &pod("ns-1", "sa", "u"),
                &node("n"),
                &[endpoints("svc-b", "ns-1"), endpoints("svc-a", "ns-1")],
                true,
            )
            .unwrap();

        assert_eq!(
            rendered.dns_names,
            vec![
                "first.example".to_string(),
                "svc-a".to_string(),
                "svc-a.ns-1".to_string(),
                "svc-a.ns-1.svc".to_string(),
                "svc-a.ns-1.svc.cluster.local".to_string(),
                "svc-b".to_string(),
                "svc-b.ns-1".to_string(),
                "svc-b.ns-1.svc".to_string(),
                "svc-b.ns-1.svc.cluster.local".to_string(),
            ]
        );
    }

    #[test]
    fn endpoint_names_skipped_without_auto_populate() {
        let templates = compile(&TemplateSources {
            spiffe_id_template: "spiffe://td.test/workload",
            parent_id_template: None,
            dns_name_templates: &[],
            workload_selector_templates: &[],
        });

        let rendered = templates
            .render(
                &config(),
                &pod("ns-1", "sa", "u"),
                &node("n"),
                &[endpoints("svc-a", "ns-1")],
                false,
            )
            .unwrap();
        assert!(rendered.dns_names.is_empty());
    }

    #[test]
    fn template_parse_error_is_caught_at_compile() {
        let error = CompiledTemplates::new(
            &TemplateSources {
                spiffe_id_template: "spiffe://td.test/{{ unclosed",
                parent_id_template: None,
                dns_name_templates: &[],
                workload_selector_templates: &[],
            },
            DEFAULT_PARENT_ID_TEMPLATE,
        )
        .unwrap_err();

        assert_matches!(error, Error::TemplateParse { .. });
    }
}
