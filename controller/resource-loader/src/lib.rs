// Copyright (c) Microsoft. All rights reserved.

//! Access to the declarative inputs of both reconcilers: the three custom
//! resource kinds plus the pods, namespaces, nodes and endpoints they
//! select. Backed either by the Kubernetes API ([`KubeClusterState`]) or by
//! a directory of manifests ([`StaticClusterState`]); the engines only see
//! the [`ClusterState`] trait, so both modes run the same code.

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
pub mod kube_state;
pub mod static_state;

#[cfg(any(test, feature = "tests"))]
pub mod fake;

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod};

use cluster_resources::{
    ClusterFederatedTrustDomain, ClusterFederatedTrustDomainStatus, ClusterSpiffeId,
    ClusterSpiffeIdStatus, ClusterStaticEntry, ClusterStaticEntryStatus, LabelSelector,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// The object cache as the reconcilers see it. Listing is whole-world per
/// pass; status writers are invoked only when a status actually changed.
#[async_trait::async_trait]
pub trait ClusterState: Sync + Send {
    async fn list_cluster_spiffe_ids(&self) -> Result<Vec<ClusterSpiffeId>>;

    async fn list_cluster_static_entries(&self) -> Result<Vec<ClusterStaticEntry>>;

    async fn list_cluster_federated_trust_domains(&self)
        -> Result<Vec<ClusterFederatedTrustDomain>>;

    async fn list_namespaces(&self, selector: Option<&LabelSelector>) -> Result<Vec<Namespace>>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>>;

    /// `Ok(None)` when the node is gone; the caller skips the pod.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Endpoints objects with at least one address targeting the pod.
    async fn endpoints_for_pod(&self, namespace: &str, pod_uid: &str) -> Result<Vec<Endpoints>>;

    async fn update_cluster_spiffe_id_status(
        &self,
        name: &str,
        status: &ClusterSpiffeIdStatus,
    ) -> Result<()>;

    async fn update_cluster_static_entry_status(
        &self,
        name: &str,
        status: &ClusterStaticEntryStatus,
    ) -> Result<()>;

    async fn update_cluster_federated_trust_domain_status(
        &self,
        name: &str,
        status: &ClusterFederatedTrustDomainStatus,
    ) -> Result<()>;
}

/// Whether any endpoints subset address targets the given pod UID.
#[must_use]
pub fn endpoints_reference_pod(endpoints: &Endpoints, pod_uid: &str) -> bool {
    let Some(subsets) = &endpoints.subsets else {
        return false;
    };

    subsets.iter().any(|subset| {
        let addresses = subset.addresses.iter().flatten();
        let not_ready = subset.not_ready_addresses.iter().flatten();
        addresses.chain(not_ready).any(|address| {
            address
                .target_ref
                .as_ref()
                .and_then(|target| target.uid.as_deref())
                == Some(pod_uid)
        })
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn endpoints_with_target(uid: Option<&str>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    target_ref: uid.map(|uid| ObjectReference {
                        uid: Some(uid.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn endpoints_match_by_target_uid() {
        assert!(endpoints_reference_pod(
            &endpoints_with_target(Some("pod-1")),
            "pod-1"
        ));
        assert!(!endpoints_reference_pod(
            &endpoints_with_target(Some("pod-2")),
            "pod-1"
        ));
        assert!(!endpoints_reference_pod(&endpoints_with_target(None), "pod-1"));
    }
}
