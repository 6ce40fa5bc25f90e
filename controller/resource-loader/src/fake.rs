// Copyright (c) Microsoft. All rights reserved.

//! In-memory cluster for reconciler tests: fixed object sets, label
//! selection evaluated locally, status writes recorded.

use std::{collections::HashMap, sync::Mutex};

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod};

use cluster_resources::{
    ClusterFederatedTrustDomain, ClusterFederatedTrustDomainStatus, ClusterSpiffeId,
    ClusterSpiffeIdStatus, ClusterStaticEntry, ClusterStaticEntryStatus, LabelSelector,
};

use crate::{endpoints_reference_pod, ClusterState, Result};

#[derive(Default)]
pub struct FakeClusterState {
    pub cluster_spiffe_ids: Mutex<Vec<ClusterSpiffeId>>,
    pub cluster_static_entries: Mutex<Vec<ClusterStaticEntry>>,
    pub cluster_federated_trust_domains: Mutex<Vec<ClusterFederatedTrustDomain>>,
    pub namespaces: Mutex<Vec<Namespace>>,
    pub pods: Mutex<Vec<Pod>>,
    pub nodes: Mutex<Vec<Node>>,
    pub endpoints: Mutex<Vec<Endpoints>>,

    pub spiffe_id_statuses: Mutex<HashMap<String, ClusterSpiffeIdStatus>>,
    pub static_entry_statuses: Mutex<HashMap<String, ClusterStaticEntryStatus>>,
    pub federated_trust_domain_statuses: Mutex<HashMap<String, ClusterFederatedTrustDomainStatus>>,
    pub status_writes: Mutex<Vec<String>>,
}

impl FakeClusterState {
    pub fn add_cluster_spiffe_id(&self, resource: ClusterSpiffeId) {
        self.cluster_spiffe_ids.lock().unwrap().push(resource);
    }

    pub fn add_cluster_static_entry(&self, resource: ClusterStaticEntry) {
        self.cluster_static_entries.lock().unwrap().push(resource);
    }

    pub fn add_cluster_federated_trust_domain(&self, resource: ClusterFederatedTrustDomain) {
        self.cluster_federated_trust_domains
            .lock()
            .unwrap()
            .push(resource);
    }

    pub fn add_namespace(&self, namespace: Namespace) {
        self.namespaces.lock().unwrap().push(namespace);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.endpoints.lock().unwrap().push(endpoints);
    }

    pub fn spiffe_id_status(&self, name: &str) -> Option<ClusterSpiffeIdStatus> {
        self.spiffe_id_statuses.lock().unwrap().get(name).cloned()
    }

    pub fn static_entry_status(&self, name: &str) -> Option<ClusterStaticEntryStatus> {
        self.static_entry_statuses.lock().unwrap().get(name).cloned()
    }

    pub fn status_write_count(&self) -> usize {
        self.status_writes.lock().unwrap().len()
    }
}

fn labels_of(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta)
    -> std::collections::BTreeMap<String, String> {
    metadata.labels.clone().unwrap_or_default()
}

fn selected(selector: Option<&LabelSelector>, labels: &std::collections::BTreeMap<String, String>)
    -> bool {
    selector.map_or(true, |selector| selector.matches(labels))
}

#[async_trait::async_trait]
impl ClusterState for FakeClusterState {
    async fn list_cluster_spiffe_ids(&self) -> Result<Vec<ClusterSpiffeId>> {
        Ok(self.cluster_spiffe_ids.lock().unwrap().clone())
    }

    async fn list_cluster_static_entries(&self) -> Result<Vec<ClusterStaticEntry>> {
        Ok(self.cluster_static_entries.lock().unwrap().clone())
    }

    async fn list_cluster_federated_trust_domains(
        &self,
    ) -> Result<Vec<ClusterFederatedTrustDomain>> {
        Ok(self.cluster_federated_trust_domains.lock().unwrap().clone())
    }

    async fn list_namespaces(&self, selector: Option<&LabelSelector>) -> Result<Vec<Namespace>> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .iter()
            .filter(|namespace| selected(selector, &labels_of(&namespace.metadata)))
            .cloned()
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| selected(selector, &labels_of(&pod.metadata)))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|node| node.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn endpoints_for_pod(&self, namespace: &str, pod_uid: &str) -> Result<Vec<Endpoints>> {
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|endpoints| endpoints.metadata.namespace.as_deref() == Some(namespace))
            .filter(|endpoints| endpoints_reference_pod(endpoints, pod_uid))
            .cloned()
            .collect())
    }

    async fn update_cluster_spiffe_id_status(
        &self,
        name: &str,
        status: &ClusterSpiffeIdStatus,
    ) -> Result<()> {
        self.status_writes
            .lock()
            .unwrap()
            .push(format!("ClusterSPIFFEID/{name}"));
        self.spiffe_id_statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.clone());
        Ok(())
    }

    async fn update_cluster_static_entry_status(
        &self,
        name: &str,
        status: &ClusterStaticEntryStatus,
    ) -> Result<()> {
        self.status_writes
            .lock()
            .unwrap()
            .push(format!("ClusterStaticEntry/{name}"));
        self.static_entry_statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.clone());
        Ok(())
    }

    async fn update_cluster_federated_trust_domain_status(
        &self,
        name: &str,
        status: &ClusterFederatedTrustDomainStatus,
    ) -> Result<()> {
        self.status_writes
            .lock()
            .unwrap()
            .push(format!("ClusterFederatedTrustDomain/{name}"));
        self.federated_trust_domain_statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.clone());
        Ok(())
    }
}
