// Copyright (c) Microsoft. All rights reserved.

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client,
};
use serde::Serialize;

use cluster_resources::{
    ClusterFederatedTrustDomain, ClusterFederatedTrustDomainStatus, ClusterSpiffeId,
    ClusterSpiffeIdStatus, ClusterStaticEntry, ClusterStaticEntryStatus, LabelSelector,
};

use crate::{endpoints_reference_pod, ClusterState, Result};

/// [`ClusterState`] backed by the Kubernetes API server.
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    #[must_use]
    pub fn new(client: Client) -> Self {
        KubeClusterState { client }
    }

    fn list_params(selector: Option<&LabelSelector>) -> ListParams {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params.label_selector = selector.selector_string();
        }
        params
    }

    async fn patch_status<K, S>(&self, api: Api<K>, name: &str, status: &S) -> Result<()>
    where
        K: kube::core::Resource<DynamicType = ()>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        S: Serialize,
    {
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterState for KubeClusterState {
    async fn list_cluster_spiffe_ids(&self) -> Result<Vec<ClusterSpiffeId>> {
        let api: Api<ClusterSpiffeId> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_cluster_static_entries(&self) -> Result<Vec<ClusterStaticEntry>> {
        let api: Api<ClusterStaticEntry> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_cluster_federated_trust_domains(
        &self,
    ) -> Result<Vec<ClusterFederatedTrustDomain>> {
        let api: Api<ClusterFederatedTrustDomain> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn list_namespaces(&self, selector: Option<&LabelSelector>) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&Self::list_params(selector)).await?;
        Ok(list.items)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&Self::list_params(selector)).await?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn endpoints_for_pod(&self, namespace: &str, pod_uid: &str) -> Result<Vec<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter(|endpoints| endpoints_reference_pod(endpoints, pod_uid))
            .collect())
    }

    async fn update_cluster_spiffe_id_status(
        &self,
        name: &str,
        status: &ClusterSpiffeIdStatus,
    ) -> Result<()> {
        let api: Api<ClusterSpiffeId> = Api::all(self.client.clone());
        self.patch_status(api, name, status).await
    }

    async fn update_cluster_static_entry_status(
        &self,
        name: &str,
        status: &ClusterStaticEntryStatus,
    ) -> Result<()> {
        let api: Api<ClusterStaticEntry> = Api::all(self.client.clone());
        self.patch_status(api, name, status).await
    }

    async fn update_cluster_federated_trust_domain_status(
        &self,
        name: &str,
        status: &ClusterFederatedTrustDomainStatus,
    ) -> Result<()> {
        let api: Api<ClusterFederatedTrustDomain> = Api::all(self.client.clone());
        self.patch_status(api, name, status).await
    }
}
