// Copyright (c) Microsoft. All rights reserved.

//! Static-manifest mode: the declarative resources come from a directory of
//! YAML files instead of the Kubernetes API. Only `.yaml` files are read;
//! documents of unexpected kinds are skipped. There is no cluster, so pods,
//! namespaces, nodes and endpoints are empty and status writes are held in
//! memory only.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use controller_config::expand_env_vars;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod};
use log::debug;
use serde::de::Deserialize;

use cluster_resources::{
    ClusterFederatedTrustDomain, ClusterFederatedTrustDomainStatus, ClusterSpiffeId,
    ClusterSpiffeIdStatus, ClusterStaticEntry, ClusterStaticEntryStatus, LabelSelector,
    KIND_CLUSTER_FEDERATED_TRUST_DOMAIN, KIND_CLUSTER_SPIFFE_ID, KIND_CLUSTER_STATIC_ENTRY,
};

use crate::{error::Error, ClusterState, Result};

const MANIFEST_SUFFIX: &str = ".yaml";

pub struct StaticClusterState {
    manifest_dir: PathBuf,
    expand_env: bool,
    spiffe_id_statuses: Mutex<HashMap<String, ClusterSpiffeIdStatus>>,
    static_entry_statuses: Mutex<HashMap<String, ClusterStaticEntryStatus>>,
    federated_trust_domain_statuses: Mutex<HashMap<String, ClusterFederatedTrustDomainStatus>>,
}

impl StaticClusterState {
    #[must_use]
    pub fn new(manifest_dir: impl Into<PathBuf>, expand_env: bool) -> Self {
        StaticClusterState {
            manifest_dir: manifest_dir.into(),
            expand_env,
            spiffe_id_statuses: Mutex::new(HashMap::new()),
            static_entry_statuses: Mutex::new(HashMap::new()),
            federated_trust_domain_statuses: Mutex::new(HashMap::new()),
        }
    }

    /// The last status recorded for a ClusterSPIFFEID; static mode has no
    /// store to persist it to.
    #[must_use]
    pub fn recorded_spiffe_id_status(&self, name: &str) -> Option<ClusterSpiffeIdStatus> {
        self.spiffe_id_statuses.lock().unwrap().get(name).cloned()
    }

    #[must_use]
    pub fn recorded_static_entry_status(&self, name: &str) -> Option<ClusterStaticEntryStatus> {
        self.static_entry_statuses.lock().unwrap().get(name).cloned()
    }

    async fn documents_of_kind(&self, kind: &str) -> Result<Vec<serde_yaml::Value>> {
        let mut documents = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.manifest_dir)
            .await
            .map_err(|err| Error::ReadDir {
                path: self.manifest_dir.clone(),
                source: err,
            })?;

        let mut paths = Vec::new();
        while let Some(dir_entry) = dir.next_entry().await.map_err(|err| Error::ReadDir {
            path: self.manifest_dir.clone(),
            source: err,
        })? {
            let path = dir_entry.path();
            if path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(MANIFEST_SUFFIX))
            {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let text = self.read_manifest(&path).await?;
            for document in serde_yaml::Deserializer::from_str(&text) {
                let value = serde_yaml::Value::deserialize(document)
                    .map_err(|err| Error::Parse {
                        path: path.clone(),
                        source: err,
                    })?;

                match value.get("kind").and_then(serde_yaml::Value::as_str) {
                    Some(document_kind) if document_kind == kind => documents.push(value),
                    Some(other) if is_known_kind(other) => {}
                    Some(other) => {
                        debug!("Skipping document of kind {} in {}", other, path.display());
                    }
                    None => {
                        debug!("Skipping document without kind in {}", path.display());
                    }
                }
            }
        }

        Ok(documents)
    }

    async fn read_manifest(&self, path: &Path) -> Result<String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::ReadFile {
                path: path.to_path_buf(),
                source: err,
            })?;

        if self.expand_env {
            Ok(expand_env_vars(&text))
        } else {
            Ok(text)
        }
    }

    fn parse_all<T>(&self, documents: Vec<serde_yaml::Value>) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut parsed = Vec::with_capacity(documents.len());
        for document in documents {
            let resource = serde_yaml::from_value(document).map_err(|err| Error::Parse {
                path: self.manifest_dir.clone(),
                source: err,
            })?;
            parsed.push(resource);
        }
        Ok(parsed)
    }
}

fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        KIND_CLUSTER_SPIFFE_ID | KIND_CLUSTER_STATIC_ENTRY | KIND_CLUSTER_FEDERATED_TRUST_DOMAIN
    )
}

#[async_trait::async_trait]
impl ClusterState for StaticClusterState {
    async fn list_cluster_spiffe_ids(&self) -> Result<Vec<ClusterSpiffeId>> {
        let documents = self.documents_of_kind(KIND_CLUSTER_SPIFFE_ID).await?;
        self.parse_all(documents)
    }

    async fn list_cluster_static_entries(&self) -> Result<Vec<ClusterStaticEntry>> {
        let documents = self.documents_of_kind(KIND_CLUSTER_STATIC_ENTRY).await?;
        self.parse_all(documents)
    }

    async fn list_cluster_federated_trust_domains(
        &self,
    ) -> Result<Vec<ClusterFederatedTrustDomain>> {
        let documents = self
            .documents_of_kind(KIND_CLUSTER_FEDERATED_TRUST_DOMAIN)
            .await?;
        self.parse_all(documents)
    }

    async fn list_namespaces(&self, _selector: Option<&LabelSelector>) -> Result<Vec<Namespace>> {
        Ok(Vec::new())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: Option<&LabelSelector>,
    ) -> Result<Vec<Pod>> {
        Ok(Vec::new())
    }

    async fn get_node(&self, _name: &str) -> Result<Option<Node>> {
        Ok(None)
    }

    async fn endpoints_for_pod(&self, _namespace: &str, _pod_uid: &str) -> Result<Vec<Endpoints>> {
        Ok(Vec::new())
    }

    async fn update_cluster_spiffe_id_status(
        &self,
        name: &str,
        status: &ClusterSpiffeIdStatus,
    ) -> Result<()> {
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
        self.federated_trust_domain_statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_manifest(dir: &tempfile::TempDir, name: &str, content: &str) {
        let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn reads_only_yaml_files_and_known_kinds() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            &dir,
            "resources.yaml",
            r#"
apiVersion: spire.spiffe.io/v1alpha1
kind: ClusterSPIFFEID
metadata:
  name: rule-a
spec:
  spiffeIDTemplate: spiffe://td.test/a
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: ignored
---
apiVersion: spire.spiffe.io/v1alpha1
kind: ClusterStaticEntry
metadata:
  name: static-a
spec:
  spiffeID: spiffe://td.test/static
  parentID: spiffe://td.test/agent
  selectors: ["unix:uid:0"]
"#,
        );
        write_manifest(&dir, "notes.txt", "kind: ClusterSPIFFEID");
        write_manifest(
            &dir,
            "more.yaml",
            r#"
apiVersion: spire.spiffe.io/v1alpha1
kind: ClusterSPIFFEID
metadata:
  name: rule-b
spec:
  spiffeIDTemplate: spiffe://td.test/b
"#,
        );

        let state = StaticClusterState::new(dir.path(), false);

        let rules = state.list_cluster_spiffe_ids().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].metadata.name.as_deref(), Some("rule-b"));
        assert_eq!(rules[1].metadata.name.as_deref(), Some("rule-a"));

        let statics = state.list_cluster_static_entries().await.unwrap();
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].spec.spiffe_id, "spiffe://td.test/static");
    }

    #[tokio::test]
    async fn env_expansion_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("STATIC_STATE_TEST_TD", "td.test");
        write_manifest(
            &dir,
            "rule.yaml",
            r#"
apiVersion: spire.spiffe.io/v1alpha1
kind: ClusterSPIFFEID
metadata:
  name: rule
spec:
  spiffeIDTemplate: spiffe://${STATIC_STATE_TEST_TD}/x
"#,
        );

        let expanded = StaticClusterState::new(dir.path(), true);
        let rules = expanded.list_cluster_spiffe_ids().await.unwrap();
        assert_eq!(rules[0].spec.spiffe_id_template, "spiffe://td.test/x");

        let verbatim = StaticClusterState::new(dir.path(), false);
        let rules = verbatim.list_cluster_spiffe_ids().await.unwrap();
        assert_eq!(
            rules[0].spec.spiffe_id_template,
            "spiffe://${STATIC_STATE_TEST_TD}/x"
        );
    }

    #[tokio::test]
    async fn missing_directory_aborts() {
        let state = StaticClusterState::new("/does/not/exist", false);
        assert!(state.list_cluster_spiffe_ids().await.is_err());
    }

    #[tokio::test]
    async fn malformed_documents_abort() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            &dir,
            "broken.yaml",
            "kind: ClusterSPIFFEID\nmetadata: [not, a, map]\n",
        );

        let state = StaticClusterState::new(dir.path(), false);
        assert!(state.list_cluster_spiffe_ids().await.is_err());
    }

    #[tokio::test]
    async fn statuses_are_recorded_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let state = StaticClusterState::new(dir.path(), false);

        let status = ClusterSpiffeIdStatus::default();
        state
            .update_cluster_spiffe_id_status("rule", &status)
            .await
            .unwrap();
        assert_eq!(state.recorded_spiffe_id_status("rule"), Some(status));
    }
}
