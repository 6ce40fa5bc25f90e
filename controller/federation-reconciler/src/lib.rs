// Copyright (c) Microsoft. All rights reserved.

//! The federation-relationship engine. Same pass shape as the entry engine
//! but keyed by trust domain: parse the ClusterFederatedTrustDomain
//! resources, resolve trust-domain conflicts in favor of the oldest
//! resource, and converge the server's relationship set. Bundle contents
//! ride along on create and update but never trigger an update by
//! themselves.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use log::{info, warn};

use cluster_resources::{
    parse_cluster_federated_trust_domain, ClassMatcher, ClusterFederatedTrustDomainStatus,
};
use core_objects::{FederationRelationship, TrustDomain};
use resource_loader::ClusterState;
use spire_client::SpireClient;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

pub struct FederationReconciler {
    state: Arc<dyn ClusterState>,
    spire: Arc<SpireClient>,
    class_matcher: ClassMatcher,
}

struct Claim {
    name: String,
    stored: Option<ClusterFederatedTrustDomainStatus>,
    relationship: Option<FederationRelationship>,
    set: bool,
}

impl FederationReconciler {
    #[must_use]
    pub fn new(
        state: Arc<dyn ClusterState>,
        spire: Arc<SpireClient>,
        class_matcher: ClassMatcher,
    ) -> Self {
        FederationReconciler {
            state,
            spire,
            class_matcher,
        }
    }

    pub async fn reconcile_pass(&self) -> Result<()> {
        let mut claims = self.build_claims().await?;

        let desired: BTreeMap<TrustDomain, usize> = claims
            .iter()
            .enumerate()
            .filter_map(|(index, claim)| {
                claim
                    .relationship
                    .as_ref()
                    .map(|relationship| (relationship.trust_domain.clone(), index))
            })
            .collect();

        let current = self.spire.list_federation_relationships().await?;
        let mut current_by_domain: BTreeMap<TrustDomain, FederationRelationship> = current
            .into_iter()
            .map(|relationship| (relationship.trust_domain.clone(), relationship))
            .collect();

        let mut creates: Vec<(FederationRelationship, usize)> = Vec::new();
        let mut updates: Vec<(FederationRelationship, usize)> = Vec::new();

        for (trust_domain, index) in &desired {
            let declared = claims[*index]
                .relationship
                .clone()
                .expect("desired indexes only relationship-bearing claims");

            match current_by_domain.remove(trust_domain) {
                None => creates.push((declared, *index)),
                Some(existing) => {
                    if existing.same_config(&declared) {
                        claims[*index].set = true;
                    } else {
                        updates.push((declared, *index));
                    }
                }
            }
        }

        // Whatever remains on the server has no declaring resource.
        let deletes: Vec<TrustDomain> = current_by_domain.into_keys().collect();

        if !deletes.is_empty() {
            info!("Deleting {} federation relationships", deletes.len());
            let results = self.spire.delete_federation_relationships(deletes).await?;
            for result in results {
                if !result.status.is_ok() {
                    warn!(
                        "Failed to delete federation relationship for {}: {}",
                        result.trust_domain, result.status.message
                    );
                }
            }
        }

        if !creates.is_empty() {
            info!("Creating {} federation relationships", creates.len());
            let relationships = creates.iter().map(|(r, _)| r.clone()).collect();
            let results = self.spire.create_federation_relationships(relationships).await?;
            for ((relationship, index), result) in creates.into_iter().zip(results) {
                if result.status.is_ok() {
                    claims[index].set = true;
                } else {
                    warn!(
                        "Failed to create federation relationship for {}: {}",
                        relationship.trust_domain, result.status.message
                    );
                }
            }
        }

        if !updates.is_empty() {
            info!("Updating {} federation relationships", updates.len());
            let relationships = updates.iter().map(|(r, _)| r.clone()).collect();
            let results = self.spire.update_federation_relationships(relationships).await?;
            for ((relationship, index), result) in updates.into_iter().zip(results) {
                if result.status.is_ok() {
                    claims[index].set = true;
                } else {
                    warn!(
                        "Failed to update federation relationship for {}: {}",
                        relationship.trust_domain, result.status.message
                    );
                }
            }
        }

        for claim in claims {
            let status = ClusterFederatedTrustDomainStatus { set: claim.set };
            if claim.stored.clone().unwrap_or_default() != status {
                self.state
                    .update_cluster_federated_trust_domain_status(&claim.name, &status)
                    .await?;
            }
        }

        Ok(())
    }

    /// Parse all resources of our class and resolve trust-domain conflicts:
    /// among resources naming the same trust domain, the earliest created
    /// (ties broken by UID) wins, the rest contribute nothing.
    async fn build_claims(&self) -> Result<Vec<Claim>> {
        let resources = self.state.list_cluster_federated_trust_domains().await?;

        let mut claims = Vec::with_capacity(resources.len());
        let mut parsed = Vec::new();
        for resource in resources {
            if !self.class_matcher.matches(&resource.spec.class_name) {
                continue;
            }
            let name = resource.metadata.name.clone().unwrap_or_default();
            let stored = resource.status.clone();

            match parse_cluster_federated_trust_domain(&resource) {
                Ok(normalized) => parsed.push((normalized, name, stored)),
                Err(err) => {
                    warn!("ClusterFederatedTrustDomain {} does not parse: {}", name, err);
                    claims.push(Claim {
                        name,
                        stored,
                        relationship: None,
                        set: false,
                    });
                }
            }
        }

        parsed.sort_by(|a, b| {
            a.0.meta
                .creation_timestamp
                .cmp(&b.0.meta.creation_timestamp)
                .then_with(|| a.0.meta.uid.cmp(&b.0.meta.uid))
        });

        let mut claimed: BTreeMap<TrustDomain, String> = BTreeMap::new();
        for (normalized, name, stored) in parsed {
            let trust_domain = normalized.relationship.trust_domain.clone();
            match claimed.get(&trust_domain) {
                Some(owner) => {
                    warn!(
                        "ClusterFederatedTrustDomain {}: trust domain {} is already claimed by {}; ignoring",
                        name, trust_domain, owner
                    );
                    claims.push(Claim {
                        name,
                        stored,
                        relationship: None,
                        set: false,
                    });
                }
                None => {
                    claimed.insert(trust_domain, name.clone());
                    claims.push(Claim {
                        name,
                        stored,
                        relationship: Some(normalized.relationship),
                        set: false,
                    });
                }
            }
        }

        Ok(claims)
    }
}

#[async_trait::async_trait]
impl reconcile_trigger::Reconciler for FederationReconciler {
    fn name(&self) -> &str {
        "federation"
    }

    async fn reconcile(&self) -> Result<()> {
        self.reconcile_pass().await
    }
}
