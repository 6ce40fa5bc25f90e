// Copyright (c) Microsoft. All rights reserved.

//! The declarative resources the controller consumes: ClusterSPIFFEID,
//! ClusterStaticEntry and ClusterFederatedTrustDomain. Raw serde shapes,
//! validation (shared by the admission webhook and the static loader) and
//! the normalized forms the reconcilers work on.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::module_name_repetitions
)]

pub mod cluster_federated_trust_domain;
pub mod cluster_spiffe_id;
pub mod cluster_static_entry;
pub mod error;
pub mod label_selector;

pub use cluster_federated_trust_domain::{
    parse_cluster_federated_trust_domain, validate_cluster_federated_trust_domain,
    ClusterFederatedTrustDomain, ClusterFederatedTrustDomainSpec,
    ClusterFederatedTrustDomainStatus, ParsedClusterFederatedTrustDomain,
};
pub use cluster_spiffe_id::{
    parse_cluster_spiffe_id, validate_cluster_spiffe_id, ClusterSpiffeId, ClusterSpiffeIdSpec,
    ClusterSpiffeIdStats, ClusterSpiffeIdStatus, ParsedClusterSpiffeId,
};
pub use cluster_static_entry::{
    parse_cluster_static_entry, ClusterStaticEntry, ClusterStaticEntrySpec,
    ClusterStaticEntryStatus, ParsedClusterStaticEntry,
};
pub use label_selector::{LabelSelector, LabelSelectorRequirement};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use core_objects::ResourceMeta;

pub const GROUP: &str = "spire.spiffe.io";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "spire.spiffe.io/v1alpha1";

pub const KIND_CLUSTER_SPIFFE_ID: &str = "ClusterSPIFFEID";
pub const KIND_CLUSTER_STATIC_ENTRY: &str = "ClusterStaticEntry";
pub const KIND_CLUSTER_FEDERATED_TRUST_DOMAIN: &str = "ClusterFederatedTrustDomain";

/// Decides whether a resource's `class_name` belongs to this controller
/// instance.
#[derive(Clone, Debug, Default)]
pub struct ClassMatcher {
    pub class_name: Option<String>,
    pub watch_classless: bool,
}

impl ClassMatcher {
    #[must_use]
    pub fn matches(&self, resource_class: &str) -> bool {
        match &self.class_name {
            Some(class_name) => {
                resource_class == class_name
                    || (resource_class.is_empty() && self.watch_classless)
            }
            None => true,
        }
    }
}

/// Normalize the Kubernetes object metadata into the form the conflict
/// preference ordering works on.
#[must_use]
pub fn resource_meta(metadata: &ObjectMeta) -> ResourceMeta {
    let to_epoch = |time: &k8s_openapi::apimachinery::pkg::apis::meta::v1::Time| {
        u64::try_from(time.0.timestamp()).unwrap_or(0)
    };

    ResourceMeta {
        name: metadata.name.clone().unwrap_or_default(),
        uid: metadata.uid.clone().unwrap_or_default(),
        creation_timestamp: metadata.creation_timestamp.as_ref().map_or(0, to_epoch),
        deletion_timestamp: metadata.deletion_timestamp.as_ref().map(to_epoch),
    }
}

macro_rules! cluster_resource {
    ($kind_type:ty, $kind_name:expr, $plural:expr) => {
        impl kube::core::Resource for $kind_type {
            type DynamicType = ();

            fn kind(_dt: &()) -> std::borrow::Cow<'_, str> {
                $kind_name.into()
            }

            fn group(_dt: &()) -> std::borrow::Cow<'_, str> {
                crate::GROUP.into()
            }

            fn version(_dt: &()) -> std::borrow::Cow<'_, str> {
                crate::VERSION.into()
            }

            fn plural(_dt: &()) -> std::borrow::Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(
                &mut self,
            ) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

cluster_resource!(
    cluster_spiffe_id::ClusterSpiffeId,
    crate::KIND_CLUSTER_SPIFFE_ID,
    "clusterspiffeids"
);
cluster_resource!(
    cluster_static_entry::ClusterStaticEntry,
    crate::KIND_CLUSTER_STATIC_ENTRY,
    "clusterstaticentries"
);
cluster_resource!(
    cluster_federated_trust_domain::ClusterFederatedTrustDomain,
    crate::KIND_CLUSTER_FEDERATED_TRUST_DOMAIN,
    "clusterfederatedtrustdomains"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_matcher_rules() {
        let unconfigured = ClassMatcher::default();
        assert!(unconfigured.matches(""));
        assert!(unconfigured.matches("somebody-else"));

        let with_class = ClassMatcher {
            class_name: Some("primary".to_string()),
            watch_classless: false,
        };
        assert!(with_class.matches("primary"));
        assert!(!with_class.matches(""));
        assert!(!with_class.matches("other"));

        let classless_too = ClassMatcher {
            class_name: Some("primary".to_string()),
            watch_classless: true,
        };
        assert!(classless_too.matches("primary"));
        assert!(classless_too.matches(""));
        assert!(!classless_too.matches("other"));
    }
}
