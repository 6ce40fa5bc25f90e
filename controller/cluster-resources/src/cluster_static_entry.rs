// Copyright (c) Microsoft. All rights reserved.

use std::collections::{BTreeSet, HashSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use core_objects::{RegistrationEntry, ResourceMeta, Selector, TrustDomain, SPIFFEID};

use crate::{error::Error, resource_meta};

/// A literal registration entry. No templates; rendering is validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterStaticEntry {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ClusterStaticEntrySpec,
    pub status: Option<ClusterStaticEntryStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterStaticEntrySpec {
    #[serde(rename = "spiffeID")]
    pub spiffe_id: String,
    #[serde(rename = "parentID")]
    pub parent_id: String,
    pub selectors: Vec<String>,
    pub federates_with: Vec<String>,
    #[serde(rename = "x509SVIDTTL")]
    pub x509_svid_ttl: u64,
    #[serde(rename = "jwtSVIDTTL")]
    pub jwt_svid_ttl: u64,
    pub dns_names: Vec<String>,
    pub hint: String,
    pub admin: bool,
    pub downstream: bool,
    #[serde(rename = "storeSVID")]
    pub store_svid: bool,
    pub class_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterStaticEntryStatus {
    /// The spec produced a valid entry.
    pub rendered: bool,
    /// Another resource claimed the identity key first.
    pub masked: bool,
    /// The entry exists on the SPIRE server with the declared fields.
    pub set: bool,
}

#[derive(Debug)]
pub struct ParsedClusterStaticEntry {
    pub meta: ResourceMeta,
    pub class_name: String,
    pub entry: RegistrationEntry,
}

/// Render the literal spec into a registration entry. The SPIFFE ID must
/// live in the configured trust domain; DNS names are deduplicated keeping
/// first occurrence.
pub fn parse_cluster_static_entry(
    resource: &ClusterStaticEntry,
    trust_domain: &TrustDomain,
) -> Result<ParsedClusterStaticEntry, Error> {
    let spec = &resource.spec;

    let spiffe_id: SPIFFEID = spec
        .spiffe_id
        .parse()
        .map_err(|_| Error::SpiffeId(spec.spiffe_id.clone()))?;
    if &spiffe_id.trust_domain != trust_domain {
        return Err(Error::WrongTrustDomain {
            id: spec.spiffe_id.clone(),
            expected: trust_domain.to_string(),
        });
    }

    let parent_id: SPIFFEID = spec
        .parent_id
        .parse()
        .map_err(|_| Error::SpiffeId(spec.parent_id.clone()))?;

    let mut selectors = Vec::with_capacity(spec.selectors.len());
    for raw in &spec.selectors {
        let selector: Selector = raw.parse().map_err(|_| Error::Selector(raw.clone()))?;
        selectors.push(selector);
    }

    let mut federates_with = BTreeSet::new();
    for name in &spec.federates_with {
        let trust_domain =
            TrustDomain::new(name).map_err(|_| Error::FederatesWith(name.clone()))?;
        federates_with.insert(trust_domain);
    }

    let mut dns_names = Vec::new();
    let mut seen = HashSet::new();
    for name in &spec.dns_names {
        if seen.insert(name.clone()) {
            dns_names.push(name.clone());
        }
    }

    Ok(ParsedClusterStaticEntry {
        meta: resource_meta(&resource.metadata),
        class_name: spec.class_name.clone(),
        entry: RegistrationEntry {
            id: String::new(),
            spiffe_id,
            parent_id,
            selectors,
            x509_svid_ttl: spec.x509_svid_ttl,
            jwt_svid_ttl: spec.jwt_svid_ttl,
            federates_with,
            dns_names,
            admin: spec.admin,
            downstream: spec.downstream,
            store_svid: spec.store_svid,
            hint: spec.hint.clone(),
        },
    })
}
