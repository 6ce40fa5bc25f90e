// Copyright (c) Microsoft. All rights reserved.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use url::Url;

use core_objects::{
    Bundle, BundleEndpointProfile, FederationRelationship, ResourceMeta, TrustDomain, SPIFFEID,
};

use crate::{error::Error, resource_meta};

/// A link to a foreign trust domain: where to fetch its bundle and how to
/// authenticate the endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterFederatedTrustDomain {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ClusterFederatedTrustDomainSpec,
    pub status: Option<ClusterFederatedTrustDomainStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterFederatedTrustDomainSpec {
    pub trust_domain: String,
    #[serde(rename = "bundleEndpointURL")]
    pub bundle_endpoint_url: String,
    pub bundle_endpoint_profile: BundleEndpointProfileSpec,
    pub trust_domain_bundle: Option<Bundle>,
    pub class_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleEndpointProfileSpec {
    #[serde(rename = "type")]
    pub profile_type: String,
    #[serde(rename = "endpointSPIFFEID")]
    pub endpoint_spiffe_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterFederatedTrustDomainStatus {
    /// The relationship this resource contributes is set on the server.
    pub set: bool,
}

pub struct ParsedClusterFederatedTrustDomain {
    pub meta: ResourceMeta,
    pub class_name: String,
    pub relationship: FederationRelationship,
}

const PROFILE_HTTPS_WEB: &str = "https_web";
const PROFILE_HTTPS_SPIFFE: &str = "https_spiffe";

pub fn parse_cluster_federated_trust_domain(
    resource: &ClusterFederatedTrustDomain,
) -> Result<ParsedClusterFederatedTrustDomain, Error> {
    let spec = &resource.spec;

    let trust_domain = TrustDomain::new(&spec.trust_domain)
        .map_err(|_| Error::TrustDomain(spec.trust_domain.clone()))?;

    validate_bundle_endpoint_url(&spec.bundle_endpoint_url)?;

    let profile = match spec.bundle_endpoint_profile.profile_type.as_str() {
        PROFILE_HTTPS_WEB => {
            if !spec.bundle_endpoint_profile.endpoint_spiffe_id.is_empty() {
                return Err(Error::UnexpectedEndpointSpiffeId);
            }
            BundleEndpointProfile::HttpsWeb
        }
        PROFILE_HTTPS_SPIFFE => {
            if spec.bundle_endpoint_profile.endpoint_spiffe_id.is_empty() {
                return Err(Error::MissingEndpointSpiffeId);
            }
            let endpoint_spiffe_id: SPIFFEID = spec
                .bundle_endpoint_profile
                .endpoint_spiffe_id
                .parse()
                .map_err(|_| {
                    Error::SpiffeId(spec.bundle_endpoint_profile.endpoint_spiffe_id.clone())
                })?;
            BundleEndpointProfile::HttpsSpiffe { endpoint_spiffe_id }
        }
        other => return Err(Error::BundleEndpointProfile(other.to_string())),
    };

    Ok(ParsedClusterFederatedTrustDomain {
        meta: resource_meta(&resource.metadata),
        class_name: spec.class_name.clone(),
        relationship: FederationRelationship {
            trust_domain,
            bundle_endpoint_url: spec.bundle_endpoint_url.clone(),
            bundle_endpoint_profile: profile,
            trust_domain_bundle: spec.trust_domain_bundle.clone(),
        },
    })
}

pub fn validate_cluster_federated_trust_domain(
    resource: &ClusterFederatedTrustDomain,
) -> Result<(), Error> {
    parse_cluster_federated_trust_domain(resource).map(|_| ())
}

fn validate_bundle_endpoint_url(raw: &str) -> Result<(), Error> {
    let url = Url::parse(raw).map_err(|err| Error::BundleEndpointUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;

    if url.scheme() != "https" {
        return Err(Error::BundleEndpointUrl {
            url: raw.to_string(),
            reason: "scheme must be https".to_string(),
        });
    }
    if url.host().is_none() {
        return Err(Error::BundleEndpointUrl {
            url: raw.to_string(),
            reason: "host is required".to_string(),
        });
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::BundleEndpointUrl {
            url: raw.to_string(),
            reason: "userinfo is not allowed".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    fn resource(spec: ClusterFederatedTrustDomainSpec) -> ClusterFederatedTrustDomain {
        ClusterFederatedTrustDomain {
            api_version: crate::API_VERSION.to_string(),
            kind: crate::KIND_CLUSTER_FEDERATED_TRUST_DOMAIN.to_string(),
            metadata: ObjectMeta {
                name: Some("other".to_string()),
                uid: Some("uid-ftd".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn web_spec() -> ClusterFederatedTrustDomainSpec {
        ClusterFederatedTrustDomainSpec {
            trust_domain: "other.test".to_string(),
            bundle_endpoint_url: "https://other.test/bundle".to_string(),
            bundle_endpoint_profile: BundleEndpointProfileSpec {
                profile_type: "https_web".to_string(),
                endpoint_spiffe_id: String::new(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn accepts_https_web() {
        let parsed = parse_cluster_federated_trust_domain(&resource(web_spec())).unwrap();
        assert_eq!(parsed.relationship.trust_domain.as_str(), "other.test");
        assert_eq!(
            parsed.relationship.bundle_endpoint_profile,
            BundleEndpointProfile::HttpsWeb
        );
    }

    #[test]
    fn accepts_https_spiffe_with_endpoint_id() {
        let parsed = parse_cluster_federated_trust_domain(&resource(
            ClusterFederatedTrustDomainSpec {
                bundle_endpoint_profile: BundleEndpointProfileSpec {
                    profile_type: "https_spiffe".to_string(),
                    endpoint_spiffe_id: "spiffe://other.test/bundle-server".to_string(),
                },
                ..web_spec()
            },
        ))
        .unwrap();

        assert_matches!(
            parsed.relationship.bundle_endpoint_profile,
            BundleEndpointProfile::HttpsSpiffe { .. }
        );
    }

    #[test]
    fn rejects_wrong_profile_combinations() {
        let error = validate_cluster_federated_trust_domain(&resource(
            ClusterFederatedTrustDomainSpec {
                bundle_endpoint_profile: BundleEndpointProfileSpec {
                    profile_type: "https_web".to_string(),
                    endpoint_spiffe_id: "spiffe://other.test/x".to_string(),
                },
                ..web_spec()
            },
        ))
        .unwrap_err();
        assert_matches!(error, Error::UnexpectedEndpointSpiffeId);

        let error = validate_cluster_federated_trust_domain(&resource(
            ClusterFederatedTrustDomainSpec {
                bundle_endpoint_profile: BundleEndpointProfileSpec {
                    profile_type: "https_spiffe".to_string(),
                    endpoint_spiffe_id: String::new(),
                },
                ..web_spec()
            },
        ))
        .unwrap_err();
        assert_matches!(error, Error::MissingEndpointSpiffeId);
    }

    #[test]
    fn rejects_bad_endpoint_urls() {
        for (url, reason_fragment) in [
            ("http://other.test/bundle", "https"),
            ("https://user:pw@other.test/bundle", "userinfo"),
            ("not a url", "relative URL"),
        ] {
            let error = validate_cluster_federated_trust_domain(&resource(
                ClusterFederatedTrustDomainSpec {
                    bundle_endpoint_url: url.to_string(),
                    ..web_spec()
                },
            ))
            .unwrap_err();
            match error {
                Error::BundleEndpointUrl { reason, .. } => {
                    assert!(
                        reason.contains(reason_fragment),
                        "{url}: {reason} does not mention {reason_fragment}"
                    );
                }
                other => panic!("unexpected error for {url}: {other}"),
            }
        }
    }

    #[test]
    fn rejects_bad_trust_domain() {
        let error = validate_cluster_federated_trust_domain(&resource(
            ClusterFederatedTrustDomainSpec {
                trust_domain: "Not A Domain".to_string(),
                ..web_spec()
            },
        ))
        .unwrap_err();
        assert_matches!(error, Error::TrustDomain(_));
    }
}
