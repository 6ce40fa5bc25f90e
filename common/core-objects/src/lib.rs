// Copyright (c) Microsoft. All rights reserved.

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

use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use error::Error;

pub const SPIFFE_ID_PREFIX: &str = "spiffe://";

/// Parent path prefix of agent entries created through join tokens. Entries
/// under this prefix with a `spiffe_id` selector belong to the agent
/// lifecycle, not to this controller.
pub const JOIN_TOKEN_PARENT_PATH_PREFIX: &str = "/spire/agent/join_token/";
pub const JOIN_TOKEN_SELECTOR_TYPE: &str = "spiffe_id";

/// A validated trust domain name. Lowercase DNS-like name without scheme,
/// port or userinfo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustDomain(String);

impl TrustDomain {
    pub fn new(name: &str) -> Result<Self, Error> {
        if name.is_empty() || name.len() > 255 {
            return Err(Error::InvalidTrustDomain(name.to_string()));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(Error::InvalidTrustDomain(name.to_string()));
        }

        Ok(TrustDomain(name.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustDomain::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SPIFFEID {
    pub trust_domain: TrustDomain,
    pub path: String,
}

impl SPIFFEID {
    pub fn new(trust_domain: TrustDomain, path: &str) -> Result<Self, Error> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(Error::InvalidSpiffeIdPath(path.to_string()));
        }

        Ok(SPIFFEID {
            trust_domain,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for SPIFFEID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SPIFFE_ID_PREFIX, self.trust_domain, self.path)
    }
}

impl FromStr for SPIFFEID {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SPIFFE_ID_PREFIX)
            .ok_or_else(|| Error::InvalidSpiffeId(s.to_string()))?;

        let slash = rest
            .find('/')
            .ok_or_else(|| Error::InvalidSpiffeId(s.to_string()))?;
        let (trust_domain, path) = rest.split_at(slash);

        let trust_domain =
            TrustDomain::new(trust_domain).map_err(|_| Error::InvalidSpiffeId(s.to_string()))?;

        SPIFFEID::new(trust_domain, path).map_err(|_| Error::InvalidSpiffeId(s.to_string()))
    }
}

// Only meaningful as a placeholder inside `..Default::default()` test
// construction; never submitted.
impl Default for SPIFFEID {
    fn default() -> Self {
        SPIFFEID {
            trust_domain: TrustDomain("invalid".to_string()),
            path: "/".to_string(),
        }
    }
}

/// A `type:value` workload selector.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub value: String,
}

impl Selector {
    #[must_use]
    pub fn new(selector_type: &str, value: &str) -> Self {
        Selector {
            selector_type: selector_type.to_string(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.selector_type, self.value)
    }
}

impl FromStr for Selector {
    type Err = Error;

    // One split at the first colon. Both halves must be non-empty; the type
    // half may not itself contain a colon.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (selector_type, value) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidSelector(s.to_string()))?;

        if selector_type.is_empty() || value.is_empty() {
            return Err(Error::InvalidSelector(s.to_string()));
        }

        Ok(Selector::new(selector_type, value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub id: String,
    pub spiffe_id: SPIFFEID,
    pub parent_id: SPIFFEID,
    pub selectors: Vec<Selector>,
    /// Seconds. Zero means the server default.
    #[serde(default)]
    pub x509_svid_ttl: u64,
    #[serde(default)]
    pub jwt_svid_ttl: u64,
    #[serde(default)]
    pub federates_with: BTreeSet<TrustDomain>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub downstream: bool,
    #[serde(default)]
    pub store_svid: bool,
    #[serde(default)]
    pub hint: String,
}

impl RegistrationEntry {
    /// Whether this entry belongs to an agent created through a join token.
    /// The reconciler never deletes these.
    #[must_use]
    pub fn is_join_token_entry(&self) -> bool {
        self.parent_id
            .path
            .starts_with(JOIN_TOKEN_PARENT_PATH_PREFIX)
            && self
                .selectors
                .iter()
                .any(|s| s.selector_type == JOIN_TOKEN_SELECTOR_TYPE)
    }

    #[must_use]
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::of(&self.parent_id, &self.spiffe_id, &self.selectors)
    }
}

/// The updatable fields of a registration entry. Everything outside the
/// identity key `(parent_id, spiffe_id, selectors)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryField {
    X509SvidTtl,
    JwtSvidTtl,
    FederatesWith,
    DnsNames,
    Admin,
    Downstream,
    StoreSvid,
    Hint,
}

impl fmt::Display for EntryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryField::X509SvidTtl => "x509_svid_ttl",
            EntryField::JwtSvidTtl => "jwt_svid_ttl",
            EntryField::FederatesWith => "federates_with",
            EntryField::DnsNames => "dns_names",
            EntryField::Admin => "admin",
            EntryField::Downstream => "downstream",
            EntryField::StoreSvid => "store_svid",
            EntryField::Hint => "hint",
        })
    }
}

/// Two entries are the same entry iff their identity keys match. The key is
/// a canonical string over parent id, spiffe id and the sorted selector set,
/// so selector order never matters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    #[must_use]
    pub fn of(parent_id: &SPIFFEID, spiffe_id: &SPIFFEID, selectors: &[Selector]) -> Self {
        let mut sorted: Vec<String> = selectors.iter().map(ToString::to_string).collect();
        sorted.sort();
        sorted.dedup();

        let mut key = format!("{}\n{}", parent_id, spiffe_id);
        for selector in sorted {
            key.push('\n');
            key.push_str(&selector);
        }

        IdentityKey(key)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.replace('\n', " "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum BundleEndpointProfile {
    HttpsWeb,
    HttpsSpiffe { endpoint_spiffe_id: SPIFFEID },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationRelationship {
    pub trust_domain: TrustDomain,
    pub bundle_endpoint_url: String,
    pub bundle_endpoint_profile: BundleEndpointProfile,
    #[serde(default)]
    pub trust_domain_bundle: Option<Bundle>,
}

impl FederationRelationship {
    /// Diff equality: endpoint URL and profile only. The bundle payload is
    /// uploaded on create/update but never compared.
    #[must_use]
    pub fn same_config(&self, other: &FederationRelationship) -> bool {
        self.trust_domain == other.trust_domain
            && self.bundle_endpoint_url == other.bundle_endpoint_url
            && self.bundle_endpoint_profile == other.bundle_endpoint_profile
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub trust_domain: String,
    /// DER-encoded X.509 authorities.
    pub x509_authorities: Vec<Vec<u8>>,
    pub jwt_authorities: Vec<JWTAuthority>,
    pub sequence_number: u64,
    pub refresh_hint: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JWTAuthority {
    pub public_key: Vec<u8>,
    pub key_id: String,
    pub expires_at: u64,
}

/// Normalized object metadata of a declarative resource. Drives the
/// deterministic conflict preference between resources claiming the same
/// identity key or trust domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub name: String,
    pub uid: String,
    pub creation_timestamp: u64,
    #[serde(default)]
    pub deletion_timestamp: Option<u64>,
}

impl ResourceMeta {
    /// Preference between two resources contending for the same entry:
    /// older creation wins; an object not being deleted wins over one being
    /// deleted, and among deleting objects the later-to-finalize wins; the
    /// UID breaks any remaining tie.
    #[must_use]
    pub fn cmp_preference(&self, other: &ResourceMeta) -> std::cmp::Ordering {
        self.creation_timestamp
            .cmp(&other.creation_timestamp)
            .then_with(|| match (self.deletion_timestamp, other.deletion_timestamp) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => b.cmp(&a),
            })
            .then_with(|| self.uid.cmp(&other.uid))
    }
}

#[must_use]
pub fn get_epoch_time() -> u64 {
    let now = SystemTime::now();
    let epoch = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Epoch should succeed");
    epoch.as_secs()
}
