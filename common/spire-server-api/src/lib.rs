// Copyright (c) Microsoft. All rights reserved.

//! Typed shapes of the SPIRE server APIs used by the controller: the Entry
//! and TrustDomain batch APIs, SVID minting and the bundle endpoint. Batch
//! responses carry one status per input element; callers act per element.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

use std::{fmt, str};

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ApiVersion {
    V2024_01_15,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApiVersion::V2024_01_15 => "2024-01-15",
        })
    }
}

impl str::FromStr for ApiVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2024-01-15" => Ok(ApiVersion::V2024_01_15),
            _ => Err(()),
        }
    }
}

pub mod list_entries {
    use core_objects::RegistrationEntry;

    pub struct Params {
        pub page_size: u32,
        pub page_token: Option<String>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub entries: Vec<RegistrationEntry>,
        pub next_page_token: Option<String>,
    }
}

pub mod batch_create_entries {
    use core_objects::RegistrationEntry;

    use crate::operation;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub entries: Vec<RegistrationEntry>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::EntryResult>,
    }
}

pub mod batch_update_entries {
    use core_objects::RegistrationEntry;

    use crate::operation;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub entries: Vec<RegistrationEntry>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::EntryResult>,
    }
}

pub mod batch_delete_entries {
    use crate::operation;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub ids: Vec<String>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::IdResult>,
    }
}

pub mod list_federation_relationships {
    use core_objects::FederationRelationship;

    pub struct Params {
        pub page_size: u32,
        pub page_token: Option<String>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub federation_relationships: Vec<FederationRelationship>,
        pub next_page_token: Option<String>,
    }
}

pub mod batch_create_federation_relationships {
    use core_objects::FederationRelationship;

    use crate::operation;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub federation_relationships: Vec<FederationRelationship>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::RelationshipResult>,
    }
}

pub mod batch_update_federation_relationships {
    use core_objects::FederationRelationship;

    use crate::operation;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub federation_relationships: Vec<FederationRelationship>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::RelationshipResult>,
    }
}

pub mod batch_delete_federation_relationships {
    use core_objects::TrustDomain;

    use crate::operation;

    /// Deletion is keyed by trust-domain name.
    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub trust_domains: Vec<TrustDomain>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub results: Vec<operation::TrustDomainResult>,
    }
}

pub mod mint_x509_svid {
    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
    pub struct Request {
        pub csr_pem: String,
        pub ttl_seconds: u64,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub svid: Svid,
    }

    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
    pub struct Svid {
        /// Leaf first, PEM concatenated.
        pub cert_chain_pem: String,
        pub id: String,
        pub expires_at: u64,
    }
}

pub mod get_bundle {
    use core_objects::Bundle;

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub struct Response {
        pub bundle: Bundle,
    }
}

pub mod operation {
    use core_objects::{FederationRelationship, RegistrationEntry, TrustDomain};

    /// Server-side status codes, passed through per element and never
    /// collapsed into a single call error.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum Code {
        Ok,
        AlreadyExists,
        NotFound,
        InvalidArgument,
        Internal,
    }

    #[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
    pub struct Status {
        pub code: Code,
        #[serde(default)]
        pub message: String,
    }

    impl Status {
        #[must_use]
        pub fn ok() -> Self {
            Status {
                code: Code::Ok,
                message: String::new(),
            }
        }

        #[must_use]
        pub fn is_ok(&self) -> bool {
            self.code == Code::Ok
        }
    }

    #[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
    pub struct EntryResult {
        pub status: Status,
        pub entry: Option<RegistrationEntry>,
    }

    #[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
    pub struct IdResult {
        pub status: Status,
        pub id: String,
    }

    #[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
    pub struct RelationshipResult {
        pub status: Status,
        pub federation_relationship: Option<FederationRelationship>,
    }

    #[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
    pub struct TrustDomainResult {
        pub status: Status,
        pub trust_domain: TrustDomain,
    }
}

#[cfg(test)]
mod tests {
    use super::operation::{Code, Status};

    #[test]
    fn status_codes_round_trip() {
        let status = Status {
            code: Code::AlreadyExists,
            message: "similar entry already exists".to_string(),
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("ALREADY_EXISTS"));

        let parsed: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.code, Code::AlreadyExists);
        assert!(!parsed.is_ok());
    }

    #[test]
    fn api_version_parses() {
        let version: super::ApiVersion = "2024-01-15".parse().unwrap();
        assert_eq!(version.to_string(), "2024-01-15");
        assert!("1999-01-01".parse::<super::ApiVersion>().is_err());
    }
}
