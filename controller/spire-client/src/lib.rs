// Copyright (c) Microsoft. All rights reserved.

//! SPIRE server client adapter. Wraps the raw typed RPCs with pagination,
//! batching with per-element statuses, and the unsupported-field probe the
//! entry reconciler relies on to degrade gracefully against older servers.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::missing_panics_doc
)]

pub mod http;

#[cfg(any(test, feature = "tests"))]
pub mod fake;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use log::warn;
use tokio::{sync::Mutex, time::Instant};

use core_objects::{EntryField, FederationRelationship, RegistrationEntry, Selector, TrustDomain};
use spire_server_api::{
    batch_create_entries, batch_create_federation_relationships, batch_delete_entries,
    batch_delete_federation_relationships, batch_update_entries,
    batch_update_federation_relationships, get_bundle, list_entries,
    list_federation_relationships, mint_x509_svid, operation,
};

#[cfg(feature = "tests")]
use mockall::automock;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

const LIST_PAGE_SIZE: u32 = 500;
const CREATE_BATCH_SIZE: usize = 50;
const UPDATE_BATCH_SIZE: usize = 50;
const DELETE_BATCH_SIZE: usize = 200;

const UNSUPPORTED_FIELDS_CACHE: Duration = Duration::from_secs(10 * 60);

const PROBE_PARENT_PATH: &str = "/spire-controller/unsupported-fields-probe";

/// The raw typed RPC surface of the SPIRE server. One method per server
/// operation; no batching or pagination logic lives behind this trait.
#[cfg_attr(feature = "tests", automock)]
#[async_trait::async_trait]
pub trait SpireRpc: Sync + Send {
    async fn list_entries(&self, params: list_entries::Params) -> Result<list_entries::Response>;

    async fn batch_create_entries(
        &self,
        request: batch_create_entries::Request,
    ) -> Result<batch_create_entries::Response>;

    async fn batch_update_entries(
        &self,
        request: batch_update_entries::Request,
    ) -> Result<batch_update_entries::Response>;

    async fn batch_delete_entries(
        &self,
        request: batch_delete_entries::Request,
    ) -> Result<batch_delete_entries::Response>;

    async fn list_federation_relationships(
        &self,
        params: list_federation_relationships::Params,
    ) -> Result<list_federation_relationships::Response>;

    async fn batch_create_federation_relationships(
        &self,
        request: batch_create_federation_relationships::Request,
    ) -> Result<batch_create_federation_relationships::Response>;

    async fn batch_update_federation_relationships(
        &self,
        request: batch_update_federation_relationships::Request,
    ) -> Result<batch_update_federation_relationships::Response>;

    async fn batch_delete_federation_relationships(
        &self,
        request: batch_delete_federation_relationships::Request,
    ) -> Result<batch_delete_federation_relationships::Response>;

    async fn mint_x509_svid(
        &self,
        request: mint_x509_svid::Request,
    ) -> Result<mint_x509_svid::Response>;

    async fn get_bundle(&self) -> Result<get_bundle::Response>;
}

struct UnsupportedFieldsCache {
    fields: BTreeSet<EntryField>,
    refreshed: Instant,
}

pub struct SpireClient {
    rpc: Arc<dyn SpireRpc>,
    trust_domain: TrustDomain,
    page_size: u32,
    create_batch_size: usize,
    update_batch_size: usize,
    delete_batch_size: usize,
    unsupported_fields: Mutex<Option<UnsupportedFieldsCache>>,
}

impl SpireClient {
    #[must_use]
    pub fn new(rpc: Arc<dyn SpireRpc>, trust_domain: TrustDomain) -> Self {
        SpireClient {
            rpc,
            trust_domain,
            page_size: LIST_PAGE_SIZE,
            create_batch_size: CREATE_BATCH_SIZE,
            update_batch_size: UPDATE_BATCH_SIZE,
            delete_batch_size: DELETE_BATCH_SIZE,
            unsupported_fields: Mutex::new(None),
        }
    }

    /// Shrink page and batch sizes, for tests that want to observe slicing.
    #[must_use]
    pub fn with_sizes(
        rpc: Arc<dyn SpireRpc>,
        trust_domain: TrustDomain,
        page_size: u32,
        batch_size: usize,
    ) -> Self {
        SpireClient {
            rpc,
            trust_domain,
            page_size,
            create_batch_size: batch_size,
            update_batch_size: batch_size,
            delete_batch_size: batch_size,
            unsupported_fields: Mutex::new(None),
        }
    }

    /// All entries currently registered, accumulated across pages.
    pub async fn list_entries(&self) -> Result<Vec<RegistrationEntry>> {
        let mut entries = Vec::new();
        let mut page_token = None;

        loop {
            let response = self
                .rpc
                .list_entries(list_entries::Params {
                    page_size: self.page_size,
                    page_token: page_token.take(),
                })
                .await?;

            entries.extend(response.entries);

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(entries),
            }
        }
    }

    pub async fn create_entries(
        &self,
        entries: Vec<RegistrationEntry>,
    ) -> Result<Vec<operation::EntryResult>> {
        let mut results = Vec::with_capacity(entries.len());

        for batch in entries.chunks(self.create_batch_size) {
            let response = self
                .rpc
                .batch_create_entries(batch_create_entries::Request {
                    entries: batch.to_vec(),
                })
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn update_entries(
        &self,
        entries: Vec<RegistrationEntry>,
    ) -> Result<Vec<operation::EntryResult>> {
        let mut results = Vec::with_capacity(entries.len());

        for batch in entries.chunks(self.update_batch_size) {
            let response = self
                .rpc
                .batch_update_entries(batch_update_entries::Request {
                    entries: batch.to_vec(),
                })
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn delete_entries(&self, ids: Vec<String>) -> Result<Vec<operation::IdResult>> {
        let mut results = Vec::with_capacity(ids.len());

        for batch in ids.chunks(self.delete_batch_size) {
            let response = self
                .rpc
                .batch_delete_entries(batch_delete_entries::Request {
                    ids: batch.to_vec(),
                })
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn list_federation_relationships(&self) -> Result<Vec<FederationRelationship>> {
        let mut relationships = Vec::new();
        let mut page_token = None;

        loop {
            let response = self
                .rpc
                .list_federation_relationships(list_federation_relationships::Params {
                    page_size: self.page_size,
                    page_token: page_token.take(),
                })
                .await?;

            relationships.extend(response.federation_relationships);

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(relationships),
            }
        }
    }

    pub async fn create_federation_relationships(
        &self,
        relationships: Vec<FederationRelationship>,
    ) -> Result<Vec<operation::RelationshipResult>> {
        let mut results = Vec::with_capacity(relationships.len());

        for batch in relationships.chunks(self.create_batch_size) {
            let response = self
                .rpc
                .batch_create_federation_relationships(
                    batch_create_federation_relationships::Request {
                        federation_relationships: batch.to_vec(),
                    },
                )
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn update_federation_relationships(
        &self,
        relationships: Vec<FederationRelationship>,
    ) -> Result<Vec<operation::RelationshipResult>> {
        let mut results = Vec::with_capacity(relationships.len());

        for batch in relationships.chunks(self.update_batch_size) {
            let response = self
                .rpc
                .batch_update_federation_relationships(
                    batch_update_federation_relationships::Request {
                        federation_relationships: batch.to_vec(),
                    },
                )
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn delete_federation_relationships(
        &self,
        trust_domains: Vec<TrustDomain>,
    ) -> Result<Vec<operation::TrustDomainResult>> {
        let mut results = Vec::with_capacity(trust_domains.len());

        for batch in trust_domains.chunks(self.delete_batch_size) {
            let response = self
                .rpc
                .batch_delete_federation_relationships(
                    batch_delete_federation_relationships::Request {
                        trust_domains: batch.to_vec(),
                    },
                )
                .await?;
            results.extend(response.results);
        }

        Ok(results)
    }

    pub async fn mint_x509_svid(
        &self,
        csr_pem: String,
        ttl_seconds: u64,
    ) -> Result<mint_x509_svid::Svid> {
        let response = self
            .rpc
            .mint_x509_svid(mint_x509_svid::Request {
                csr_pem,
                ttl_seconds,
            })
            .await?;

        Ok(response.svid)
    }

    pub async fn get_bundle(&self) -> Result<core_objects::Bundle> {
        let response = self.rpc.get_bundle().await?;
        Ok(response.bundle)
    }

    /// The set of updatable entry fields this server silently drops.
    ///
    /// Creates a probe entry with every probeable optional field set,
    /// compares what the server echoes back, then deletes the probe again.
    /// The delete is best effort. The result is cached for ten minutes.
    pub async fn unsupported_fields(&self) -> Result<BTreeSet<EntryField>> {
        let mut cache = self.unsupported_fields.lock().await;

        if let Some(cached) = &*cache {
            if cached.refreshed.elapsed() < UNSUPPORTED_FIELDS_CACHE {
                return Ok(cached.fields.clone());
            }
        }

        let fields = self.probe_unsupported_fields().await?;
        *cache = Some(UnsupportedFieldsCache {
            fields: fields.clone(),
            refreshed: Instant::now(),
        });

        Ok(fields)
    }

    async fn probe_unsupported_fields(&self) -> Result<BTreeSet<EntryField>> {
        let probe = probe_entry(&self.trust_domain);

        let response = self
            .rpc
            .batch_create_entries(batch_create_entries::Request {
                entries: vec![probe.clone()],
            })
            .await?;

        let result = response
            .results
            .into_iter()
            .next()
            .ok_or("empty probe create response")?;
        if !result.status.is_ok() {
            return Err(format!("probe entry rejected: {}", result.status.message).into());
        }
        let echoed = result.entry.ok_or("probe create response without entry")?;

        let mut unsupported = BTreeSet::new();
        if echoed.x509_svid_ttl != probe.x509_svid_ttl {
            unsupported.insert(EntryField::X509SvidTtl);
        }
        if echoed.jwt_svid_ttl != probe.jwt_svid_ttl {
            unsupported.insert(EntryField::JwtSvidTtl);
        }
        if echoed.dns_names != probe.dns_names {
            unsupported.insert(EntryField::DnsNames);
        }
        if echoed.hint != probe.hint {
            unsupported.insert(EntryField::Hint);
        }
        if echoed.admin != probe.admin {
            unsupported.insert(EntryField::Admin);
        }
        if echoed.downstream != probe.downstream {
            unsupported.insert(EntryField::Downstream);
        }
        if echoed.store_svid != probe.store_svid {
            unsupported.insert(EntryField::StoreSvid);
        }

        // federates_with cannot be probed without a registered relationship
        // and is treated as supported.

        let delete = self
            .rpc
            .batch_delete_entries(batch_delete_entries::Request {
                ids: vec![echoed.id.clone()],
            })
            .await;
        match delete {
            Ok(response) => {
                for result in response.results {
                    if !result.status.is_ok() {
                        warn!(
                            "Failed to delete probe entry {}: {}",
                            result.id, result.status.message
                        );
                    }
                }
            }
            Err(err) => warn!("Failed to delete probe entry {}: {}", echoed.id, err),
        }

        Ok(unsupported)
    }
}

fn probe_entry(trust_domain: &TrustDomain) -> RegistrationEntry {
    let parent_id = core_objects::SPIFFEID {
        trust_domain: trust_domain.clone(),
        path: PROBE_PARENT_PATH.to_string(),
    };
    let spiffe_id = core_objects::SPIFFEID {
        trust_domain: trust_domain.clone(),
        path: format!("{PROBE_PARENT_PATH}/probe"),
    };

    RegistrationEntry {
        id: String::new(),
        spiffe_id,
        parent_id,
        selectors: vec![Selector::new("k8s", "probe:unsupported-fields")],
        x509_svid_ttl: 3600,
        jwt_svid_ttl: 1800,
        federates_with: BTreeSet::new(),
        dns_names: vec!["unsupported-fields-probe.invalid".to_string()],
        admin: true,
        downstream: true,
        store_svid: true,
        hint: "unsupported-fields-probe".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSpireServer;

    fn trust_domain() -> TrustDomain {
        TrustDomain::new("td.test").unwrap()
    }

    fn entry(n: usize) -> RegistrationEntry {
        RegistrationEntry {
            spiffe_id: format!("spiffe://td.test/workload/{n}").parse().unwrap(),
            parent_id: "spiffe://td.test/spire/agent/k8s_psat/c/node".parse().unwrap(),
            selectors: vec![Selector::new("k8s", format!("pod-uid:{n}").as_str())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn list_entries_walks_all_pages() {
        let fake = Arc::new(FakeSpireServer::default());
        for n in 0..7 {
            fake.insert_entry(entry(n));
        }

        let client = SpireClient::with_sizes(fake.clone(), trust_domain(), 3, 50);
        let entries = client.list_entries().await.unwrap();

        assert_eq!(entries.len(), 7);
        // Three pages of size 3, 3, 1.
        assert_eq!(fake.list_entry_calls(), 3);
    }

    #[tokio::test]
    async fn create_entries_batches_and_concatenates_results() {
        let fake = Arc::new(FakeSpireServer::default());
        let client = SpireClient::with_sizes(fake.clone(), trust_domain(), 100, 2);

        let results = client
            .create_entries((0..5).map(entry).collect())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.status.is_ok()));
        assert_eq!(fake.create_entry_calls(), 3);
        assert_eq!(fake.entries().len(), 5);
    }

    #[tokio::test]
    async fn per_element_statuses_are_passed_through() {
        let fake = Arc::new(FakeSpireServer::default());
        let stored = {
            let mut e = entry(0);
            e.id = "existing".to_string();
            e
        };
        fake.insert_entry(stored);

        let client = SpireClient::new(fake.clone(), trust_domain());
        // Same identity twice: second one collides.
        let results = client
            .create_entries(vec![entry(1), entry(0)])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].status.is_ok());
        assert_eq!(
            results[1].status.code,
            spire_server_api::operation::Code::AlreadyExists
        );
    }

    #[tokio::test]
    async fn transport_error_aborts_remaining_batches() {
        let fake = Arc::new(FakeSpireServer::default());
        let client = SpireClient::with_sizes(fake.clone(), trust_domain(), 100, 2);

        fake.fail_after_create_calls(1);
        let error = client.create_entries((0..6).map(entry).collect()).await;
        assert!(error.is_err());

        // The first batch landed; nothing past the failing one was sent.
        assert_eq!(fake.entries().len(), 2);
    }

    #[tokio::test]
    async fn probe_reports_dropped_fields_and_cleans_up() {
        let fake = Arc::new(FakeSpireServer::default());
        fake.drop_field(EntryField::JwtSvidTtl);
        fake.drop_field(EntryField::Hint);

        let client = SpireClient::new(fake.clone(), trust_domain());
        let unsupported = client.unsupported_fields().await.unwrap();

        assert!(unsupported.contains(&EntryField::JwtSvidTtl));
        assert!(unsupported.contains(&EntryField::Hint));
        assert!(!unsupported.contains(&EntryField::DnsNames));
        // Probe entry was removed again.
        assert!(fake.entries().is_empty());
    }

    #[tokio::test]
    async fn probe_result_is_cached() {
        let fake = Arc::new(FakeSpireServer::default());
        let client = SpireClient::new(fake.clone(), trust_domain());

        client.unsupported_fields().await.unwrap();
        let first = fake.create_entry_calls();
        client.unsupported_fields().await.unwrap();

        assert_eq!(fake.create_entry_calls(), first);
    }
}
