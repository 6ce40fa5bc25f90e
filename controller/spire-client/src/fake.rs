// Copyright (c) Microsoft. All rights reserved.

//! In-memory stand-in for a SPIRE server, used by the reconciler tests.
//! Keeps entries and federation relationships, assigns server ids, supports
//! field dropping (for the unsupported-field probe) and failure injection.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use core_objects::{Bundle, EntryField, FederationRelationship, RegistrationEntry};
use spire_server_api::{
    batch_create_entries, batch_create_federation_relationships, batch_delete_entries,
    batch_delete_federation_relationships, batch_update_entries,
    batch_update_federation_relationships, get_bundle, list_entries,
    list_federation_relationships, mint_x509_svid,
    operation::{Code, EntryResult, IdResult, RelationshipResult, Status, TrustDomainResult},
};

use crate::SpireRpc;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

#[derive(Default)]
pub struct FakeSpireServer {
    entries: Mutex<Vec<RegistrationEntry>>,
    federation_relationships: Mutex<Vec<FederationRelationship>>,
    bundle: Mutex<Bundle>,
    dropped_fields: Mutex<BTreeSet<EntryField>>,

    minted: Mutex<Vec<mint_x509_svid::Request>>,
    mint_response: Mutex<Option<mint_x509_svid::Svid>>,

    next_id: AtomicUsize,
    list_entry_calls: AtomicUsize,
    create_entry_calls: AtomicUsize,
    update_entry_calls: AtomicUsize,
    delete_entry_calls: AtomicUsize,

    created: Mutex<Vec<RegistrationEntry>>,
    updated: Mutex<Vec<RegistrationEntry>>,
    deleted: Mutex<Vec<String>>,

    // Transport failure once the call counter reaches the configured value.
    create_fail_after: Mutex<Option<usize>>,
    fail_all: Mutex<bool>,
}

impl FakeSpireServer {
    pub fn insert_entry(&self, mut entry: RegistrationEntry) {
        if entry.id.is_empty() {
            entry.id = self.assign_id();
        }
        self.entries.lock().unwrap().push(entry);
    }

    pub fn insert_relationship(&self, relationship: FederationRelationship) {
        self.federation_relationships
            .lock()
            .unwrap()
            .push(relationship);
    }

    pub fn set_bundle(&self, bundle: Bundle) {
        *self.bundle.lock().unwrap() = bundle;
    }

    pub fn set_mint_response(&self, svid: mint_x509_svid::Svid) {
        *self.mint_response.lock().unwrap() = Some(svid);
    }

    /// Silently zero this field on every create and update, as an old
    /// server that does not know it would.
    pub fn drop_field(&self, field: EntryField) {
        self.dropped_fields.lock().unwrap().insert(field);
    }

    pub fn fail_after_create_calls(&self, calls: usize) {
        *self.create_fail_after.lock().unwrap() = Some(calls);
    }

    pub fn fail_everything(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    pub fn entries(&self) -> Vec<RegistrationEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn relationships(&self) -> Vec<FederationRelationship> {
        self.federation_relationships.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<RegistrationEntry> {
        self.created.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<RegistrationEntry> {
        self.updated.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn minted(&self) -> Vec<mint_x509_svid::Request> {
        self.minted.lock().unwrap().clone()
    }

    pub fn clear_recordings(&self) {
        self.created.lock().unwrap().clear();
        self.updated.lock().unwrap().clear();
        self.deleted.lock().unwrap().clear();
    }

    pub fn list_entry_calls(&self) -> usize {
        self.list_entry_calls.load(Ordering::SeqCst)
    }

    pub fn create_entry_calls(&self) -> usize {
        self.create_entry_calls.load(Ordering::SeqCst)
    }

    pub fn update_entry_calls(&self) -> usize {
        self.update_entry_calls.load(Ordering::SeqCst)
    }

    pub fn delete_entry_calls(&self) -> usize {
        self.delete_entry_calls.load(Ordering::SeqCst)
    }

    fn assign_id(&self) -> String {
        format!("server-id-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn apply_dropped_fields(&self, entry: &mut RegistrationEntry) {
        let dropped = self.dropped_fields.lock().unwrap();
        for field in dropped.iter() {
            match field {
                EntryField::X509SvidTtl => entry.x509_svid_ttl = 0,
                EntryField::JwtSvidTtl => entry.jwt_svid_ttl = 0,
                EntryField::FederatesWith => entry.federates_with.clear(),
                EntryField::DnsNames => entry.dns_names.clear(),
                EntryField::Admin => entry.admin = false,
                EntryField::Downstream => entry.downstream = false,
                EntryField::StoreSvid => entry.store_svid = false,
                EntryField::Hint => entry.hint.clear(),
            }
        }
    }

    fn check_transport(&self) -> Result<()> {
        if *self.fail_all.lock().unwrap() {
            return Err("injected transport failure".into());
        }
        Ok(())
    }
}

fn page<T: Clone>(items: &[T], page_size: u32, page_token: Option<&String>) -> (Vec<T>, Option<String>) {
    let start = page_token.map_or(0, |token| token.parse().unwrap_or(0));
    let end = usize::min(start + page_size as usize, items.len());
    let next = if end < items.len() {
        Some(end.to_string())
    } else {
        None
    };
    (items[start..end].to_vec(), next)
}

#[async_trait::async_trait]
impl SpireRpc for FakeSpireServer {
    async fn list_entries(&self, params: list_entries::Params) -> Result<list_entries::Response> {
        self.check_transport()?;
        self.list_entry_calls.fetch_add(1, Ordering::SeqCst);

        let entries = self.entries.lock().unwrap();
        let (entries, next_page_token) =
            page(&entries, params.page_size, params.page_token.as_ref());
        Ok(list_entries::Response {
            entries,
            next_page_token,
        })
    }

    async fn batch_create_entries(
        &self,
        request: batch_create_entries::Request,
    ) -> Result<batch_create_entries::Response> {
        self.check_transport()?;
        let calls = self.create_entry_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fail_after) = *self.create_fail_after.lock().unwrap() {
            if calls >= fail_after {
                return Err("injected transport failure".into());
            }
        }

        let mut results = Vec::with_capacity(request.entries.len());
        for mut entry in request.entries {
            let identity = entry.identity();
            let exists = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.identity() == identity);
            if exists {
                results.push(EntryResult {
                    status: Status {
                        code: Code::AlreadyExists,
                        message: "similar entry already exists".to_string(),
                    },
                    entry: None,
                });
                continue;
            }

            if entry.id.is_empty() {
                entry.id = self.assign_id();
            }
            self.apply_dropped_fields(&mut entry);
            self.entries.lock().unwrap().push(entry.clone());
            self.created.lock().unwrap().push(entry.clone());
            results.push(EntryResult {
                status: Status::ok(),
                entry: Some(entry),
            });
        }

        Ok(batch_create_entries::Response { results })
    }

    async fn batch_update_entries(
        &self,
        request: batch_update_entries::Request,
    ) -> Result<batch_update_entries::Response> {
        self.check_transport()?;
        self.update_entry_calls.fetch_add(1, Ordering::SeqCst);

        let mut results = Vec::with_capacity(request.entries.len());
        for mut entry in request.entries {
            self.apply_dropped_fields(&mut entry);

            let mut entries = self.entries.lock().unwrap();
            match entries.iter_mut().find(|e| e.id == entry.id) {
                Some(stored) => {
                    *stored = entry.clone();
                    self.updated.lock().unwrap().push(entry.clone());
                    results.push(EntryResult {
                        status: Status::ok(),
                        entry: Some(entry),
                    });
                }
                None => results.push(EntryResult {
                    status: Status {
                        code: Code::NotFound,
                        message: format!("no entry with id {}", entry.id),
                    },
                    entry: None,
                }),
            }
        }

        Ok(batch_update_entries::Response { results })
    }

    async fn batch_delete_entries(
        &self,
        request: batch_delete_entries::Request,
    ) -> Result<batch_delete_entries::Response> {
        self.check_transport()?;
        self.delete_entry_calls.fetch_add(1, Ordering::SeqCst);

        let mut results = Vec::with_capacity(request.ids.len());
        for id in request.ids {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|e| e.id != id);

            let status = if entries.len() < before {
                self.deleted.lock().unwrap().push(id.clone());
                Status::ok()
            } else {
                Status {
                    code: Code::NotFound,
                    message: format!("no entry with id {id}"),
                }
            };
            results.push(IdResult { status, id });
        }

        Ok(batch_delete_entries::Response { results })
    }

    async fn list_federation_relationships(
        &self,
        params: list_federation_relationships::Params,
    ) -> Result<list_federation_relationships::Response> {
        self.check_transport()?;

        let relationships = self.federation_relationships.lock().unwrap();
        let (federation_relationships, next_page_token) =
            page(&relationships, params.page_size, params.page_token.as_ref());
        Ok(list_federation_relationships::Response {
            federation_relationships,
            next_page_token,
        })
    }

    async fn batch_create_federation_relationships(
        &self,
        request: batch_create_federation_relationships::Request,
    ) -> Result<batch_create_federation_relationships::Response> {
        self.check_transport()?;

        let mut results = Vec::new();
        for relationship in request.federation_relationships {
            let mut relationships = self.federation_relationships.lock().unwrap();
            if relationships
                .iter()
                .any(|r| r.trust_domain == relationship.trust_domain)
            {
                results.push(RelationshipResult {
                    status: Status {
                        code: Code::AlreadyExists,
                        message: format!("relationship for {} exists", relationship.trust_domain),
                    },
                    federation_relationship: None,
                });
                continue;
            }

            relationships.push(relationship.clone());
            results.push(RelationshipResult {
                status: Status::ok(),
                federation_relationship: Some(relationship),
            });
        }

        Ok(batch_create_federation_relationships::Response { results })
    }

    async fn batch_update_federation_relationships(
        &self,
        request: batch_update_federation_relationships::Request,
    ) -> Result<batch_update_federation_relationships::Response> {
        self.check_transport()?;

        let mut results = Vec::new();
        for relationship in request.federation_relationships {
            let mut relationships = self.federation_relationships.lock().unwrap();
            match relationships
                .iter_mut()
                .find(|r| r.trust_domain == relationship.trust_domain)
            {
                Some(stored) => {
                    *stored = relationship.clone();
                    results.push(RelationshipResult {
                        status: Status::ok(),
                        federation_relationship: Some(relationship),
                    });
                }
                None => results.push(RelationshipResult {
                    status: Status {
                        code: Code::NotFound,
                        message: format!("no relationship for {}", relationship.trust_domain),
                    },
                    federation_relationship: None,
                }),
            }
        }

        Ok(batch_update_federation_relationships::Response { results })
    }

    async fn batch_delete_federation_relationships(
        &self,
        request: batch_delete_federation_relationships::Request,
    ) -> Result<batch_delete_federation_relationships::Response> {
        self.check_transport()?;

        let mut results = Vec::new();
        for trust_domain in request.trust_domains {
            let mut relationships = self.federation_relationships.lock().unwrap();
            let before = relationships.len();
            relationships.retain(|r| r.trust_domain != trust_domain);

            let status = if relationships.len() < before {
                Status::ok()
            } else {
                Status {
                    code: Code::NotFound,
                    message: format!("no relationship for {trust_domain}"),
                }
            };
            results.push(TrustDomainResult {
                status,
                trust_domain,
            });
        }

        Ok(batch_delete_federation_relationships::Response { results })
    }

    async fn mint_x509_svid(
        &self,
        request: mint_x509_svid::Request,
    ) -> Result<mint_x509_svid::Response> {
        self.check_transport()?;
        self.minted.lock().unwrap().push(mint_x509_svid::Request {
            csr_pem: request.csr_pem.clone(),
            ttl_seconds: request.ttl_seconds,
        });

        let svid = self.mint_response.lock().unwrap().clone().unwrap_or_else(|| {
            mint_x509_svid::Svid {
                cert_chain_pem: "-----BEGIN CERTIFICATE-----\nZHVtbXk=\n-----END CERTIFICATE-----\n"
                    .to_string(),
                id: "spiffe://td.test/spire-controller".to_string(),
                expires_at: core_objects::get_epoch_time() + request.ttl_seconds,
            }
        });

        Ok(mint_x509_svid::Response { svid })
    }

    async fn get_bundle(&self) -> Result<get_bundle::Response> {
        self.check_transport()?;
        Ok(get_bundle::Response {
            bundle: self.bundle.lock().unwrap().clone(),
        })
    }
}
