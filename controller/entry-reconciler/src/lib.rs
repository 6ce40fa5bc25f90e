// Copyright (c) Microsoft. All rights reserved.

//! The registration-entry diff/converge engine.
//!
//! One pass lists the declared inputs (ClusterSPIFFEID, ClusterStaticEntry)
//! and the server's current entries, buckets both sides by the entry
//! identity key `(parent_id, spiffe_id, sorted selectors)`, resolves
//! conflicts deterministically, and applies the difference as batched
//! DELETE, CREATE and UPDATE calls, in that order. Per-element failures are
//! counted on the originating resource and never abort the pass; transport
//! failures abort the pass before any status is written.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

pub mod outdated;
pub mod prefix;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex},
};

use k8s_openapi::api::core::v1::Node;
use log::{debug, info, warn};
use regex::Regex;

use cluster_resources::{
    parse_cluster_spiffe_id, parse_cluster_static_entry, ClassMatcher, ClusterSpiffeIdStats,
    ClusterSpiffeIdStatus, ClusterStaticEntryStatus,
};
use core_objects::{
    EntryField, IdentityKey, RegistrationEntry, ResourceMeta, TrustDomain,
};
use entry_renderer::RenderConfig;
use resource_loader::ClusterState;
use spire_client::SpireClient;

use outdated::outdated_fields;
use prefix::{classify, CleanupMatcher, EntryIdPrefix, Ownership};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

pub struct EntryReconcilerConfig {
    pub trust_domain: TrustDomain,
    pub cluster_name: String,
    pub cluster_domain: Option<String>,
    pub default_parent_id_template: String,
    pub ignore_namespaces: Vec<Regex>,
    pub class_matcher: ClassMatcher,
    pub reconcile_cluster_spiffe_ids: bool,
    pub reconcile_cluster_static_entries: bool,
    pub entry_id_prefix: Option<EntryIdPrefix>,
    pub entry_id_prefix_cleanup: Option<CleanupMatcher>,
}

pub struct EntryReconciler {
    state: Arc<dyn ClusterState>,
    spire: Arc<SpireClient>,
    config: EntryReconcilerConfig,
    last_unsupported: Mutex<Option<BTreeSet<EntryField>>>,
}

#[derive(Clone, Copy, Debug)]
enum SourceRef {
    SpiffeId(usize),
    Static(usize),
}

struct SpiffeIdSource {
    name: String,
    stored: Option<ClusterSpiffeIdStatus>,
    stats: ClusterSpiffeIdStats,
}

struct StaticSource {
    name: String,
    stored: Option<ClusterStaticEntryStatus>,
    status: ClusterStaticEntryStatus,
}

struct DeclaredEntry {
    entry: RegistrationEntry,
    meta: ResourceMeta,
    source: SourceRef,
    pod_uid: Option<String>,
    fallback: bool,
}

#[derive(Default)]
struct Bucket {
    current: Vec<RegistrationEntry>,
    declared: Vec<DeclaredEntry>,
}

impl EntryReconciler {
    #[must_use]
    pub fn new(
        state: Arc<dyn ClusterState>,
        spire: Arc<SpireClient>,
        config: EntryReconcilerConfig,
    ) -> Self {
        EntryReconciler {
            state,
            spire,
            config,
            last_unsupported: Mutex::new(None),
        }
    }

    pub async fn reconcile_pass(&self) -> Result<()> {
        // The adapter caches the probe result for ten minutes, so only the
        // first pass of each window actually probes.
        let unsupported = self.spire.unsupported_fields().await?;
        self.log_unsupported_transitions(&unsupported);

        let all_entries = self.spire.list_entries().await?;
        let mut current = Vec::new();
        let mut deletes = Vec::new();
        for entry in all_entries {
            match classify(
                &entry.id,
                self.config.entry_id_prefix.as_ref(),
                self.config.entry_id_prefix_cleanup.as_ref(),
            ) {
                Ownership::Ours => current.push(entry),
                Ownership::DeleteOnly => deletes.push(entry.id),
                Ownership::Foreign => {}
            }
        }

        let (declared, mut spiffe_sources, mut static_sources) = self.build_declared().await?;
        let declared = apply_fallback(declared);

        let mut buckets: BTreeMap<IdentityKey, Bucket> = BTreeMap::new();
        for entry in current {
            buckets.entry(entry.identity()).or_default().current.push(entry);
        }
        for declared_entry in declared {
            buckets
                .entry(declared_entry.entry.identity())
                .or_default()
                .declared
                .push(declared_entry);
        }

        let mut creates: Vec<(RegistrationEntry, SourceRef)> = Vec::new();
        let mut updates: Vec<(RegistrationEntry, SourceRef)> = Vec::new();

        for (identity, mut bucket) in buckets {
            bucket
                .declared
                .sort_by(|a, b| a.meta.cmp_preference(&b.meta));

            let mut declared_iter = bucket.declared.into_iter();
            let preferred = declared_iter.next();

            for masked in declared_iter {
                debug!(
                    "Entry {} from {} is masked by an older resource",
                    identity,
                    source_name(masked.source, &spiffe_sources, &static_sources),
                );
                match masked.source {
                    SourceRef::SpiffeId(index) => {
                        spiffe_sources[index].stats.entries_masked += 1;
                    }
                    SourceRef::Static(index) => static_sources[index].status.masked = true,
                }
            }

            let Some(mut preferred) = preferred else {
                // Current only: prune, but never touch join-token agent
                // entries.
                for entry in bucket.current {
                    if entry.is_join_token_entry() {
                        continue;
                    }
                    deletes.push(entry.id);
                }
                continue;
            };

            if let SourceRef::SpiffeId(index) = preferred.source {
                spiffe_sources[index].stats.entries_to_set += 1;
            }

            if bucket.current.is_empty() {
                if let Some(entry_id_prefix) = &self.config.entry_id_prefix {
                    if preferred.entry.id.is_empty() {
                        preferred.entry.id = entry_id_prefix.generate_id();
                    }
                }
                creates.push((preferred.entry, preferred.source));
            } else {
                let mut existing = bucket.current.into_iter();
                let adopted = existing.next().expect("bucket.current is non-empty");
                preferred.entry.id = adopted.id.clone();

                let outdated = outdated_fields(&adopted, &preferred.entry, &unsupported);
                if outdated.is_empty() {
                    mark_set(preferred.source, &mut static_sources);
                } else {
                    debug!(
                        "Entry {} is outdated: {:?}",
                        preferred.entry.id, outdated
                    );
                    updates.push((preferred.entry, preferred.source));
                }

                // Anything else in the bucket is a duplicate.
                for duplicate in existing {
                    deletes.push(duplicate.id);
                }
            }
        }

        // Deletes go first so pruned duplicates cannot block the creates,
        // then creates, then updates.
        if !deletes.is_empty() {
            info!("Deleting {} entries", deletes.len());
            let results = self.spire.delete_entries(deletes).await?;
            for result in results {
                if !result.status.is_ok() {
                    warn!(
                        "Failed to delete entry {}: {}",
                        result.id, result.status.message
                    );
                }
            }
        }

        if !creates.is_empty() {
            info!("Creating {} entries", creates.len());
            let entries = creates.iter().map(|(entry, _)| entry.clone()).collect();
            let results = self.spire.create_entries(entries).await?;
            for ((entry, source), result) in creates.into_iter().zip(results) {
                if result.status.is_ok() {
                    mark_set(source, &mut static_sources);
                } else {
                    warn!(
                        "Failed to create entry {} (parent {}): {}",
                        entry.spiffe_id, entry.parent_id, result.status.message
                    );
                    mark_failed(source, &mut spiffe_sources);
                }
            }
        }

        if !updates.is_empty() {
            info!("Updating {} entries", updates.len());
            let entries = updates.iter().map(|(entry, _)| entry.clone()).collect();
            let results = self.spire.update_entries(entries).await?;
            for ((entry, source), result) in updates.into_iter().zip(results) {
                if result.status.is_ok() {
                    mark_set(source, &mut static_sources);
                } else {
                    warn!(
                        "Failed to update entry {} ({}): {}",
                        entry.id, entry.spiffe_id, result.status.message
                    );
                    mark_failed(source, &mut spiffe_sources);
                }
            }
        }

        self.write_statuses(spiffe_sources, static_sources).await
    }

    async fn build_declared(
        &self,
    ) -> Result<(Vec<DeclaredEntry>, Vec<SpiffeIdSource>, Vec<StaticSource>)> {
        let mut declared = Vec::new();
        let mut spiffe_sources: Vec<SpiffeIdSource> = Vec::new();
        let mut static_sources: Vec<StaticSource> = Vec::new();

        if self.config.reconcile_cluster_static_entries {
            for resource in self.state.list_cluster_static_entries().await? {
                if !self.config.class_matcher.matches(&resource.spec.class_name) {
                    continue;
                }
                let name = resource.metadata.name.clone().unwrap_or_default();
                let stored = resource.status.clone();

                match parse_cluster_static_entry(&resource, &self.config.trust_domain) {
                    Ok(parsed) => {
                        let source = SourceRef::Static(static_sources.len());
                        static_sources.push(StaticSource {
                            name,
                            stored,
                            status: ClusterStaticEntryStatus {
                                rendered: true,
                                masked: false,
                                set: false,
                            },
                        });
                        declared.push(DeclaredEntry {
                            entry: parsed.entry,
                            meta: parsed.meta,
                            source,
                            pod_uid: None,
                            fallback: false,
                        });
                    }
                    Err(err) => {
                        warn!("ClusterStaticEntry {} does not render: {}", name, err);
                        static_sources.push(StaticSource {
                            name,
                            stored,
                            status: ClusterStaticEntryStatus::default(),
                        });
                    }
                }
            }
        }

        if self.config.reconcile_cluster_spiffe_ids {
            let render_config = RenderConfig {
                trust_domain: self.config.trust_domain.clone(),
                cluster_name: self.config.cluster_name.clone(),
                cluster_domain: self.config.cluster_domain.clone(),
            };

            for resource in self.state.list_cluster_spiffe_ids().await? {
                if !self.config.class_matcher.matches(&resource.spec.class_name) {
                    continue;
                }
                let name = resource.metadata.name.clone().unwrap_or_default();
                let stored = resource.status.clone();

                let parsed = match parse_cluster_spiffe_id(
                    &resource,
                    &self.config.default_parent_id_template,
                ) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        // Admission normally prevents this; seen in static
                        // mode or after an admission outage.
                        warn!("ClusterSPIFFEID {} does not parse: {}", name, err);
                        spiffe_sources.push(SpiffeIdSource {
                            name,
                            stored,
                            stats: ClusterSpiffeIdStats::default(),
                        });
                        continue;
                    }
                };

                let index = spiffe_sources.len();
                spiffe_sources.push(SpiffeIdSource {
                    name: name.clone(),
                    stored,
                    stats: ClusterSpiffeIdStats::default(),
                });

                let namespaces = self
                    .state
                    .list_namespaces(parsed.namespace_selector.as_ref())
                    .await?;
                for namespace in namespaces {
                    let namespace_name = namespace.metadata.name.clone().unwrap_or_default();
                    if self.is_ignored_namespace(&namespace_name) {
                        spiffe_sources[index].stats.namespaces_ignored += 1;
                        continue;
                    }
                    spiffe_sources[index].stats.namespaces_selected += 1;

                    let pods = self
                        .state
                        .list_pods(&namespace_name, parsed.pod_selector.as_ref())
                        .await?;
                    for pod in pods {
                        spiffe_sources[index].stats.pods_selected += 1;

                        // A transiently missing node still renders, against
                        // a zero-valued object. A render failure there is
                        // not counted; the pod is picked up once the cache
                        // catches up.
                        let (node, node_missing) = match pod
                            .spec
                            .as_ref()
                            .and_then(|spec| spec.node_name.as_deref())
                        {
                            Some(node_name) => match self.state.get_node(node_name).await? {
                                Some(node) => (node, false),
                                None => (Node::default(), true),
                            },
                            None => (Node::default(), true),
                        };

                        let pod_uid = pod.metadata.uid.clone().unwrap_or_default();
                        let endpoints = if parsed.auto_populate_dns_names {
                            self.state
                                .endpoints_for_pod(&namespace_name, &pod_uid)
                                .await?
                        } else {
                            Vec::new()
                        };

                        match parsed.templates.render(
                            &render_config,
                            &pod,
                            &node,
                            &endpoints,
                            parsed.auto_populate_dns_names,
                        ) {
                            Ok(rendered) => declared.push(DeclaredEntry {
                                entry: RegistrationEntry {
                                    id: String::new(),
                                    spiffe_id: rendered.spiffe_id,
                                    parent_id: rendered.parent_id,
                                    selectors: rendered.selectors,
                                    x509_svid_ttl: parsed.x509_svid_ttl,
                                    jwt_svid_ttl: parsed.jwt_svid_ttl,
                                    federates_with: parsed.federates_with.clone(),
                                    dns_names: rendered.dns_names,
                                    admin: parsed.admin,
                                    downstream: parsed.downstream,
                                    store_svid: false,
                                    hint: parsed.hint.clone(),
                                },
                                meta: parsed.meta.clone(),
                                source: SourceRef::SpiffeId(index),
                                pod_uid: Some(pod_uid),
                                fallback: parsed.fallback,
                            }),
                            Err(err) if node_missing => {
                                debug!(
                                    "ClusterSPIFFEID {}: pod {}/{} skipped, node not in cache: {}",
                                    name,
                                    namespace_name,
                                    pod.metadata.name.as_deref().unwrap_or(""),
                                    err
                                );
                            }
                            Err(err) => {
                                spiffe_sources[index].stats.entry_render_failures += 1;
                                warn!(
                                    "ClusterSPIFFEID {}: pod {}/{} does not render: {}",
                                    name,
                                    namespace_name,
                                    pod.metadata.name.as_deref().unwrap_or(""),
                                    err
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok((declared, spiffe_sources, static_sources))
    }

    async fn write_statuses(
        &self,
        spiffe_sources: Vec<SpiffeIdSource>,
        static_sources: Vec<StaticSource>,
    ) -> Result<()> {
        for source in spiffe_sources {
            let status = ClusterSpiffeIdStatus {
                stats: source.stats,
            };
            if source.stored.clone().unwrap_or_default() != status {
                self.state
                    .update_cluster_spiffe_id_status(&source.name, &status)
                    .await?;
            }
        }

        for source in static_sources {
            if source.stored.clone().unwrap_or_default() != source.status {
                self.state
                    .update_cluster_static_entry_status(&source.name, &source.status)
                    .await?;
            }
        }

        Ok(())
    }

    fn is_ignored_namespace(&self, name: &str) -> bool {
        self.config
            .ignore_namespaces
            .iter()
            .any(|pattern| pattern.is_match(name))
    }

    fn log_unsupported_transitions(&self, unsupported: &BTreeSet<EntryField>) {
        let mut last = self.last_unsupported.lock().unwrap();

        if let Some(previous) = &*last {
            for field in unsupported.difference(previous) {
                warn!(
                    "Entry field {} is not supported by this SPIRE server and will not be reconciled",
                    field
                );
            }
            for field in previous.difference(unsupported) {
                info!("Entry field {} is now supported by this SPIRE server", field);
            }
        } else {
            for field in unsupported {
                warn!(
                    "Entry field {} is not supported by this SPIRE server and will not be reconciled",
                    field
                );
            }
        }

        *last = Some(unsupported.clone());
    }
}

#[async_trait::async_trait]
impl reconcile_trigger::Reconciler for EntryReconciler {
    fn name(&self) -> &str {
        "entry"
    }

    async fn reconcile(&self) -> Result<()> {
        self.reconcile_pass().await
    }
}

fn mark_set(source: SourceRef, static_sources: &mut [StaticSource]) {
    if let SourceRef::Static(index) = source {
        static_sources[index].status.set = true;
    }
}

fn mark_failed(source: SourceRef, spiffe_sources: &mut [SpiffeIdSource]) {
    if let SourceRef::SpiffeId(index) = source {
        spiffe_sources[index].stats.entry_failures += 1;
    }
}

fn source_name(
    source: SourceRef,
    spiffe_sources: &[SpiffeIdSource],
    static_sources: &[StaticSource],
) -> String {
    match source {
        SourceRef::SpiffeId(index) => format!("ClusterSPIFFEID {}", spiffe_sources[index].name),
        SourceRef::Static(index) => format!("ClusterStaticEntry {}", static_sources[index].name),
    }
}

/// Entries from fallback rules apply only to pods no non-fallback rule
/// selected.
fn apply_fallback(declared: Vec<DeclaredEntry>) -> Vec<DeclaredEntry> {
    let covered: HashSet<String> = declared
        .iter()
        .filter(|entry| !entry.fallback)
        .filter_map(|entry| entry.pod_uid.clone())
        .collect();

    declared
        .into_iter()
        .filter(|entry| {
            !entry.fallback
                || entry
                    .pod_uid
                    .as_ref()
                    .map_or(true, |uid| !covered.contains(uid))
        })
        .collect()
}
