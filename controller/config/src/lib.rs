// Copyright (c) Microsoft. All rights reserved.

//! Controller configuration: one YAML file, environment-variable expansion
//! behind a flag, defaults matching the deployment charts, and startup
//! validation. Anything invalid here is fatal; the daemon exits instead of
//! running half-configured.

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

use std::path::{Path, PathBuf};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use cluster_resources::ClassMatcher;
use core_objects::TrustDomain;

use error::Error;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_SPIRE_SERVER_SOCKET_PATH: &str = "/spire-server/api.sock";
pub const DEFAULT_WEBHOOK_CONFIGURATION_NAME: &str = "spire-controller-manager-webhook";

const CLUSTER_DOMAIN_PROBE_HOST: &str = "kubernetes.default.svc";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub trust_domain: String,
    pub cluster_name: String,

    /// Detected from the cluster DNS when unset.
    #[serde(default)]
    pub cluster_domain: Option<String>,

    #[serde(default = "default_ignore_namespaces")]
    pub ignore_namespaces: Vec<String>,

    /// Seconds between reconciles when nothing triggers one.
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,

    #[serde(default = "default_spire_server_socket_path")]
    pub spire_server_socket_path: PathBuf,

    #[serde(default = "default_webhook_configuration_name")]
    pub validating_webhook_configuration_name: String,

    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub watch_classless: bool,

    #[serde(default)]
    pub parent_id_template: Option<String>,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub entry_id_prefix: Option<String>,
    /// May be the empty string: clean up entries whose id contains no dot.
    #[serde(default)]
    pub entry_id_prefix_cleanup: Option<String>,

    #[serde(default)]
    pub static_manifest_path: Option<PathBuf>,

    #[serde(default)]
    pub cache_namespaces: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub cluster_spiffe_ids: bool,
    pub cluster_federated_trust_domains: bool,
    pub cluster_static_entries: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            cluster_spiffe_ids: true,
            cluster_federated_trust_domains: true,
            cluster_static_entries: true,
        }
    }
}

fn default_ignore_namespaces() -> Vec<String> {
    vec![
        "kube-system".to_string(),
        "kube-public".to_string(),
        "spire-system".to_string(),
    ]
}

fn default_gc_interval() -> u64 {
    DEFAULT_GC_INTERVAL_SECONDS
}

fn default_spire_server_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SPIRE_SERVER_SOCKET_PATH)
}

fn default_webhook_configuration_name() -> String {
    DEFAULT_WEBHOOK_CONFIGURATION_NAME.to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>, expand_env: bool) -> Result<Config, Error> {
        let text = std::fs::read_to_string(&path).map_err(|err| Error::Read {
            path: path.as_ref().to_path_buf(),
            source: err,
        })?;

        let text = if expand_env {
            expand_env_vars(&text)
        } else {
            text
        };

        let config: Config = serde_yaml::from_str(&text).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        TrustDomain::new(&self.trust_domain)
            .map_err(|_| Error::InvalidTrustDomain(self.trust_domain.clone()))?;

        if self.cluster_name.is_empty() {
            return Err(Error::MissingField("cluster_name"));
        }

        if let Some(prefix) = &self.entry_id_prefix {
            if prefix.is_empty() {
                return Err(Error::EmptyEntryIdPrefix);
            }
        }

        if let (Some(prefix), Some(cleanup)) =
            (&self.entry_id_prefix, &self.entry_id_prefix_cleanup)
        {
            if prefix == cleanup {
                return Err(Error::PrefixCleanupConflict(prefix.clone()));
            }
        }

        self.ignore_namespace_patterns()?;

        Ok(())
    }

    pub fn trust_domain(&self) -> TrustDomain {
        TrustDomain::new(&self.trust_domain).expect("validated at load")
    }

    pub fn ignore_namespace_patterns(&self) -> Result<Vec<Regex>, Error> {
        self.ignore_namespaces
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| Error::IgnoreNamespacePattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn class_matcher(&self) -> ClassMatcher {
        ClassMatcher {
            class_name: self.class_name.clone(),
            watch_classless: self.watch_classless,
        }
    }

    #[must_use]
    pub fn static_mode(&self) -> bool {
        self.static_manifest_path.is_some()
    }
}

/// `${VAR}` expansion over the raw file text. Unset variables expand to the
/// empty string.
#[must_use]
pub fn expand_env_vars(text: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");
    pattern
        .replace_all(text, |captures: &regex::Captures<'_>| {
            std::env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Best-effort cluster-domain detection: the CNAME of
/// `kubernetes.default.svc` inside a cluster resolves to
/// `kubernetes.default.svc.<cluster domain>`.
pub async fn detect_cluster_domain() -> Option<String> {
    let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            debug!("No resolver for cluster-domain detection: {}", err);
            return None;
        }
    };

    let lookup = match resolver
        .lookup(
            CLUSTER_DOMAIN_PROBE_HOST,
            hickory_resolver::proto::rr::RecordType::CNAME,
        )
        .await
    {
        Ok(lookup) => lookup,
        Err(err) => {
            debug!("Cluster-domain CNAME lookup failed: {}", err);
            return None;
        }
    };

    for record in lookup.iter() {
        if let hickory_resolver::proto::rr::RData::CNAME(cname) = record {
            let name = cname.0.to_utf8();
            if let Some(domain) = cluster_domain_from_cname(&name) {
                return Some(domain);
            }
        }
    }

    None
}

fn cluster_domain_from_cname(cname: &str) -> Option<String> {
    let rest = cname.strip_prefix("kubernetes.default.svc.")?;
    let domain = rest.trim_end_matches('.');
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use matches::assert_matches;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config("trust_domain: td.test\ncluster_name: demo\n");
        let config = Config::load(file.path(), false).unwrap();

        assert_eq!(config.trust_domain().as_str(), "td.test");
        assert_eq!(config.gc_interval, 10);
        assert_eq!(
            config.spire_server_socket_path,
            PathBuf::from("/spire-server/api.sock")
        );
        assert_eq!(
            config.validating_webhook_configuration_name,
            "spire-controller-manager-webhook"
        );
        assert_eq!(
            config.ignore_namespaces,
            vec!["kube-system", "kube-public", "spire-system"]
        );
        assert!(config.reconcile.cluster_spiffe_ids);
        assert!(config.reconcile.cluster_federated_trust_domains);
        assert!(config.reconcile.cluster_static_entries);
        assert!(!config.static_mode());
    }

    #[test]
    fn full_config_round_trips() {
        let file = write_config(
            r#"
trust_domain: td.test
cluster_name: demo
cluster_domain: cluster.local
ignore_namespaces: ["^kube-"]
gc_interval: 30
spire_server_socket_path: /tmp/api.sock
validating_webhook_configuration_name: my-webhook
class_name: primary
watch_classless: true
parent_id_template: spiffe://{{ TrustDomain }}/custom/{{ NodeMeta.uid }}
reconcile:
  cluster_spiffe_ids: true
  cluster_federated_trust_domains: false
  cluster_static_entries: true
entry_id_prefix: blue
entry_id_prefix_cleanup: ""
static_manifest_path: /etc/manifests
cache_namespaces: ["apps", "batch"]
"#,
        );
        let config = Config::load(file.path(), false).unwrap();

        assert_eq!(config.gc_interval, 30);
        assert!(!config.reconcile.cluster_federated_trust_domains);
        assert_eq!(config.entry_id_prefix.as_deref(), Some("blue"));
        assert_eq!(config.entry_id_prefix_cleanup.as_deref(), Some(""));
        assert!(config.static_mode());

        let matcher = config.class_matcher();
        assert!(matcher.matches("primary"));
        assert!(matcher.matches(""));
        assert!(!matcher.matches("other"));
    }

    #[test]
    fn missing_required_fields_fail() {
        let file = write_config("cluster_name: demo\n");
        assert_matches!(Config::load(file.path(), false), Err(Error::Parse(_)));

        let file = write_config("trust_domain: td.test\ncluster_name: \"\"\n");
        assert_matches!(
            Config::load(file.path(), false),
            Err(Error::MissingField("cluster_name"))
        );
    }

    #[test]
    fn invalid_trust_domain_fails() {
        let file = write_config("trust_domain: NOT OK\ncluster_name: demo\n");
        assert_matches!(
            Config::load(file.path(), false),
            Err(Error::InvalidTrustDomain(_))
        );
    }

    #[test]
    fn equal_prefix_and_cleanup_fail() {
        let file = write_config(
            "trust_domain: td.test\ncluster_name: demo\nentry_id_prefix: blue\nentry_id_prefix_cleanup: blue\n",
        );
        assert_matches!(
            Config::load(file.path(), false),
            Err(Error::PrefixCleanupConflict(_))
        );
    }

    #[test]
    fn empty_prefix_fails_but_empty_cleanup_is_allowed() {
        let file = write_config(
            "trust_domain: td.test\ncluster_name: demo\nentry_id_prefix: \"\"\n",
        );
        assert_matches!(Config::load(file.path(), false), Err(Error::EmptyEntryIdPrefix));

        let file = write_config(
            "trust_domain: td.test\ncluster_name: demo\nentry_id_prefix: blue\nentry_id_prefix_cleanup: \"\"\n",
        );
        assert!(Config::load(file.path(), false).is_ok());
    }

    #[test]
    fn bad_ignore_namespace_pattern_fails() {
        let file = write_config(
            "trust_domain: td.test\ncluster_name: demo\nignore_namespaces: [\"(unclosed\"]\n",
        );
        assert_matches!(
            Config::load(file.path(), false),
            Err(Error::IgnoreNamespacePattern { .. })
        );
    }

    #[test]
    fn env_expansion_is_gated() {
        std::env::set_var("CONFIG_TEST_TD", "td.test");
        let file = write_config("trust_domain: ${CONFIG_TEST_TD}\ncluster_name: demo\n");

        let expanded = Config::load(file.path(), true).unwrap();
        assert_eq!(expanded.trust_domain, "td.test");

        // Without the flag the literal text stays, which is not a valid
        // trust domain.
        assert_matches!(
            Config::load(file.path(), false),
            Err(Error::InvalidTrustDomain(_))
        );
    }

    #[test]
    fn cluster_domain_cname_parsing() {
        assert_eq!(
            cluster_domain_from_cname("kubernetes.default.svc.cluster.local."),
            Some("cluster.local".to_string())
        );
        assert_eq!(
            cluster_domain_from_cname("kubernetes.default.svc.corp.example."),
            Some("corp.example".to_string())
        );
        assert_eq!(cluster_domain_from_cname("unrelated.example."), None);
        assert_eq!(cluster_domain_from_cname("kubernetes.default.svc."), None);
    }
}
