// Copyright (c) Microsoft. All rights reserved.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Error parsing config file: {0}")]
    Parse(serde_yaml::Error),
    #[error("Required config field {0} is missing or empty")]
    MissingField(&'static str),
    #[error("trust_domain {0} is not a valid trust domain")]
    InvalidTrustDomain(String),
    #[error("entry_id_prefix must not be empty")]
    EmptyEntryIdPrefix,
    #[error("entry_id_prefix and entry_id_prefix_cleanup are both {0}; they must differ")]
    PrefixCleanupConflict(String),
    #[error("ignore_namespaces pattern {pattern} does not compile: {source}")]
    IgnoreNamespacePattern {
        pattern: String,
        source: regex::Error,
    },
}
