// Copyright (c) Microsoft. All rights reserved.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid template: {0}")]
    Template(#[from] entry_renderer::error::Error),
    #[error("Invalid label selector: {0}")]
    LabelSelector(String),
    #[error("Invalid trust domain in federatesWith: {0}")]
    FederatesWith(String),
    #[error("Invalid trust domain: {0}")]
    TrustDomain(String),
    #[error("Invalid SPIFFE ID {0}")]
    SpiffeId(String),
    #[error("SPIFFE ID {id} is outside trust domain {expected}")]
    WrongTrustDomain { id: String, expected: String },
    #[error("Invalid selector {0}")]
    Selector(String),
    #[error("Invalid bundle endpoint URL {url}: {reason}")]
    BundleEndpointUrl { url: String, reason: String },
    #[error("Bundle endpoint profile {0} is not one of https_web, https_spiffe")]
    BundleEndpointProfile(String),
    #[error("endpointSPIFFEID must be set with the https_spiffe profile")]
    MissingEndpointSpiffeId,
    #[error("endpointSPIFFEID must not be set with the https_web profile")]
    UnexpectedEndpointSpiffeId,
}
