// Copyright (c) Microsoft. All rights reserved.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid trust domain name {0}")]
    InvalidTrustDomain(String),
    #[error("Invalid SPIFFE ID {0}")]
    InvalidSpiffeId(String),
    #[error("SPIFFE ID path must start with / : {0}")]
    InvalidSpiffeIdPath(String),
    #[error("Invalid selector {0}, expected type:value")]
    InvalidSelector(String),
}
