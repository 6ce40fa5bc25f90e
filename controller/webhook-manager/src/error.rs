// Copyright (c) Microsoft. All rights reserved.

use openssl::error::ErrorStack;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error generating webhook key pair: {0}")]
    Key(ErrorStack),
    #[error("Error building webhook CSR: {0}")]
    Csr(ErrorStack),
    #[error("PEM handling failed: {0}")]
    Pem(String),
    #[error("Error writing keypair file: {0}")]
    KeypairFile(std::io::Error),
    #[error("Error minting webhook SVID: {0}")]
    Mint(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Error fetching trust bundle: {0}")]
    Bundle(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Error reading webhook configuration: {0}")]
    ReadWebhook(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Error patching webhook configuration: {0}")]
    PatchWebhook(Box<dyn std::error::Error + Send + Sync + 'static>),
}
