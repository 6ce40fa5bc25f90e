// Copyright (c) Microsoft. All rights reserved.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not make connector: {0}")]
    Connector(String),
    #[error("Timed out dialing SPIRE server socket {0}")]
    DialTimeout(String),
    #[error("Error building request: {0}")]
    Request(String),
    #[error("Error sending request to SPIRE server: {0}")]
    Transport(hyper::Error),
    #[error("Unexpected status {status} from SPIRE server: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("Error serializing or parsing SPIRE server payload: {0}")]
    Serialization(serde_json::Error),
}
