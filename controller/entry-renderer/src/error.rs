// Copyright (c) Microsoft. All rights reserved.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SPIFFE ID template must not be empty")]
    EmptySpiffeIdTemplate,
    #[error("Duplicate DNS name template {0}")]
    DuplicateDnsNameTemplate(String),
    #[error("Error parsing template {template}: {source}")]
    TemplateParse {
        template: String,
        source: tera::Error,
    },
    #[error("Error rendering template {template}: {source}")]
    TemplateRender {
        template: String,
        source: tera::Error,
    },
    #[error("Rendered SPIFFE ID {0} is not valid")]
    InvalidRenderedSpiffeId(String),
    #[error("Rendered SPIFFE ID {id} is outside trust domain {expected}")]
    WrongTrustDomain { id: String, expected: String },
    #[error("Rendered selector {0} is not type:value")]
    InvalidRenderedSelector(String),
    #[error("A DNS name template rendered to an empty string")]
    EmptyRenderedDnsName,
    #[error("Error building template context: {0}")]
    ContextSerialization(serde_json::Error),
}
