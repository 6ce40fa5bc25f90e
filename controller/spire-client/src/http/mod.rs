// Copyright (c) Microsoft. All rights reserved.

//! JSON-over-HTTP transport to the SPIRE server Unix socket. Carries the
//! typed shapes of `spire-server-api`; connecting uses a five second dial
//! deadline.

pub mod error;

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use hyper::{
    body,
    client::connect::{Connected, Connection},
    Body, Method, Request, StatusCode, Uri,
};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixStream,
};

use spire_server_api::{
    batch_create_entries, batch_create_federation_relationships, batch_delete_entries,
    batch_delete_federation_relationships, batch_update_entries,
    batch_update_federation_relationships, get_bundle, list_entries,
    list_federation_relationships, mint_x509_svid, ApiVersion,
};

use crate::SpireRpc;

use error::Error;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// The authority is a placeholder; routing happens on the socket.
const BASE_URL: &str = "http://spire-server.sock";

pub struct Client {
    client: hyper::Client<UnixConnector, Body>,
    api_version: ApiVersion,
}

impl Client {
    pub fn new(socket_path: impl AsRef<Path>) -> Result<Self, Error> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.as_os_str().is_empty() {
            return Err(Error::Connector("empty socket path".to_string()));
        }

        let connector = UnixConnector {
            socket_path: Arc::new(socket_path),
        };
        let client = hyper::Client::builder().build(connector);

        Ok(Client {
            client,
            api_version: ApiVersion::V2024_01_15,
        })
    }

    fn uri(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut uri = format!("{BASE_URL}{path}?api-version={}", self.api_version);
        for (key, value) in query {
            let value = utf8_percent_encode(value, NON_ALPHANUMERIC);
            uri.push_str(&format!("&{key}={value}"));
        }
        uri
    }

    async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, Error> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(|err| Error::Request(err.to_string()))?;

        self.send(request).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        uri: &str,
        request_body: &B,
    ) -> Result<T, Error> {
        let body = serde_json::to_vec(request_body).map_err(Error::Serialization)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|err| Error::Request(err.to_string()))?;

        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: Request<Body>) -> Result<T, Error> {
        let response = self.client.request(request).await.map_err(Error::Transport)?;

        let status = response.status();
        let bytes = body::to_bytes(response.into_body())
            .await
            .map_err(Error::Transport)?;

        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(Error::UnexpectedStatus {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        serde_json::from_slice(&bytes).map_err(Error::Serialization)
    }
}

#[async_trait::async_trait]
impl SpireRpc for Client {
    async fn list_entries(
        &self,
        params: list_entries::Params,
    ) -> crate::Result<list_entries::Response> {
        let mut query = vec![("page_size", params.page_size.to_string())];
        if let Some(token) = params.page_token {
            query.push(("page_token", token));
        }
        let uri = self.uri("/entries", &query);
        Ok(self.get_json(&uri).await?)
    }

    async fn batch_create_entries(
        &self,
        request: batch_create_entries::Request,
    ) -> crate::Result<batch_create_entries::Response> {
        let uri = self.uri("/entries/batch-create", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn batch_update_entries(
        &self,
        request: batch_update_entries::Request,
    ) -> crate::Result<batch_update_entries::Response> {
        let uri = self.uri("/entries/batch-update", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn batch_delete_entries(
        &self,
        request: batch_delete_entries::Request,
    ) -> crate::Result<batch_delete_entries::Response> {
        let uri = self.uri("/entries/batch-delete", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn list_federation_relationships(
        &self,
        params: list_federation_relationships::Params,
    ) -> crate::Result<list_federation_relationships::Response> {
        let mut query = vec![("page_size", params.page_size.to_string())];
        if let Some(token) = params.page_token {
            query.push(("page_token", token));
        }
        let uri = self.uri("/federation-relationships", &query);
        Ok(self.get_json(&uri).await?)
    }

    async fn batch_create_federation_relationships(
        &self,
        request: batch_create_federation_relationships::Request,
    ) -> crate::Result<batch_create_federation_relationships::Response> {
        let uri = self.uri("/federation-relationships/batch-create", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn batch_update_federation_relationships(
        &self,
        request: batch_update_federation_relationships::Request,
    ) -> crate::Result<batch_update_federation_relationships::Response> {
        let uri = self.uri("/federation-relationships/batch-update", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn batch_delete_federation_relationships(
        &self,
        request: batch_delete_federation_relationships::Request,
    ) -> crate::Result<batch_delete_federation_relationships::Response> {
        let uri = self.uri("/federation-relationships/batch-delete", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn mint_x509_svid(
        &self,
        request: mint_x509_svid::Request,
    ) -> crate::Result<mint_x509_svid::Response> {
        let uri = self.uri("/svid/mint-x509", &[]);
        Ok(self.post_json(&uri, &request).await?)
    }

    async fn get_bundle(&self) -> crate::Result<get_bundle::Response> {
        let uri = self.uri("/bundle", &[]);
        Ok(self.get_json(&uri).await?)
    }
}

#[derive(Clone)]
struct UnixConnector {
    socket_path: Arc<PathBuf>,
}

impl hyper::service::Service<Uri> for UnixConnector {
    type Response = UnixConnection;
    type Error = Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let socket_path = self.socket_path.clone();

        Box::pin(async move {
            let connect = UnixStream::connect(socket_path.as_path());
            let stream = tokio::time::timeout(DIAL_TIMEOUT, connect)
                .await
                .map_err(|_| Error::DialTimeout(socket_path.display().to_string()))?
                .map_err(|err| Error::Connector(err.to_string()))?;

            Ok(UnixConnection(stream))
        })
    }
}

struct UnixConnection(UnixStream);

impl Connection for UnixConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for UnixConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}
