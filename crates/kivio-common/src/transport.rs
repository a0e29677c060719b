//! HTTP transport seam
//!
//! Every component talks to the network through the [`Transport`] trait so
//! that tests can script whole clusters without sockets. The production
//! implementation is a thin reqwest wrapper.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Content type sent on every POST.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Historical alias some peers send instead of `application/json`.
/// Servers must accept it.
pub const JSON_CONTENT_TYPE_ALIAS: &str = "application-type/json";

/// Whether a request's content type is acceptable for a JSON body.
///
/// Accepts `application/json`, the historical `application-type/json`
/// alias, charset-suffixed variants, and requests without a content type.
#[must_use]
pub fn accepts_json(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => ct.contains("json"),
    }
}

/// A minimal HTTP response: status code plus raw body.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Outbound HTTP operations used by masters, nodes and the client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Response>;

    async fn post(&self, url: &str, body: Bytes) -> Result<Response>;
}

/// Production transport over a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose every request carries the given deadline.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Response> {
        let res = self.client.get(url).send().await?;
        let status = res.status().as_u16();
        let body = res.bytes().await?;
        Ok(Response { status, body })
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Response> {
        let res = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let status = res.status().as_u16();
        let body = res.bytes().await?;
        Ok(Response { status, body })
    }
}
