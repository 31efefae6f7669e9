//! Transport capability interface and the reqwest-backed implementation.
//!
//! The stream does not own sockets. It depends on two small interfaces:
//! [`Transport`] opens one request and yields a [`FeedBody`], which delivers
//! bytes, signals a graceful end, or signals an error. Pausing is implicit:
//! a body that is not being polled is a transport that is not being read.
//!
//! Tests inject scripted implementations instead of touching the network;
//! production uses [`HttpTransport`].

use crate::error::{ChangesError, Result};
use crate::protocol::{Method, RequestPlan};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// A streaming response body.
#[async_trait]
pub trait FeedBody: Send {
    /// The next chunk of bytes; `Ok(None)` is a graceful remote end.
    async fn chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Issues a single `_changes` request.
///
/// Implementations must resolve with an error for non-success statuses, so
/// the retry controller sees them like any other connection failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the request described by `plan` and expose its body.
    async fn open(&self, plan: &RequestPlan) -> Result<Box<dyn FeedBody>>;
}

/// reqwest-backed [`Transport`].
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with `connect_timeout` bounding connection
    /// establishment. The overall request is deliberately unbounded; a
    /// continuous feed stays open for as long as the server has changes.
    pub fn new(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .unwrap_or_default();
        HttpTransport { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, plan: &RequestPlan) -> Result<Box<dyn FeedBody>> {
        let method = match plan.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        // Credentials embedded in the database URI become basic auth; the
        // URI itself goes out without them.
        let mut url = plan.url.clone();
        let username = url.username().to_string();
        let password = url.password().map(str::to_string);
        if !username.is_empty() || password.is_some() {
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }

        let mut builder = self
            .client
            .request(method, url)
            .header("accept", "application/json");

        if !username.is_empty() || password.is_some() {
            builder = builder.basic_auth(username, password);
        }

        if let Some(body) = &plan.body {
            builder = builder
                .header("content-type", "application/json")
                .body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChangesError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChangesError::Status {
                code: status.as_u16(),
            });
        }

        Ok(Box::new(HttpBody { response }))
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl FeedBody for HttpBody {
    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| ChangesError::Transport(e.to_string()))
    }
}
