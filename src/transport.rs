use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::TryStreamExt;

use crate::{error::BoxError, Body, Request, Response, Result};

/// The send primitive: dispatches one request and yields one response or
/// error.
///
/// Implementations must hand back a response whose body is still unread and
/// owned by the caller, and must be able to reuse the connection once that
/// body has been read to the end.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: Request) -> Result<Response> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: Request) -> Result<Response> {
        (**self).send(request).await
    }
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    timeout: Option<Duration>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: None,
        }
    }

    /// Default per-attempt timeout, used when a request carries none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build(&self, request: Request) -> reqwest::RequestBuilder {
        let Request {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.http.request(method, url).headers(headers);
        if let Some(timeout) = timeout.or(self.timeout) {
            builder = builder.timeout(timeout);
        }
        match body {
            Body::Empty => builder,
            Body::Full(bytes) => builder.body(bytes),
            Body::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let response = self.build(request).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        // reqwest returns the connection to its pool once this stream ends or
        // is dropped.
        let body = response
            .bytes_stream()
            .map_err(|err| -> BoxError { Box::new(err) });
        Ok(Response::new(status, headers, body))
    }
}
