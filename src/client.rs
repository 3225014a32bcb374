use std::{fmt, sync::Arc};

use reqwest::{
    header::{self, HeaderValue},
    Method, Url,
};
use serde::Serialize;

use crate::{
    Body, HttpRetryError, ReqwestTransport, Request, Response, Result, RetryOptions,
    RetryingTransport, Transport,
};

/// Creates a client backed by a default `reqwest::Client` and default
/// retry options.
pub fn new_retryable_client() -> RetryableClient {
    RetryableClient::new()
}

/// HTTP client whose every request goes through [`RetryingTransport`].
#[derive(Clone)]
pub struct RetryableClient {
    transport: RetryingTransport<Arc<dyn Transport>>,
    options: RetryOptions,
}

impl fmt::Debug for RetryableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryableClient")
            .field("options", &self.options)
            .finish()
    }
}

impl Default for RetryableClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryableClient {
    pub fn new() -> Self {
        Self::from_reqwest(reqwest::Client::new())
    }

    /// Routes requests through an existing `reqwest::Client` so its pool,
    /// TLS and proxy settings are shared.
    pub fn from_reqwest(http: reqwest::Client) -> Self {
        Self::with_transport(ReqwestTransport::new(http))
    }

    /// Routes requests through any [`Transport`].
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        let options = RetryOptions::default();
        let inner: Arc<dyn Transport> = Arc::new(transport);
        Self {
            transport: RetryingTransport::with_options(inner, &options),
            options,
        }
    }

    /// Applies retry options such as retry count, backoff and deadline.
    pub fn with_options(mut self, opts: RetryOptions) -> Self {
        let inner = Arc::clone(self.transport.inner());
        self.transport = RetryingTransport::with_options(inner, &opts);
        self.options = opts;
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::GET, parse_url(url)?)).await
    }

    pub async fn head(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::HEAD, parse_url(url)?)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.execute(Request::new(Method::DELETE, parse_url(url)?)).await
    }

    /// Sends `body` with the given content type.
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> Result<Response> {
        let request = Self::with_content(Method::POST, url, content_type, body.into())?;
        self.execute(request).await
    }

    pub async fn put(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> Result<Response> {
        let request = Self::with_content(Method::PUT, url, content_type, body.into())?;
        self.execute(request).await
    }

    /// Serializes `payload` and posts it as `application/json`.
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, payload: &T) -> Result<Response> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            HttpRetryError::InvalidRequest(format!("payload could not be serialized: {err}"))
        })?;
        self.post(url, "application/json", body).await
    }

    /// Sends a fully built request.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.transport.execute(request).await
    }

    fn with_content(method: Method, url: &str, content_type: &str, body: Body) -> Result<Request> {
        let content_type = HeaderValue::from_str(content_type).map_err(|err| {
            HttpRetryError::InvalidRequest(format!("invalid content type '{content_type}': {err}"))
        })?;
        Ok(Request::new(method, parse_url(url)?)
            .with_header(header::CONTENT_TYPE, content_type)
            .with_body(body))
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url.trim())
        .map_err(|err| HttpRetryError::InvalidRequest(format!("invalid url '{url}': {err}")))
}
