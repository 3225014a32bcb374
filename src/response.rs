use std::{fmt, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_util::{stream, Stream, StreamExt};
use reqwest::{header::HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::{error::BoxError, HttpRetryError, Result};

/// One-shot stream of response body chunks.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, BoxError>> + Send>>;

/// A response whose body has not been read yet.
///
/// The body stream owns whatever connection resources the transport attached
/// to it. Reading it to the end lets the transport reuse the connection;
/// dropping the response releases it on every path.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseStream,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

impl Response {
    pub fn new<S>(status: StatusCode, headers: HeaderMap, body: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: Box::pin(body),
        }
    }

    /// Response with an in-memory body.
    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let chunks = if body.is_empty() { None } else { Some(Ok(body)) };
        Self::new(status, HeaderMap::new(), stream::iter(chunks))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_body_stream(self) -> ResponseStream {
        self.body
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(HttpRetryError::Transport)?);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| HttpRetryError::Decode(format!("response body is not UTF-8: {err}")))
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            HttpRetryError::Decode(format!(
                "invalid response JSON: {err}; body: {}",
                String::from_utf8_lossy(&bytes)
            ))
        })
    }

    /// Reads the body to completion and discards it.
    ///
    /// Returns the number of bytes discarded. The response is consumed, so
    /// the body is released even when reading fails halfway.
    pub async fn drain(self) -> Result<u64> {
        let mut body = self.body;
        let mut discarded = 0u64;
        while let Some(chunk) = body.next().await {
            discarded += chunk.map_err(HttpRetryError::Transport)?.len() as u64;
        }
        Ok(discarded)
    }
}
