use std::{fmt, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt};

use crate::{error::BoxError, HttpRetryError, Result};

/// One-shot stream of request body chunks.
pub type BodyStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, BoxError>> + Send + Sync>>;

/// Request body.
///
/// A `Stream` body can be read exactly once. [`crate::RetryingTransport`]
/// reads it into memory before the first attempt and sends every attempt a
/// `Full` view over the same bytes.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    /// Wraps a fallible chunk stream, such as a file reader or upstream body.
    pub fn wrap_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::Stream(Box::pin(stream.map_err(|err| -> BoxError { err.into() })))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
        }
    }

    /// Bytes of an in-memory body. `None` for empty and streaming bodies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Full(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }

    /// Reads the whole body into memory.
    ///
    /// Returns `None` for an empty body. Stream errors map to
    /// [`HttpRetryError::BodyRead`].
    pub async fn collect(self) -> Result<Option<Bytes>> {
        match self {
            Self::Empty => Ok(None),
            Self::Full(bytes) => Ok(Some(bytes)),
            Self::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk.map_err(HttpRetryError::BodyRead)?);
                }
                Ok(Some(buf.freeze()))
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Full(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Full(Bytes::from_static(bytes))
    }
}

/// Request body held in memory for the lifetime of one logical request.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReplayableBody {
    bytes: Option<Bytes>,
}

impl ReplayableBody {
    /// Reads `body` once. Streams are consumed; nothing is read for `Empty`.
    pub(crate) async fn buffer(body: Body) -> Result<Self> {
        Ok(Self {
            bytes: body.collect().await?,
        })
    }

    /// Fresh body for one attempt. Views never share a read position.
    pub(crate) fn view(&self) -> Body {
        match &self.bytes {
            Some(bytes) => Body::Full(bytes.clone()),
            None => Body::Empty,
        }
    }

    #[cfg(any(test, feature = "tracing"))]
    pub(crate) fn len(&self) -> usize {
        self.bytes.as_ref().map_or(0, Bytes::len)
    }
}
