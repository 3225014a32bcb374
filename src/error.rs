/// Boxed error used for opaque transport and body-stream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum HttpRetryError {
    /// The request body could not be read into memory for replay.
    ///
    /// Never retried: a body that cannot be read once will not become
    /// readable on a later attempt.
    #[error("body read error: {0}")]
    BodyRead(#[source] BoxError),
    /// Failure reported by the underlying send primitive, or while reading
    /// a response body.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    /// The overall deadline elapsed while an attempt was in flight.
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: usize },
    /// The request could not be built (bad URL, unserializable payload).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Response body could not be decoded as text or JSON.
    #[error("decode error: {0}")]
    Decode(String),
}

impl HttpRetryError {
    /// Returns the original transport error if it is of type `E`.
    pub fn transport_source<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Transport(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether the underlying failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeadlineExceeded { .. } => true,
            _ => self
                .transport_source::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout),
        }
    }
}

impl From<reqwest::Error> for HttpRetryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}
