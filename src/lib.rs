//! `http-retry` is a retrying HTTP transport.
//!
//! [`RetryingTransport`] wraps any [`Transport`] and retries transport
//! failures and transient statuses (502, 503, 504 by default) with
//! exponential backoff:
//! - the request body is read once and replayed byte-for-byte on every attempt
//! - discarded responses are drained so the connection can be reused
//! - the last attempt's outcome is returned unchanged once retries run out
//!
//! [`RetryableClient`] puts the transport behind a small `get`/`post`/`execute`
//! surface backed by `reqwest`.

mod body;
mod client;
mod error;
mod options;
mod policy;
mod request;
mod response;
mod retry;
mod transport;

pub use body::{Body, BodyStream};
pub use client::{new_retryable_client, RetryableClient};
pub use error::{BoxError, HttpRetryError};
pub use options::RetryOptions;
pub use policy::{AttemptOutcome, RetryPolicy};
pub use request::Request;
pub use response::{Response, ResponseStream};
pub use retry::RetryingTransport;
pub use transport::{ReqwestTransport, Transport};

pub use bytes::Bytes;
pub use reqwest::{header, Method, StatusCode, Url};

pub type Result<T> = std::result::Result<T, HttpRetryError>;
