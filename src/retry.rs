use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Instant};

use crate::{
    body::ReplayableBody, AttemptOutcome, HttpRetryError, Request, Response, Result, RetryOptions,
    RetryPolicy, Transport,
};

/// Wraps a [`Transport`] and transparently retries transient failures.
///
/// The request body is read into memory once, then every attempt gets its
/// own view of those bytes. Responses that are retried are drained before
/// the next attempt so the inner transport can reuse the connection.
#[derive(Clone, Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
    max_retries: usize,
    deadline: Option<Duration>,
}

impl<T: Transport> RetryingTransport<T> {
    /// Wraps `inner` with the default options.
    pub fn new(inner: T) -> Self {
        Self::with_options(inner, &RetryOptions::default())
    }

    pub fn with_options(inner: T, opts: &RetryOptions) -> Self {
        Self {
            inner,
            policy: RetryPolicy::from_options(opts),
            max_retries: opts.max_retries,
            deadline: opts.deadline,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Sends `request`, retrying until the policy gives up or `max_retries`
    /// is reached.
    ///
    /// The last attempt's outcome is returned as-is: an exhausted retryable
    /// status comes back as `Ok(response)`, an exhausted transport failure as
    /// the original error.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let Request {
            method,
            url,
            headers,
            body,
            timeout: attempt_timeout,
        } = request;
        let replay = ReplayableBody::buffer(body).await?;
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            let request = Request {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: replay.view(),
                timeout: attempt_timeout,
            };

            let outcome = self.send_attempt(request, started, attempt).await;
            if matches!(outcome, Err(HttpRetryError::DeadlineExceeded { .. })) {
                return outcome;
            }

            if !self.policy.should_retry(&AttemptOutcome::of(&outcome)) {
                return outcome;
            }
            if attempt >= self.max_retries {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    %method,
                    %url,
                    attempts = attempt + 1,
                    "retries exhausted, returning last outcome"
                );
                return outcome;
            }

            let delay = self.policy.backoff_delay(attempt);
            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay >= deadline {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        %method,
                        %url,
                        attempts = attempt + 1,
                        "deadline leaves no room for another attempt"
                    );
                    return outcome;
                }
            }

            match outcome {
                Ok(response) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        %method,
                        %url,
                        attempt,
                        status = response.status().as_u16(),
                        body_len = replay.len(),
                        "retrying after {} ms",
                        delay.as_millis()
                    );

                    self.drain_discarded(response, started, attempt).await?;
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        %method,
                        %url,
                        attempt,
                        error = %_err,
                        "retrying after {} ms",
                        delay.as_millis()
                    );
                }
            }

            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Drains a response that is about to be retried, within the deadline.
    ///
    /// A failed drain is only logged; the response is dropped either way.
    async fn drain_discarded(
        &self,
        response: Response,
        started: Instant,
        attempt: usize,
    ) -> Result<()> {
        let drained = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                match timeout(remaining, response.drain()).await {
                    Ok(drained) => drained,
                    Err(_) => {
                        return Err(HttpRetryError::DeadlineExceeded {
                            attempts: attempt + 1,
                        })
                    }
                }
            }
            None => response.drain().await,
        };

        if let Err(_err) = drained {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_err, "discarded response did not drain cleanly");
        }
        Ok(())
    }

    async fn send_attempt(
        &self,
        request: Request,
        started: Instant,
        attempt: usize,
    ) -> Result<Response> {
        let Some(deadline) = self.deadline else {
            return self.inner.send(request).await;
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        match timeout(remaining, self.inner.send(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HttpRetryError::DeadlineExceeded {
                attempts: attempt + 1,
            }),
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        self.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        task::{Context, Poll},
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::{stream, Stream};
    use reqwest::{header::HeaderMap, Method, StatusCode, Url};
    use tokio::time::Instant;

    use super::RetryingTransport;
    use crate::{
        error::BoxError, Body, HttpRetryError, Request, Response, Result, RetryOptions, Transport,
    };

    enum Scripted {
        Fail,
        Status(StatusCode, &'static str),
        Stall(Duration),
        /// Retryable status whose body never yields.
        Hang(StatusCode),
        /// Retryable status whose body fails after one chunk.
        Broken(StatusCode),
    }

    /// Body stream that bumps a shared counter once it has been read to the
    /// end, standing in for a connection going back to the pool.
    struct TrackedBody {
        chunks: VecDeque<Bytes>,
        drained: Arc<AtomicUsize>,
        finished: bool,
    }

    impl Stream for TrackedBody {
        type Item = std::result::Result<Bytes, BoxError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            if let Some(chunk) = self.chunks.pop_front() {
                return Poll::Ready(Some(Ok(chunk)));
            }
            if !self.finished {
                self.finished = true;
                self.drained.fetch_add(1, Ordering::SeqCst);
            }
            Poll::Ready(None)
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        sends: AtomicUsize,
        drained: Arc<AtomicUsize>,
        drained_at_send: Mutex<Vec<usize>>,
        bodies: Mutex<Vec<Option<Bytes>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, mut request: Request) -> Result<Response> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.drained_at_send
                .lock()
                .expect("drain log mutex must not be poisoned")
                .push(self.drained.load(Ordering::SeqCst));

            let body = request.take_body().collect().await?;
            self.bodies
                .lock()
                .expect("body log mutex must not be poisoned")
                .push(body);

            let next = self
                .script
                .lock()
                .expect("script mutex must not be poisoned")
                .pop_front()
                .unwrap_or(Scripted::Status(StatusCode::OK, "default"));

            match next {
                Scripted::Fail => Err(HttpRetryError::Transport(Box::new(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))),
                Scripted::Status(status, text) => {
                    let body = TrackedBody {
                        chunks: VecDeque::from([Bytes::from_static(text.as_bytes())]),
                        drained: Arc::clone(&self.drained),
                        finished: false,
                    };
                    Ok(Response::new(status, HeaderMap::new(), body))
                }
                Scripted::Hang(status) => Ok(Response::new(
                    status,
                    HeaderMap::new(),
                    stream::pending::<std::result::Result<Bytes, BoxError>>(),
                )),
                Scripted::Broken(status) => {
                    let chunks: Vec<std::result::Result<Bytes, BoxError>> = vec![
                        Ok(Bytes::from_static(b"partial")),
                        Err(Box::new(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "connection reset",
                        )) as BoxError),
                    ];
                    Ok(Response::new(status, HeaderMap::new(), stream::iter(chunks)))
                }
                Scripted::Stall(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Response::from_bytes(StatusCode::OK, "late"))
                }
            }
        }
    }

    fn get() -> Request {
        Request::new(
            Method::GET,
            Url::parse("http://upstream.test/users/2").expect("valid url"),
        )
    }

    fn post(body: impl Into<Body>) -> Request {
        Request::new(
            Method::POST,
            Url::parse("http://upstream.test/users").expect("valid url"),
        )
        .with_body(body)
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_transport_errors() {
        let inner = ScriptedTransport::new(vec![
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Status(StatusCode::OK, "ok"),
        ]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let started = Instant::now();
        let response = transport.execute(get()).await.expect("third attempt succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(inner.sends(), 3);
        // 1s + 2s: exactly two backoff delays.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(response.text().await.expect("body"), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retryable_status_returns_last_response() {
        let inner = ScriptedTransport::new(
            (0..5)
                .map(|_| Scripted::Status(StatusCode::SERVICE_UNAVAILABLE, "busy"))
                .collect(),
        );
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let started = Instant::now();
        let response = transport
            .execute(get())
            .await
            .expect("exhausted status is not an error");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(inner.sends(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_error_is_surfaced_unchanged() {
        let inner = ScriptedTransport::new((0..4).map(|_| Scripted::Fail).collect());
        let transport = RetryingTransport::with_options(
            Arc::clone(&inner),
            &RetryOptions {
                max_retries: 2,
                ..RetryOptions::default()
            },
        );

        let err = transport.execute(get()).await.expect_err("must fail");

        assert_eq!(inner.sends(), 3);
        let source = err
            .transport_source::<io::Error>()
            .expect("original io error must be preserved");
        assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_returns_immediately() {
        let inner = ScriptedTransport::new(vec![Scripted::Status(StatusCode::NOT_FOUND, "nope")]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let started = Instant::now();
        let response = transport.execute(get()).await.expect("404 is a response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(inner.sends(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_sends_once() {
        let inner = ScriptedTransport::new(vec![Scripted::Fail]);
        let transport = RetryingTransport::with_options(
            Arc::clone(&inner),
            &RetryOptions {
                max_retries: 0,
                ..RetryOptions::default()
            },
        );

        assert!(transport.execute(get()).await.is_err());
        assert_eq!(inner.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_responses_are_drained_before_next_send() {
        let inner = ScriptedTransport::new(vec![
            Scripted::Status(StatusCode::BAD_GATEWAY, "bad gateway"),
            Scripted::Status(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"),
            Scripted::Status(StatusCode::OK, "fine"),
        ]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let response = transport.execute(get()).await.expect("must succeed");

        let drained_at_send = inner
            .drained_at_send
            .lock()
            .expect("drain log mutex must not be poisoned")
            .clone();
        assert_eq!(drained_at_send, vec![0, 1, 2]);
        // The returned response is still open for the caller.
        assert_eq!(inner.drained.load(Ordering::SeqCst), 2);

        response.drain().await.expect("caller drains");
        assert_eq!(inner.drained.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_carries_identical_body() {
        let inner = ScriptedTransport::new(vec![
            Scripted::Fail,
            Scripted::Status(StatusCode::SERVICE_UNAVAILABLE, ""),
            Scripted::Status(StatusCode::CREATED, "created"),
        ]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(br#"{"name":"#)),
            Ok(Bytes::from_static(br#""morpheus"}"#)),
        ];
        let request = post(Body::wrap_stream(stream::iter(chunks)));

        let response = transport.execute(request).await.expect("must succeed");
        assert_eq!(response.status(), StatusCode::CREATED);

        let bodies = inner
            .bodies
            .lock()
            .expect("body log mutex must not be poisoned")
            .clone();
        let expected = Some(Bytes::from_static(br#"{"name":"morpheus"}"#));
        assert_eq!(bodies, vec![expected.clone(), expected.clone(), expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn bodiless_request_sends_no_body() {
        let inner = ScriptedTransport::new(vec![Scripted::Fail, Scripted::Status(StatusCode::OK, "")]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        transport.execute(get()).await.expect("must succeed");

        let bodies = inner
            .bodies
            .lock()
            .expect("body log mutex must not be poisoned")
            .clone();
        assert_eq!(bodies, vec![None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_body_fails_without_sending() {
        let inner = ScriptedTransport::new(vec![]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "upload source closed",
        ))];
        let err = transport
            .execute(post(Body::wrap_stream(stream::iter(chunks))))
            .await
            .expect_err("body read must fail");

        assert!(matches!(err, HttpRetryError::BodyRead(_)));
        assert_eq!(inner.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_method_url_and_headers() {
        struct Echo;

        #[async_trait]
        impl Transport for Echo {
            async fn send(&self, request: Request) -> Result<Response> {
                let summary = format!(
                    "{} {} {}",
                    request.method(),
                    request.url(),
                    request
                        .headers()
                        .get("x-trace")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-")
                );
                Ok(Response::from_bytes(StatusCode::OK, summary))
            }
        }

        let transport = RetryingTransport::new(Echo);
        let request = get().with_header(
            reqwest::header::HeaderName::from_static("x-trace"),
            reqwest::header::HeaderValue::from_static("abc"),
        );

        let text = transport
            .execute(request)
            .await
            .expect("echo")
            .text()
            .await
            .expect("text");
        assert_eq!(text, "GET http://upstream.test/users/2 abc");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_backoff_schedule_early() {
        let inner = ScriptedTransport::new((0..4).map(|_| Scripted::Fail).collect());
        let transport = RetryingTransport::with_options(
            Arc::clone(&inner),
            &RetryOptions {
                deadline: Some(Duration::from_millis(2_500)),
                ..RetryOptions::default()
            },
        );

        let started = Instant::now();
        let err = transport.execute(get()).await.expect_err("must fail");

        // Attempt 0, sleep 1s, attempt 1; the 2s backoff would overrun.
        assert!(matches!(err, HttpRetryError::Transport(_)));
        assert_eq!(inner.sends(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_stalled_attempt() {
        let inner = ScriptedTransport::new(vec![Scripted::Stall(Duration::from_secs(60))]);
        let transport = RetryingTransport::with_options(
            Arc::clone(&inner),
            &RetryOptions {
                deadline: Some(Duration::from_secs(5)),
                ..RetryOptions::default()
            },
        );

        let started = Instant::now();
        let err = transport.execute(get()).await.expect_err("must time out");

        assert!(matches!(err, HttpRetryError::DeadlineExceeded { attempts: 1 }));
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_stalled_drain() {
        let inner = ScriptedTransport::new(vec![Scripted::Hang(StatusCode::SERVICE_UNAVAILABLE)]);
        let transport = RetryingTransport::with_options(
            Arc::clone(&inner),
            &RetryOptions {
                deadline: Some(Duration::from_secs(5)),
                ..RetryOptions::default()
            },
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(600), transport.execute(get()))
            .await
            .expect("execute must return at the deadline");

        let err = outcome.expect_err("stalled drain must hit the deadline");
        assert!(matches!(err, HttpRetryError::DeadlineExceeded { attempts: 1 }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(inner.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_drain_still_retries() {
        let inner = ScriptedTransport::new(vec![
            Scripted::Broken(StatusCode::BAD_GATEWAY),
            Scripted::Status(StatusCode::OK, "recovered"),
        ]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let started = Instant::now();
        let response = transport.execute(get()).await.expect("second attempt succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(inner.sends(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(response.text().await.expect("body"), "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_do_not_share_state() {
        let inner = ScriptedTransport::new(vec![]);
        let transport = RetryingTransport::new(Arc::clone(&inner));

        let (a, b) = tokio::join!(
            transport.execute(post("first")),
            transport.execute(post("second")),
        );
        assert_eq!(a.expect("a").status(), StatusCode::OK);
        assert_eq!(b.expect("b").status(), StatusCode::OK);

        let mut bodies = inner
            .bodies
            .lock()
            .expect("body log mutex must not be poisoned")
            .clone();
        bodies.sort();
        assert_eq!(
            bodies,
            vec![
                Some(Bytes::from_static(b"first")),
                Some(Bytes::from_static(b"second")),
            ]
        );
    }
}
