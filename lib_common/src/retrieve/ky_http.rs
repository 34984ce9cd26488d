//! # HTTP Retrieval Utilities
//!
//! This module provides a resilient, asynchronous API client around `reqwest`.
//! One logical call is made of up to `backoff.len() + 1` attempts; each attempt
//! is bounded by a timeout, and failed attempts are followed by the fixed
//! backoff delays of the [`RetryPolicy`] (1s, 2s, 4s by default).
//!
//! The network itself sits behind the [`Transport`] trait so the retry logic
//! can be driven by scripted transports in tests.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Per-attempt upper bound used when no policy is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Delays slept between successive attempts, in order.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(1_000),
    Duration::from_millis(2_000),
    Duration::from_millis(4_000),
];

/// Errors surfaced by the retrieval layer.
///
/// Only the error of the final attempt ever reaches the caller of
/// [`ApiClient::request_with_retry`].
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// The request could not be sent or the connection failed mid-flight.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}")]
    Status {
        /// Numeric HTTP status code.
        status: u16,
        /// Raw response body, kept for diagnostics.
        body: Option<String>,
    },

    /// The response body was not valid JSON.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The attempt did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the logical call.
    #[error("request cancelled")]
    Cancelled,

    /// No valid bearer token was available, so nothing was sent.
    #[error("no valid access token")]
    Unauthenticated,

    /// A URL could not be built from the configured base.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Body attached to an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Serialized as `application/json`.
    Json(Value),
    /// Serialized as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

/// A fully resolved request, reusable across attempts.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// The HTTP verb.
    pub method: Method,
    /// Absolute target URL.
    pub url: Url,
    /// Extra headers sent with every attempt.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    /// Creates a `GET` request without headers or body.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Creates a `POST` request carrying `body`.
    pub fn post(url: Url, body: RequestBody) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }

    /// Adds an `Authorization: Bearer <token>` header.
    ///
    /// A token that is not a valid header value is rejected as unauthenticated
    /// rather than sent mangled.
    pub fn bearer(mut self, token: &str) -> Result<Self, RetrieveError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RetrieveError::Unauthenticated)?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }
}

/// Appends percent-encoded path segments to `base`.
///
/// A trailing slash on `base` does not produce an empty segment.
pub fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, url::ParseError> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

/// A single network attempt: send the request, require a success status and
/// decode the body as JSON.
pub trait Transport: Send + Sync {
    /// Performs exactly one attempt. Timeouts and retries are applied by the caller.
    fn execute(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<Value, RetrieveError>> + Send;
}

/// The production [`Transport`], backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps an existing `reqwest::Client`.
    pub fn new(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, RetrieveError> {
        let mut req = self
            .inner
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        match &request.body {
            Some(RequestBody::Json(body)) => {
                let json_body = serde_json::to_string(body)?;
                req = req.header(CONTENT_TYPE, "application/json").body(json_body);
            }
            Some(RequestBody::Form(fields)) => {
                req = req.form(fields);
            }
            None => {}
        }

        let response = req.send().await?;
        let status = response.status();

        if !status.is_success() {
            // Keep the error body for diagnostics, it never reaches decoding.
            let body = response.text().await.ok();
            return Err(RetrieveError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Timeout and backoff schedule for one logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound for each individual attempt.
    pub timeout: Duration,
    /// Delays between attempts; the call makes `backoff.len() + 1` attempts.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts a call may make.
    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, per-attempt timeouts and the bounded retry loop.
/// Authentication is attached per request by the caller.
pub struct ApiClient<T = ReqwestTransport> {
    /// The transport performing single attempts.
    transport: T,
    /// The base URL to which endpoint segments are appended.
    base_url: Url,
    /// Timeout and backoff schedule.
    policy: RetryPolicy,
}

impl ApiClient<ReqwestTransport> {
    /// Creates a client over a default `reqwest` transport.
    ///
    /// # Errors
    /// Returns [`RetrieveError::Url`] if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, policy: RetryPolicy) -> Result<Self, RetrieveError> {
        Self::with_transport(base_url, ReqwestTransport::default(), policy)
    }
}

impl<T: Transport> ApiClient<T> {
    /// Creates a client over an arbitrary transport.
    pub fn with_transport(
        base_url: &str,
        transport: T,
        policy: RetryPolicy,
    ) -> Result<Self, RetrieveError> {
        let base_url = Url::parse(base_url)?;
        Ok(Self {
            transport,
            base_url,
            policy,
        })
    }

    /// The active retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The transport performing single attempts.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    ///
    /// `endpoint(&["pens", "3", "detail"])` on `http://host/api` yields
    /// `http://host/api/pens/3/detail`.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, RetrieveError> {
        Ok(join_segments(&self.base_url, segments)?)
    }

    /// Performs a single attempt bounded by the policy timeout.
    ///
    /// An attempt that outlives the timeout is dropped, which aborts the
    /// underlying request.
    pub async fn send_once(&self, request: &ApiRequest) -> Result<Value, RetrieveError> {
        match timeout(self.policy.timeout, self.transport.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(RetrieveError::Timeout(self.policy.timeout)),
        }
    }

    /// Performs one logical request with bounded automatic retry.
    ///
    /// Returns the first successfully decoded body, or the error of the final
    /// attempt once every attempt has failed. `cancel` aborts the call while an
    /// attempt is in flight or while sleeping between attempts.
    pub async fn request_with_retry(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, RetrieveError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                outcome = self.send_once(request) => outcome,
            };

            let error = match outcome {
                Ok(body) => return Ok(body),
                Err(error) => error,
            };

            log::warn!(
                "{} {} failed (attempt {}/{}): {}",
                request.method,
                request.url,
                attempt + 1,
                max_attempts,
                error
            );

            let Some(delay) = self.policy.backoff.get(attempt).copied() else {
                log::error!(
                    "{} {} giving up after {} attempts",
                    request.method,
                    request.url,
                    max_attempts
                );
                return Err(error);
            };
            attempt += 1;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
