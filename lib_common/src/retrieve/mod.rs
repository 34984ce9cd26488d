//! # Data Retrieval Module
//!
//! This module provides the request/response side of the data-sync layer:
//! a generic HTTP `ApiClient` that enforces a timeout on every attempt and
//! retries failed attempts with a fixed backoff schedule.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: The `ApiClient`, its `RetryPolicy`, the `Transport` seam
//!   and the `reqwest`-backed production transport.
//!
//! Callers (see `pens::api`) focus on endpoints and decoding, delegating
//! timeouts, retries and cancellation to this layer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with per-attempt timeout and bounded retry.
pub mod ky_http;

pub use ky_http::{
    join_segments, ApiClient, ApiRequest, RequestBody, ReqwestTransport, RetrieveError,
    RetryPolicy, Transport,
};
