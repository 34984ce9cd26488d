//! # lib_common
//!
//! The data-sync layer of the pen dashboard. Each folder is gated behind a
//! cargo feature of the same name; `full` (the default) enables all of them.
//!
//! - **`retrieve`**: `ApiClient`, a request/response client with a timeout
//!   per attempt and a fixed 1s/2s/4s retry backoff.
//! - **`ingestors`**: `ResilientWs`, a push-channel client that keeps one
//!   connection alive and reconnects with exponential backoff.
//! - **`pens`**: the pen backend models, the rolling time-series merge and
//!   the live dashboard and detail feeds built on the two layers above.

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "pens")]
pub mod pens;
