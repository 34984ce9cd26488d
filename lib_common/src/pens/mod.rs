//! # Pen Monitoring Module
//!
//! The livestock side of the data-sync layer: decoding of the pen backend's
//! payloads, the rolling time-series merge, and the live feeds that combine
//! a snapshot with its push channel.
//!
//! ## Contained Modules:
//! - **`coerce`**: Total conversions from untrusted JSON with fallbacks.
//! - **`model`**: Piggeries, pens, abnormal pigs and per-pen stream messages.
//! - **`timeseries`**: The bounded rolling window and its merge rules.
//! - **`auth`**: The `TokenSource` seam and the login call.
//! - **`api`**: `PenApi`, the pen endpoints and stream URLs.
//! - **`feeds`**: `DashboardFeed` and `PenDetailFeed`, the published views.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Pen backend endpoints.
pub mod api;
/// Access tokens and login.
pub mod auth;
/// Payload coercion helpers.
pub mod coerce;
/// Snapshot plus stream views.
pub mod feeds;
/// Domain models.
pub mod model;
/// Rolling time-series window.
pub mod timeseries;

// --- Public API Re-exports ---
pub use api::PenApi;
pub use auth::{login, LoginResponse, StaticToken, TokenSource};
pub use feeds::{DashboardFeed, DashboardView, DetailView, FeedState, PenDetailFeed};
pub use model::{decode_piggeries, pen_id_param, AbnormalPig, Pen, PenStreamMessage, Piggery};
pub use timeseries::{PointSample, RollingWindow, TimeSeriesPoint, MAX_POINTS};
