//! # Data Ingestors Module
//!
//! This module holds the push-channel side of the data-sync layer: a
//! WebSocket client that keeps exactly one connection alive per handle and
//! transparently reconnects with exponential backoff.
//!
//! ## Contained Modules:
//! - **`reconnect`**: The transport-free state machine (`ConnectionState`,
//!   `ReconnectPolicy`, events and effects).
//! - **`resilient_wss`**: The async driver, the `Connector` seam, the
//!   `tokio-tungstenite` connector and the owning `StreamHandle`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reconnect state machine and backoff schedule.
pub mod reconnect;
/// Resilient WebSocket client driven by the reconnect machine.
pub mod resilient_wss;

// --- Public API Re-exports ---
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use resilient_wss::{
    Connector, Frame, FrameStream, ResilientWs, StreamError, StreamHandle, StreamHandler,
    StreamPayload, TungsteniteConnector,
};
