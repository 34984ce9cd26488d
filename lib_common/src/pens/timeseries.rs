//! # Time-Series Merge Policy
//!
//! A pen's activity and feeding history is a bounded rolling window. It is
//! seeded once from the detail snapshot and then grows by one point per
//! streamed update, evicting the oldest point beyond [`MAX_POINTS`].
//!
//! Every point carries a synthetic index: snapshot points are numbered
//! `1..=N` in snapshot order and each appended point takes the next number.
//! Indices are never reused within one window, so evicted ones simply
//! disappear from the front.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;

use super::coerce::{coerce_array, coerce_number, coerce_record};
use crate::ingestors::StreamPayload;

/// Points retained by a window.
pub const MAX_POINTS: usize = 10;

/// One measurement, without its position in the series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PointSample {
    /// Activity level.
    pub activity: f64,
    /// Feeding time.
    pub feeding_time: f64,
}

impl PointSample {
    /// Decodes one measurement; anything missing or non-numeric reads as zero.
    pub fn decode(raw: &Value) -> Self {
        Self {
            activity: coerce_number(raw.get("activity"), 0.0),
            feeding_time: coerce_number(raw.get("feeding_time"), 0.0),
        }
    }

    /// Decodes a streamed update.
    ///
    /// The measurement may arrive wrapped (`{"data": {...}}`) or flat. A
    /// message that is not an object carries no measurement and yields `None`.
    pub fn decode_update(payload: &Value) -> Option<Self> {
        coerce_record(Some(payload))?;
        let inner = match payload.get("data") {
            Some(data @ Value::Object(_)) => data,
            _ => payload,
        };
        Some(Self::decode(inner))
    }
}

/// Decodes the `time_series` of a detail snapshot, in order.
pub fn decode_time_series(snapshot: &Value) -> Vec<PointSample> {
    coerce_array(snapshot.get("time_series"), &[])
        .iter()
        .map(PointSample::decode)
        .collect()
}

/// A measurement placed in a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    /// Synthetic, strictly increasing position.
    pub index: u64,
    /// Activity level.
    pub activity: f64,
    /// Feeding time.
    pub feeding_time: f64,
}

/// Bounded, ordered window of points for one pen.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    points: VecDeque<TimeSeriesPoint>,
    capacity: usize,
    last_index: u64,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingWindow {
    /// An empty window holding up to [`MAX_POINTS`] points.
    pub fn new() -> Self {
        Self::with_capacity(MAX_POINTS)
    }

    /// An empty window holding up to `capacity` points (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            last_index: 0,
        }
    }

    /// A window seeded from snapshot samples.
    ///
    /// The samples are numbered `1..=N`; only the last `MAX_POINTS` are kept
    /// and the next appended point is numbered `N + 1`.
    pub fn from_samples(samples: impl IntoIterator<Item = PointSample>) -> Self {
        let mut window = Self::new();
        for sample in samples {
            window.push(sample);
        }
        window
    }

    /// A window seeded from a raw detail snapshot.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        Self::from_samples(decode_time_series(snapshot))
    }

    /// Appends a sample, evicting the oldest point when full.
    pub fn push(&mut self, sample: PointSample) -> TimeSeriesPoint {
        self.last_index += 1;
        let point = TimeSeriesPoint {
            index: self.last_index,
            activity: sample.activity,
            feeding_time: sample.feeding_time,
        };
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
        point
    }

    /// Merges one streamed update. Updates without a measurement are dropped
    /// and leave the window untouched.
    pub fn apply_update(&mut self, payload: &Value) -> Option<TimeSeriesPoint> {
        let sample = PointSample::decode_update(payload)?;
        Some(self.push(sample))
    }

    /// Merges one stream delivery; frames that were not JSON are dropped.
    pub fn apply_payload(&mut self, payload: &StreamPayload) -> Option<TimeSeriesPoint> {
        self.apply_update(payload.as_json()?)
    }

    /// Points in display order, oldest first.
    pub fn points(&self) -> impl ExactSizeIterator<Item = &TimeSeriesPoint> + '_ {
        self.points.iter()
    }

    /// Owned copy of the points, oldest first.
    pub fn to_vec(&self) -> Vec<TimeSeriesPoint> {
        self.points.iter().copied().collect()
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the window holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Maximum number of points held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index assigned to the most recent point; 0 before the first one.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }
}
