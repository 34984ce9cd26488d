//! # Pen Domain Models
//!
//! Typed views of the pen list snapshot and the per-pen stream messages.
//! Decoding never fails: every field goes through the coercion helpers, so
//! a missing or mistyped field ends up as an empty string, zero or empty list.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::coerce::{coerce_array, coerce_number, coerce_record, coerce_string, field};
use super::timeseries::PointSample;

/// Accepted spellings of the top-level piggery list, in priority order.
pub const PIGGERIES_KEYS: &[&str] = &["piggeies", "piggeries"];

static PEN_NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\d+").ok());

/// A pig flagged by the backend as behaving abnormally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbnormalPig {
    /// Individual identifier.
    pub wid: f64,
    /// Optional picture of the pig.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Activity level.
    pub activity: f64,
    /// Feeding time.
    pub feeding_time: f64,
}

impl AbnormalPig {
    fn decode(raw: &Value) -> Self {
        Self {
            wid: coerce_number(raw.get("wid"), 0.0),
            thumbnail_url: raw
                .get("thumbnail_url")
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(str::to_owned),
            activity: coerce_number(raw.get("activity"), 0.0),
            feeding_time: coerce_number(raw.get("feeding_time"), 0.0),
        }
    }
}

/// One pen and its aggregate metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pen {
    /// Server identifier, e.g. `pen_3`.
    pub pen_id: String,
    /// Display name.
    pub pen_name: String,
    /// Pigs currently in the pen.
    pub current_pig_count: f64,
    /// Average activity level.
    pub avg_activity_level: f64,
    /// Average feeding time in minutes.
    pub avg_feeding_time_minutes: f64,
    /// Average temperature in degrees Celsius.
    pub avg_temperature_celsius: f64,
    /// Pigs flagged as abnormal.
    pub abnormal_pigs: Vec<AbnormalPig>,
}

impl Pen {
    fn decode(raw: &Value) -> Self {
        Self {
            pen_id: coerce_string(raw.get("pen_id"), ""),
            pen_name: coerce_string(raw.get("pen_name"), ""),
            current_pig_count: coerce_number(raw.get("current_pig_count"), 0.0),
            avg_activity_level: coerce_number(raw.get("avg_activity_level"), 0.0),
            avg_feeding_time_minutes: coerce_number(raw.get("avg_feeding_time_minutes"), 0.0),
            avg_temperature_celsius: coerce_number(raw.get("avg_temperature_celsius"), 0.0),
            abnormal_pigs: coerce_array(raw.get("abnormal_pigs"), &[])
                .iter()
                .map(AbnormalPig::decode)
                .collect(),
        }
    }

    /// Whether any pig in the pen is flagged.
    pub fn has_abnormal(&self) -> bool {
        !self.abnormal_pigs.is_empty()
    }

    /// The identifier used to address this pen's detail endpoints.
    pub fn detail_param(&self) -> &str {
        pen_id_param(&self.pen_id)
    }
}

/// A group of pens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Piggery {
    /// Server identifier.
    pub piggery_id: String,
    /// Display name.
    pub piggery_name: String,
    /// Pigs across all pens.
    pub total_pigs: f64,
    /// Pens in this piggery.
    pub pens: Vec<Pen>,
}

impl Piggery {
    fn decode(raw: &Value) -> Self {
        Self {
            piggery_id: coerce_string(raw.get("piggery_id"), ""),
            piggery_name: coerce_string(raw.get("piggery_name"), ""),
            total_pigs: coerce_number(raw.get("total_pigs"), 0.0),
            pens: coerce_array(raw.get("pens"), &[]).iter().map(Pen::decode).collect(),
        }
    }

    /// Looks a pen up by its server identifier.
    pub fn pen(&self, pen_id: &str) -> Option<&Pen> {
        self.pens.iter().find(|pen| pen.pen_id == pen_id)
    }

    /// Flagged pigs across all pens.
    pub fn abnormal_count(&self) -> usize {
        self.pens.iter().map(|pen| pen.abnormal_pigs.len()).sum()
    }
}

/// Decodes a pen list snapshot or pen list stream message.
///
/// The list is read from the first key of [`PIGGERIES_KEYS`] that carries a
/// non-null value; without one the result is empty.
pub fn decode_piggeries(payload: &Value) -> Vec<Piggery> {
    coerce_array(field(payload, PIGGERIES_KEYS), &[])
        .iter()
        .map(Piggery::decode)
        .collect()
}

/// The first run of digits in `pen_id`, or `pen_id` itself without one.
///
/// `"pen_3"` becomes `"3"`.
pub fn pen_id_param(pen_id: &str) -> &str {
    PEN_NUMBER
        .as_ref()
        .and_then(|re| re.find(pen_id))
        .map_or(pen_id, |found| found.as_str())
}

/// A message of the per-pen stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PenStreamMessage {
    /// Pen the measurement belongs to; empty for bare messages.
    pub pen_id: String,
    /// Server timestamp as sent; empty for bare messages.
    pub timestamp: String,
    /// The measurement.
    pub data: PointSample,
}

impl PenStreamMessage {
    /// Decodes a wrapped or bare per-pen message. `None` when the message is
    /// not an object.
    pub fn decode(payload: &Value) -> Option<Self> {
        coerce_record(Some(payload))?;
        Some(Self {
            pen_id: coerce_string(payload.get("pen_id"), ""),
            timestamp: coerce_string(payload.get("timestamp"), ""),
            data: PointSample::decode_update(payload)?,
        })
    }

    /// The timestamp parsed as RFC 3339, if it is one.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}
