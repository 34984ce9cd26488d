//! # Payload Coercion
//!
//! Total conversions from untrusted, decoded JSON into typed values. None of
//! these functions can fail: anything unusable is replaced by the caller's
//! fallback. Every decoder in `pens` is built from them, so no partial or
//! malformed payload can crash the sync layer.
//!
//! All helpers classify their input through one [`Shape`] check instead of
//! probing the value ad hoc.

use serde_json::{Map, Value};

/// The decoded shape of a payload field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape<'a> {
    /// The field is absent.
    Missing,
    /// JSON `null`.
    Null,
    /// JSON `true` / `false`.
    Bool(bool),
    /// Any JSON number.
    Number(f64),
    /// A JSON string.
    Text(&'a str),
    /// A JSON array.
    Sequence(&'a [Value]),
    /// A JSON object.
    Record(&'a Map<String, Value>),
}

impl<'a> Shape<'a> {
    /// Classifies an optional value.
    pub fn of(value: Option<&'a Value>) -> Self {
        match value {
            None => Shape::Missing,
            Some(Value::Null) => Shape::Null,
            Some(Value::Bool(b)) => Shape::Bool(*b),
            Some(Value::Number(n)) => Shape::Number(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(s)) => Shape::Text(s),
            Some(Value::Array(items)) => Shape::Sequence(items),
            Some(Value::Object(map)) => Shape::Record(map),
        }
    }

    /// Numeric reading of the shape; `NaN` when there is none.
    ///
    /// Follows the usual loose-number rules: `null` and empty text are zero,
    /// booleans are 0/1, numeric text is parsed, a one-element array reads as
    /// its element.
    fn to_number(self) -> f64 {
        match self {
            Shape::Missing | Shape::Record(_) => f64::NAN,
            Shape::Null => 0.0,
            Shape::Bool(b) => f64::from(u8::from(b)),
            Shape::Number(n) => n,
            Shape::Text(s) => parse_number(s),
            Shape::Sequence([]) => 0.0,
            Shape::Sequence([only]) => match Shape::of(Some(only)) {
                Shape::Bool(_) => f64::NAN,
                inner => inner.to_number(),
            },
            Shape::Sequence(_) => f64::NAN,
        }
    }
}

fn parse_number(text: &str) -> f64 {
    let s = text.trim();
    if s.is_empty() {
        return 0.0;
    }

    match s.get(..2) {
        Some("0x") | Some("0X") => parse_radix(&s[2..], 16),
        Some("0o") | Some("0O") => parse_radix(&s[2..], 8),
        Some("0b") | Some("0B") => parse_radix(&s[2..], 2),
        _ => s.parse::<f64>().unwrap_or(f64::NAN),
    }
}

/// Digits folded straight into an `f64`, so values past `u64::MAX` stay finite.
fn parse_radix(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() {
        return f64::NAN;
    }
    digits
        .chars()
        .try_fold(0.0_f64, |acc, c| {
            c.to_digit(radix)
                .map(|d| acc * f64::from(radix) + f64::from(d))
        })
        .unwrap_or(f64::NAN)
}

/// The numeric value of `value` if it is finite, otherwise `fallback`.
pub fn coerce_number(value: Option<&Value>, fallback: f64) -> f64 {
    let n = Shape::of(value).to_number();
    if n.is_finite() {
        n
    } else {
        fallback
    }
}

/// `value` if it is a string, otherwise `fallback`.
pub fn coerce_string(value: Option<&Value>, fallback: &str) -> String {
    match Shape::of(value) {
        Shape::Text(s) => s.to_owned(),
        _ => fallback.to_owned(),
    }
}

/// `value` if it is an array, otherwise `fallback`.
pub fn coerce_array<'a>(value: Option<&'a Value>, fallback: &'a [Value]) -> &'a [Value] {
    match Shape::of(value) {
        Shape::Sequence(items) => items,
        _ => fallback,
    }
}

/// `value` if it is an object.
pub fn coerce_record(value: Option<&Value>) -> Option<&Map<String, Value>> {
    match Shape::of(value) {
        Shape::Record(map) => Some(map),
        _ => None,
    }
}

/// The first of `aliases` present on `record` with a non-null value.
///
/// Lets decoders accept several server spellings of one field; adding a
/// spelling is a change to the alias list only.
pub fn field<'a>(record: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}
