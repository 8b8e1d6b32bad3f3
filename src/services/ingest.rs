//! Validation of device payloads and the write-side response contract.

use http::StatusCode;
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::db::models::{Measurement, MeasurementValue, NumericKind, Sample};
use crate::db::store::{Store, StoreError};

/// How one payload key is read: which measurement it fills and what it
/// defaults to when the device leaves it out.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: Measurement,
    pub default: MeasurementValue,
}

/// Every accepted payload key. Devices without a sensor simply omit its key.
pub const READING_FIELDS: [FieldRule; 4] = [
    FieldRule {
        field: Measurement::Temperature,
        default: MeasurementValue::Float(0.0),
    },
    FieldRule {
        field: Measurement::Humidity,
        default: MeasurementValue::Float(0.0),
    },
    FieldRule {
        field: Measurement::Noise,
        default: MeasurementValue::Integer(0),
    },
    FieldRule {
        field: Measurement::Luminance,
        default: MeasurementValue::Integer(0),
    },
];

#[derive(Debug)]
pub enum IngestError {
    /// Nothing usable in the request body.
    MissingBody,
    /// A field could not be coerced, or the body is not a JSON object.
    InvalidPayload(String),
    Storage(StoreError),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::MissingBody | IngestError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::MissingBody => write!(f, "No JSON"),
            IngestError::InvalidPayload(msg) => write!(f, "{}", msg),
            IngestError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IngestError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        IngestError::Storage(value)
    }
}

/// JSON body returned to devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteResponse {
    Success,
    Fail { reason: String },
    Error { message: String },
}

impl WriteResponse {
    pub fn from_outcome(outcome: &Result<i64, IngestError>) -> (StatusCode, WriteResponse) {
        match outcome {
            Ok(_) => (StatusCode::OK, WriteResponse::Success),
            Err(e @ IngestError::MissingBody) => (e.status_code(), WriteResponse::Fail { reason: e.to_string() }),
            Err(e) => (e.status_code(), WriteResponse::Error { message: e.to_string() }),
        }
    }
}

#[derive(Clone)]
pub struct IngestHandler {
    store: Arc<Store>,
}

impl IngestHandler {
    pub fn new(store: Arc<Store>) -> Self {
        IngestHandler { store }
    }

    /// Validate a raw request body and append it. Returns the new reading id.
    pub fn handle(&self, body: &[u8]) -> Result<i64, IngestError> {
        let sample = match parse_payload(body) {
            Ok(s) => s,
            Err(e) => {
                warn!("Rejected reading: {}", e);
                return Err(e);
            }
        };

        match self.store.append(&sample) {
            Ok(id) => {
                debug!("Stored reading {} ({:?})", id, sample);
                Ok(id)
            }
            Err(e) => {
                error!("Failed to store reading: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Turn a request body into a [`Sample`], applying [`READING_FIELDS`].
pub fn parse_payload(body: &[u8]) -> Result<Sample, IngestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::MissingBody);
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| IngestError::InvalidPayload(format!("malformed JSON body: {}", e)))?;
    if is_blank(&value) {
        return Err(IngestError::MissingBody);
    }
    let Value::Object(map) = value else {
        return Err(IngestError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            json_type_name(&value)
        )));
    };

    let mut sample = Sample::default();
    for rule in READING_FIELDS {
        let value = match map.get(rule.field.name()) {
            Some(raw) => coerce(rule.field, raw).map_err(IngestError::InvalidPayload)?,
            None => rule.default,
        };
        sample.set(rule.field, value);
    }
    Ok(sample)
}

/// Coerce a JSON value to the numeric kind of `field`.
///
/// Numbers, booleans and numeric strings are accepted. Integer fields
/// truncate fractional numbers but reject decimal strings.
pub fn coerce(field: Measurement, raw: &Value) -> Result<MeasurementValue, String> {
    let coerced = match field.kind() {
        NumericKind::Float => match raw {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .map(MeasurementValue::Float),
        NumericKind::Integer => match raw {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate_to_i64)),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .map(MeasurementValue::Integer),
    };

    coerced.ok_or_else(|| {
        let expected = match field.kind() {
            NumericKind::Float => "a finite number",
            NumericKind::Integer => "an integer",
        };
        format!("invalid value for '{}': expected {}, got {}", field.name(), expected, raw)
    })
}

fn truncate_to_i64(v: f64) -> Option<i64> {
    // i64::MAX is not exactly representable; 2^63 itself is out of range
    let in_range = v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64;
    in_range.then(|| v.trunc() as i64)
}

/// Values a device may send to mean "nothing".
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
