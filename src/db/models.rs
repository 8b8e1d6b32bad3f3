//! Diesel model structs for persisted sensor readings, plus the measurement
//! vocabulary shared by ingestion and the chart queries.

use diesel::prelude::*;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::schema;

/// Wall-clock format of `sensor_data.timestamp` (server local time, no zone).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::sensor_data)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Reading {
    pub id: i64,
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    pub noise: i64,
    pub luminance: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::sensor_data)]
pub struct NewReading<'a> {
    pub timestamp: &'a str,
    pub temperature: f64,
    pub humidity: f64,
    pub noise: i64,
    pub luminance: i64,
}

/// A validated device payload. The store assigns id and timestamp on append.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub noise: i64,
    pub luminance: i64,
}

impl Sample {
    pub fn set(&mut self, field: Measurement, value: MeasurementValue) {
        match field {
            Measurement::Temperature => self.temperature = value.as_f64(),
            Measurement::Humidity => self.humidity = value.as_f64(),
            Measurement::Noise => self.noise = value.as_i64(),
            Measurement::Luminance => self.luminance = value.as_i64(),
        }
    }

    pub(crate) fn to_insertable<'a>(&self, timestamp: &'a str) -> NewReading<'a> {
        NewReading {
            timestamp,
            temperature: self.temperature,
            humidity: self.humidity,
            noise: self.noise,
            luminance: self.luminance,
        }
    }
}

/// Numeric representation a measurement is stored and reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Float,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Temperature,
    Humidity,
    Noise,
    Luminance,
}

impl Measurement {
    pub const ALL: [Measurement; 4] = [
        Measurement::Temperature,
        Measurement::Humidity,
        Measurement::Noise,
        Measurement::Luminance,
    ];

    /// Payload key and column name.
    pub fn name(self) -> &'static str {
        match self {
            Measurement::Temperature => "temperature",
            Measurement::Humidity => "humidity",
            Measurement::Noise => "noise",
            Measurement::Luminance => "luminance",
        }
    }

    pub fn kind(self) -> NumericKind {
        match self {
            Measurement::Temperature | Measurement::Humidity => NumericKind::Float,
            Measurement::Noise | Measurement::Luminance => NumericKind::Integer,
        }
    }

    /// Human readable chart label.
    pub fn label(self) -> &'static str {
        match self {
            Measurement::Temperature => "Temperature (°C)",
            Measurement::Humidity => "Humidity",
            Measurement::Noise => "Noise",
            Measurement::Luminance => "Luminance",
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Measurement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Measurement::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                format!(
                    "unknown measurement '{}' (expected one of temperature, humidity, noise, luminance)",
                    wanted
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Float(f64),
    Integer(i64),
}

impl MeasurementValue {
    pub fn as_f64(self) -> f64 {
        match self {
            MeasurementValue::Float(v) => v,
            MeasurementValue::Integer(v) => v as f64,
        }
    }

    /// Floats are truncated toward zero.
    pub fn as_i64(self) -> i64 {
        match self {
            MeasurementValue::Float(v) => v.trunc() as i64,
            MeasurementValue::Integer(v) => v,
        }
    }
}

/// One `[timestamp, value]` row of a chart window. Serialises as a two
/// element JSON array so chart code can index columns positionally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowPoint(pub String, pub MeasurementValue);
