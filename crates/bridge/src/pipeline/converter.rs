//! Point Converter
//!
//! Turns one inbound bus envelope into a validated time-series point.
//! Inbound timestamps are never trusted: every point is stamped with the
//! wall clock at conversion time.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    error::{BridgeError, BridgeResult},
    metrics::Statistics,
    types::{Envelope, FieldValue, Fields, Point, Tags},
};

/// Converts envelopes into points, counting the ones it has to drop
#[derive(Debug, Clone)]
pub struct PointConverter {
    stats: Arc<Statistics>,
}

impl PointConverter {
    /// Create a converter reporting into `stats`
    #[must_use]
    pub const fn new(stats: Arc<Statistics>) -> Self {
        Self { stats }
    }

    /// Convert an envelope.
    ///
    /// Returns `None` for malformed envelopes; the drop is logged and counted
    /// in `droppedPointsInvalid`.
    #[must_use]
    pub fn convert(&self, envelope: &Envelope) -> Option<Point> {
        match Self::try_convert(envelope, Utc::now()) {
            Ok(point) => Some(point),
            Err(e) => {
                tracing::warn!(name = %envelope.name, error = %e, "Dropping point");
                self.stats.record_dropped_invalid();
                None
            }
        }
    }

    /// Build a point stamped with `timestamp`
    ///
    /// # Errors
    ///
    /// Returns a conversion error if the envelope cannot produce a valid point
    pub fn try_convert(envelope: &Envelope, timestamp: DateTime<Utc>) -> BridgeResult<Point> {
        let object = envelope.payload.as_object().ok_or_else(|| {
            BridgeError::conversion("payload", "Payload must be an object of fields")
        })?;

        let mut fields = Fields::new();
        for (key, value) in object {
            fields.insert(key.clone(), field_value(key, value)?);
        }

        Point::new(envelope.name.clone(), Tags::new(), fields, timestamp)
    }
}

fn field_value(key: &str, value: &Value) -> BridgeResult<FieldValue> {
    match value {
        Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
        Value::String(s) => Ok(FieldValue::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(FieldValue::Integer)
            .or_else(|| n.as_f64().map(FieldValue::Float))
            .ok_or_else(|| BridgeError::conversion(key, "Number out of range")),
        Value::Null => Err(BridgeError::conversion(key, "Field value cannot be null")),
        Value::Array(_) | Value::Object(_) => Err(BridgeError::conversion(
            key,
            "Nested field values are not supported",
        )),
    }
}
