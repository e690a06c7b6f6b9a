//! Bridge Types
//!
//! Core data types shared by the ingestion path and the egress adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Ordered tag set of a point
pub type Tags = BTreeMap<String, String>;

/// Field set of a point
pub type Fields = BTreeMap<String, FieldValue>;

/// Ordered group of points flushed together for a single write
pub type Batch = Vec<Point>;

/// A value stored in a point field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean value
    Boolean(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}i"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// One converted, timestamped measurement record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedPoint")]
pub struct Point {
    name: String,
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
}

impl Point {
    /// Create a validated point
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty, the field set is empty or a field
    /// key is empty
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> BridgeResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BridgeError::conversion("name", "Point name cannot be empty"));
        }
        if fields.is_empty() {
            return Err(BridgeError::conversion(
                "fields",
                "Point must have at least one field",
            ));
        }
        if fields.keys().any(String::is_empty) {
            return Err(BridgeError::conversion("fields", "Field key cannot be empty"));
        }

        Ok(Self {
            name,
            tags,
            fields,
            timestamp,
        })
    }

    /// Measurement name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag set
    #[must_use]
    pub const fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Field set
    #[must_use]
    pub const fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Look up a single field
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Point timestamp
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Wire form of a point before validation
#[derive(Deserialize)]
struct UncheckedPoint {
    name: String,
    #[serde(default)]
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
}

impl TryFrom<UncheckedPoint> for Point {
    type Error = BridgeError;

    fn try_from(raw: UncheckedPoint) -> BridgeResult<Self> {
        Self::new(raw.name, raw.tags, raw.fields, raw.timestamp)
    }
}

/// One inbound bus message before conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical name of the message, becomes the measurement name
    pub name: String,
    /// Opaque payload as decoded by the bus
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A field value as it goes out on the bus.
///
/// Integers are narrowed to the platform `isize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublishValue {
    /// Platform-width integer
    Int(isize),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean value
    Bool(bool),
}

impl From<&FieldValue> for PublishValue {
    #[allow(clippy::cast_possible_truncation)]
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Integer(v) => Self::Int(*v as isize),
            FieldValue::Float(v) => Self::Float(*v),
            FieldValue::String(v) => Self::String(v.clone()),
            FieldValue::Boolean(v) => Self::Bool(*v),
        }
    }
}

/// One outbound bus message: field name to published value
pub type OutboundMessage = BTreeMap<String, PublishValue>;

/// Storage write consistency level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Any node may acknowledge the write
    Any,
    /// One node must acknowledge the write
    One,
    /// A quorum must acknowledge the write
    Quorum,
    /// All nodes must acknowledge the write
    All,
}

/// Storage container information returned by provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Container name
    pub name: String,
    /// Default retention policy of the container
    pub default_retention_policy: String,
}

/// Description of one logical publisher or subscriber returned by discovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointContext {
    /// Logical name
    pub name: String,
    /// Transport configuration handed to the bus transport
    pub msgbus_config: serde_json::Value,
    /// Topics served by this endpoint
    pub topics: Vec<String>,
    /// Endpoint descriptors, informational only
    pub endpoints: Vec<String>,
}
