//! # Core Type Definitions
//!
//! This module contains the value types shared by every component of the
//! dispatch core: the untyped [`RawValue`] observed on the wire, the
//! [`Quality`] side channel, subscription modes and read results.
//!
//! ## Key Types
//!
//! - [`RawValue`] - Untyped scalar, array, text, byte blob or named-field value
//! - [`Quality`] - Reliability indicator attached to every read
//! - [`ReadValue`] - A raw value with its quality and timestamp
//! - [`SubscriptionMode`] - Polling vs unsolicited notification cadence
//! - [`SubscriptionId`] - Unique identifier of one runtime subscription

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Raw Values
// ============================================================================

/// An untyped value as produced or consumed by a transport.
///
/// Controllers hand out scalars, arrays and packed structure buffers; brokers
/// hand out JSON documents. Both map onto this enum before any typed
/// conversion happens.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum RawValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<RawValue>),
    /// Named fields in declaration order
    Struct(Vec<(String, RawValue)>),
}

impl RawValue {
    /// Returns the value as `f64` when it is numeric.
    ///
    /// Booleans, text and containers are not numeric and return `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Int(v) => Some(*v as f64),
            RawValue::UInt(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the value is an integer or floating point number.
    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    /// Short label of the variant, used in conversion errors.
    pub fn type_label(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::UInt(_) => "uint",
            RawValue::Float(_) => "float",
            RawValue::Text(_) => "text",
            RawValue::Bytes(_) => "bytes",
            RawValue::Array(_) => "array",
            RawValue::Struct(_) => "struct",
        }
    }

    /// Converts a broker JSON document into a raw value.
    ///
    /// Objects keep their key order as produced by `serde_json`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RawValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    RawValue::UInt(u)
                } else {
                    RawValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                RawValue::Array(items.iter().map(RawValue::from_json).collect())
            }
            serde_json::Value::Object(map) => RawValue::Struct(
                map.iter()
                    .map(|(k, v)| (k.clone(), RawValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts the raw value into a JSON document for publishing.
    ///
    /// Byte blobs become arrays of numbers; non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawValue::Null => serde_json::Value::Null,
            RawValue::Bool(b) => serde_json::Value::Bool(*b),
            RawValue::Int(i) => serde_json::Value::from(*i),
            RawValue::UInt(u) => serde_json::Value::from(*u),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RawValue::Text(s) => serde_json::Value::String(s.clone()),
            RawValue::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
            RawValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(RawValue::to_json).collect())
            }
            RawValue::Struct(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => write!(f, "null"),
            RawValue::Bool(b) => write!(f, "{b}"),
            RawValue::Int(i) => write!(f, "{i}"),
            RawValue::UInt(u) => write!(f, "{u}"),
            RawValue::Float(v) => write!(f, "{v}"),
            RawValue::Text(s) => write!(f, "{s:?}"),
            RawValue::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            RawValue::Array(items) => write!(f, "[{} items]", items.len()),
            RawValue::Struct(fields) => write!(f, "{{{} fields}}", fields.len()),
        }
    }
}

macro_rules! raw_from {
    ($($ty:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(
            impl From<$ty> for RawValue {
                fn from(value: $ty) -> Self {
                    RawValue::$variant(value as $cast)
                }
            }
        )*
    };
}

raw_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

// ============================================================================
// Quality and Read Results
// ============================================================================

/// Reliability of a value read from a transport.
///
/// Only `Good` values take part in change and deadband comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
    CommError,
}

impl Quality {
    #[inline]
    pub fn is_good(self) -> bool {
        self == Quality::Good
    }
}

/// One value read from a transport together with its quality and the time it
/// was observed (milliseconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadValue {
    pub value: RawValue,
    pub quality: Quality,
    pub timestamp_ms: u64,
}

impl ReadValue {
    /// A good-quality value stamped with the current time.
    pub fn good(value: impl Into<RawValue>) -> Self {
        Self {
            value: value.into(),
            quality: Quality::Good,
            timestamp_ms: crate::utils::current_timestamp_ms(),
        }
    }

    /// A value with an explicit quality stamped with the current time.
    pub fn with_quality(value: impl Into<RawValue>, quality: Quality) -> Self {
        Self {
            value: value.into(),
            quality,
            timestamp_ms: crate::utils::current_timestamp_ms(),
        }
    }

    /// Placeholder recorded when a read could not be performed.
    pub fn comm_error() -> Self {
        Self::with_quality(RawValue::Null, Quality::CommError)
    }
}

// ============================================================================
// Subscriptions and Publishing
// ============================================================================

/// Notification cadence requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// Periodic read-driven notifications
    #[default]
    Polling,
    /// Push-driven notifications, as fast as the transport delivers them
    Unsolicited,
}

/// Delivery guarantee requested when publishing to a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliverySemantics {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Unique identifier of one runtime subscription.
///
/// Replacing a subscription for the same key produces a new id, which lets
/// in-flight work tell whether the subscription it belongs to is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Handler Identity
// ============================================================================

/// Runtime identity of a handler type.
#[derive(Clone, Copy)]
pub struct HandlerType {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerType {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn short_name(&self) -> String {
        crate::utils::short_type_name(self.name)
    }
}

impl PartialEq for HandlerType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerType {}

impl std::hash::Hash for HandlerType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerType({})", self.short_name())
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

/// Lifecycle state of one subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// No subscription exists for the key
    Idle,
    /// Subscribed and receiving notifications
    Active,
    /// Removed after sustained dispatch failures; needs an explicit re-subscribe
    Suppressed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(RawValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(RawValue::UInt(7).as_f64(), Some(7.0));
        assert_eq!(RawValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(RawValue::Bool(true).as_f64(), None);
        assert!(!RawValue::Text("1".into()).is_numeric());
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"speed": 12.5, "running": true, "name": "pump"});
        let raw = RawValue::from_json(&json);
        match &raw {
            RawValue::Struct(fields) => {
                assert_eq!(fields.len(), 3);
                assert!(fields.iter().any(|(k, v)| k == "speed" && *v == RawValue::Float(12.5)));
            }
            other => panic!("expected struct, got {other:?}"),
        }
        assert_eq!(raw.to_json(), json);
    }

    #[test]
    fn test_comm_error_placeholder() {
        let placeholder = ReadValue::comm_error();
        assert_eq!(placeholder.quality, Quality::CommError);
        assert_eq!(placeholder.value, RawValue::Null);
    }
}
