//! Runtime registry of payload codecs.
//!
//! Handlers are bound to a payload type when they are registered, but values
//! arrive untyped. [`ValueMarshaller`] bridges the two: it looks up the codec
//! registered for a [`PayloadType`] and produces a type-erased
//! [`TypedPayload`] that the handler binding downcasts again.

use super::codec::{PayloadType, TagValue};
use super::structured::FixedString;
use crate::error::MarshalError;
use crate::types::RawValue;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use tracing::debug;

type ErasedValue = Box<dyn Any + Send + Sync>;

/// Type-erased conversion functions for one payload type.
#[derive(Clone, Copy)]
pub struct PayloadCodec {
    payload_type: PayloadType,
    decode: fn(&RawValue) -> Result<ErasedValue, MarshalError>,
    fallback: fn() -> ErasedValue,
    encode: fn(&(dyn Any + Send + Sync + 'static)) -> Result<RawValue, MarshalError>,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

impl PayloadCodec {
    pub fn of<T: TagValue>() -> Self {
        Self {
            payload_type: PayloadType::of::<T>(),
            decode: decode_erased::<T>,
            fallback: fallback_erased::<T>,
            encode: encode_erased::<T>,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }
}

fn decode_erased<T: TagValue>(raw: &RawValue) -> Result<ErasedValue, MarshalError> {
    T::from_raw(raw).map(|value| Box::new(value) as ErasedValue)
}

fn fallback_erased<T: TagValue>() -> ErasedValue {
    Box::new(T::default())
}

fn encode_erased<T: TagValue>(value: &(dyn Any + Send + Sync + 'static)) -> Result<RawValue, MarshalError> {
    match value.downcast_ref::<T>() {
        Some(typed) => typed.to_raw(),
        None => Err(MarshalError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            actual: "unknown",
        }),
    }
}

/// A typed value whose concrete type is only known at runtime.
pub struct TypedPayload {
    value: ErasedValue,
    payload_type: PayloadType,
    degraded: bool,
}

impl TypedPayload {
    pub fn new<T: TagValue>(value: T) -> Self {
        Self {
            value: Box::new(value),
            payload_type: PayloadType::of::<T>(),
            degraded: false,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// True when the value is a fallback default rather than a conversion of
    /// the raw value.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Recovers the concrete value.
    pub fn downcast<T: 'static>(self) -> Result<T, MarshalError> {
        let actual = self.payload_type.name();
        self.value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| MarshalError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                actual,
            })
    }
}

impl std::fmt::Debug for TypedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedPayload")
            .field("payload_type", &self.payload_type)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Result of a typed decode with fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub value: T,
    pub degraded: bool,
}

/// Registry of payload codecs keyed by payload type.
#[derive(Debug)]
pub struct ValueMarshaller {
    codecs: DashMap<TypeId, PayloadCodec>,
}

impl Default for ValueMarshaller {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueMarshaller {
    /// Creates a marshaller with codecs for primitives, text, arrays of
    /// primitives and [`RawValue`] pre-registered.
    pub fn new() -> Self {
        let marshaller = Self::empty();
        marshaller.register::<RawValue>();
        marshaller.register::<bool>();
        marshaller.register::<i8>();
        marshaller.register::<i16>();
        marshaller.register::<i32>();
        marshaller.register::<i64>();
        marshaller.register::<u8>();
        marshaller.register::<u16>();
        marshaller.register::<u32>();
        marshaller.register::<u64>();
        marshaller.register::<f32>();
        marshaller.register::<f64>();
        marshaller.register::<String>();
        // controller default STRING capacity
        marshaller.register::<FixedString<82>>();
        marshaller.register::<Vec<bool>>();
        marshaller.register::<Vec<i16>>();
        marshaller.register::<Vec<i32>>();
        marshaller.register::<Vec<i64>>();
        marshaller.register::<Vec<u8>>();
        marshaller.register::<Vec<u16>>();
        marshaller.register::<Vec<u32>>();
        marshaller.register::<Vec<f32>>();
        marshaller.register::<Vec<f64>>();
        marshaller.register::<Vec<String>>();
        marshaller
    }

    /// Creates a marshaller without any codecs.
    pub fn empty() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    pub fn register<T: TagValue>(&self) {
        self.register_codec(PayloadCodec::of::<T>());
    }

    pub fn register_codec(&self, codec: PayloadCodec) {
        self.codecs.insert(codec.payload_type.type_id(), codec);
    }

    pub fn is_registered(&self, payload_type: &PayloadType) -> bool {
        self.codecs.contains_key(&payload_type.type_id())
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Builds a typed payload for a payload type known only at runtime.
    ///
    /// A conversion failure falls back to the type's default and marks the
    /// payload degraded. Only an unregistered payload type is an error.
    pub fn to_typed(
        &self,
        raw: &RawValue,
        payload_type: &PayloadType,
    ) -> Result<TypedPayload, MarshalError> {
        let codec = *self
            .codecs
            .get(&payload_type.type_id())
            .ok_or(MarshalError::UnknownPayloadType(payload_type.name()))?;

        match (codec.decode)(raw) {
            Ok(value) => Ok(TypedPayload {
                value,
                payload_type: codec.payload_type,
                degraded: false,
            }),
            Err(e) => {
                debug!(
                    "🔄 Falling back to default {} ({:?}) for {}: {}",
                    codec.payload_type,
                    codec.payload_type.shape(),
                    raw,
                    e
                );
                Ok(TypedPayload {
                    value: (codec.fallback)(),
                    payload_type: codec.payload_type,
                    degraded: true,
                })
            }
        }
    }

    /// Encodes a typed payload back into a raw value.
    pub fn to_raw(&self, payload: &TypedPayload) -> Result<RawValue, MarshalError> {
        let codec = *self
            .codecs
            .get(&payload.payload_type.type_id())
            .ok_or(MarshalError::UnknownPayloadType(payload.payload_type.name()))?;
        (codec.encode)(&*payload.value)
    }

    /// Statically typed decode with the same fallback rule as [`to_typed`](Self::to_typed).
    pub fn decode<T: TagValue>(raw: &RawValue) -> Decoded<T> {
        match T::from_raw(raw) {
            Ok(value) => Decoded { value, degraded: false },
            Err(_) => Decoded {
                value: T::default(),
                degraded: true,
            },
        }
    }

    /// Statically typed encode.
    pub fn encode<T: TagValue>(value: &T) -> Result<RawValue, MarshalError> {
        value.to_raw()
    }
}
