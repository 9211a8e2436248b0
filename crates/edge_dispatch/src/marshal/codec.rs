//! Typed value conversions.
//!
//! Every payload type a handler can receive implements [`TagValue`]. The
//! implementations here cover primitives, text, arrays and the untyped
//! [`RawValue`] itself; structured types get theirs from
//! [`structured_value!`](crate::structured_value).

use crate::error::MarshalError;
use crate::types::RawValue;
use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Broad category of a payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    Scalar,
    Text,
    Array,
    Structured,
    Raw,
}

/// A value that can be built from and turned back into a [`RawValue`].
///
/// `Default` provides the fallback used when a notification cannot be
/// converted.
pub trait TagValue: Clone + Default + fmt::Debug + Send + Sync + 'static {
    /// Category of the type, used in diagnostics.
    fn shape() -> ValueShape {
        ValueShape::Scalar
    }

    /// Builds the typed value from a raw value.
    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError>;

    /// Turns the typed value back into a raw value.
    fn to_raw(&self) -> Result<RawValue, MarshalError>;
}

/// Runtime descriptor of a payload type, captured at registration time.
#[derive(Clone, Copy)]
pub struct PayloadType {
    type_id: TypeId,
    name: &'static str,
    shape: ValueShape,
}

impl PayloadType {
    pub fn of<T: TagValue>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            shape: T::shape(),
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

    #[inline]
    pub fn shape(&self) -> ValueShape {
        self.shape
    }

    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for PayloadType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for PayloadType {}

impl Hash for PayloadType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadType({})", crate::utils::short_type_name(self.name))
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::utils::short_type_name(self.name))
    }
}

// ============================================================================
// Primitive Implementations
// ============================================================================

fn conversion<T>(raw: &RawValue) -> MarshalError {
    MarshalError::Conversion {
        from: raw.type_label(),
        to: std::any::type_name::<T>(),
    }
}

impl TagValue for RawValue {
    fn shape() -> ValueShape {
        ValueShape::Raw
    }

    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
        Ok(raw.clone())
    }

    fn to_raw(&self) -> Result<RawValue, MarshalError> {
        Ok(self.clone())
    }
}

impl TagValue for bool {
    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
        match raw {
            RawValue::Bool(b) => Ok(*b),
            RawValue::Int(i) => Ok(*i != 0),
            RawValue::UInt(u) => Ok(*u != 0),
            RawValue::Float(f) if f.is_finite() => Ok(*f != 0.0),
            RawValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(conversion::<bool>(raw)),
            },
            _ => Err(conversion::<bool>(raw)),
        }
    }

    fn to_raw(&self) -> Result<RawValue, MarshalError> {
        Ok(RawValue::Bool(*self))
    }
}

macro_rules! integer_tag_value {
    ($($ty:ty => $variant:ident as $wide:ty),* $(,)?) => {
        $(
            impl TagValue for $ty {
                fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
                    match raw {
                        RawValue::Int(i) => <$ty>::try_from(*i).map_err(|_| conversion::<$ty>(raw)),
                        RawValue::UInt(u) => <$ty>::try_from(*u).map_err(|_| conversion::<$ty>(raw)),
                        RawValue::Bool(b) => Ok(if *b { 1 } else { 0 }),
                        RawValue::Float(f)
                            if f.is_finite()
                                && f.fract() == 0.0
                                && *f >= <$ty>::MIN as f64
                                && *f <= <$ty>::MAX as f64 =>
                        {
                            Ok(*f as $ty)
                        }
                        RawValue::Text(s) => s.trim().parse::<$ty>().map_err(|_| conversion::<$ty>(raw)),
                        _ => Err(conversion::<$ty>(raw)),
                    }
                }

                fn to_raw(&self) -> Result<RawValue, MarshalError> {
                    Ok(RawValue::$variant(*self as $wide))
                }
            }
        )*
    };
}

integer_tag_value! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
}

macro_rules! float_tag_value {
    ($($ty:ty),*) => {
        $(
            impl TagValue for $ty {
                fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
                    match raw {
                        RawValue::Float(f) => Ok(*f as $ty),
                        RawValue::Int(i) => Ok(*i as $ty),
                        RawValue::UInt(u) => Ok(*u as $ty),
                        RawValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
                        RawValue::Text(s) => s.trim().parse::<$ty>().map_err(|_| conversion::<$ty>(raw)),
                        _ => Err(conversion::<$ty>(raw)),
                    }
                }

                fn to_raw(&self) -> Result<RawValue, MarshalError> {
                    Ok(RawValue::Float(*self as f64))
                }
            }
        )*
    };
}

float_tag_value!(f32, f64);

impl TagValue for String {
    fn shape() -> ValueShape {
        ValueShape::Text
    }

    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
        match raw {
            RawValue::Text(s) => Ok(s.clone()),
            RawValue::Bool(b) => Ok(b.to_string()),
            RawValue::Int(i) => Ok(i.to_string()),
            RawValue::UInt(u) => Ok(u.to_string()),
            RawValue::Float(f) => Ok(f.to_string()),
            RawValue::Bytes(bytes) => String::from_utf8(bytes.clone()).map_err(|_| conversion::<String>(raw)),
            _ => Err(conversion::<String>(raw)),
        }
    }

    fn to_raw(&self) -> Result<RawValue, MarshalError> {
        Ok(RawValue::Text(self.clone()))
    }
}

/// Arrays convert element-wise. An element that fails to convert becomes the
/// element default; the array as a whole only fails when the raw value is not
/// a sequence.
impl<T: TagValue> TagValue for Vec<T> {
    fn shape() -> ValueShape {
        ValueShape::Array
    }

    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
        match raw {
            RawValue::Array(items) => Ok(items
                .iter()
                .map(|item| T::from_raw(item).unwrap_or_default())
                .collect()),
            RawValue::Bytes(bytes) => Ok(bytes
                .iter()
                .map(|b| T::from_raw(&RawValue::UInt(u64::from(*b))).unwrap_or_default())
                .collect()),
            _ => Err(conversion::<Vec<T>>(raw)),
        }
    }

    fn to_raw(&self) -> Result<RawValue, MarshalError> {
        self.iter()
            .map(TagValue::to_raw)
            .collect::<Result<Vec<_>, _>>()
            .map(RawValue::Array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_range_checks() {
        assert_eq!(i16::from_raw(&RawValue::Int(-200)), Ok(-200));
        assert!(u8::from_raw(&RawValue::Int(-1)).is_err());
        assert!(i8::from_raw(&RawValue::UInt(300)).is_err());
        assert_eq!(i32::from_raw(&RawValue::Float(42.0)), Ok(42));
        assert!(i32::from_raw(&RawValue::Float(42.5)).is_err());
    }

    #[test]
    fn test_text_conversions() {
        assert_eq!(f64::from_raw(&RawValue::Text(" 21.5 ".into())), Ok(21.5));
        assert_eq!(bool::from_raw(&RawValue::Text("TRUE".into())), Ok(true));
        assert_eq!(String::from_raw(&RawValue::Int(7)), Ok("7".to_string()));
        assert!(String::from_raw(&RawValue::Null).is_err());
    }

    #[test]
    fn test_array_element_fallback() {
        let raw = RawValue::Array(vec![
            RawValue::Int(1),
            RawValue::Text("oops".into()),
            RawValue::Float(3.0),
        ]);
        assert_eq!(Vec::<i32>::from_raw(&raw), Ok(vec![1, 0, 3]));
        assert!(Vec::<i32>::from_raw(&RawValue::Int(1)).is_err());
    }

    #[test]
    fn test_array_flattens_to_primitives() {
        let raw = vec![1.5f32, 2.5].to_raw().unwrap();
        assert_eq!(
            raw,
            RawValue::Array(vec![RawValue::Float(1.5), RawValue::Float(2.5)])
        );
    }

    #[test]
    fn test_payload_type_identity() {
        assert_eq!(PayloadType::of::<i32>(), PayloadType::of::<i32>());
        assert_ne!(PayloadType::of::<i32>(), PayloadType::of::<u32>());
        assert_eq!(PayloadType::of::<Vec<f64>>().shape(), ValueShape::Array);
        assert_eq!(PayloadType::of::<Vec<f64>>().to_string(), "Vec<f64>");
    }
}
