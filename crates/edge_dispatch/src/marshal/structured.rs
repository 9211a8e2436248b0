//! Structured payloads and fixed-capacity strings.
//!
//! Controller structures arrive as packed little-endian byte buffers with the
//! fields laid out in declaration order; brokers deliver the same structures
//! as named-field documents. [`structured_value!`](crate::structured_value)
//! derives a [`TagValue`] that accepts both and always encodes to bytes.

use super::codec::{TagValue, ValueShape};
use crate::error::MarshalError;
use crate::types::RawValue;
use std::fmt;

// ============================================================================
// Byte Buffer Access
// ============================================================================

/// Sequential reader over a packed structure buffer.
pub struct StructReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StructReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Takes the next `n` bytes or fails with [`MarshalError::Truncated`].
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(MarshalError::Truncated { needed: n, available });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Takes exactly `N` bytes as an array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], MarshalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Sequential writer producing a packed structure buffer.
#[derive(Debug, Default)]
pub struct StructWriter {
    buf: Vec<u8>,
}

impl StructWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A value that can be a field of a structured payload.
pub trait FieldCodec: TagValue {
    fn read(reader: &mut StructReader<'_>) -> Result<Self, MarshalError>;
    fn write(&self, writer: &mut StructWriter) -> Result<(), MarshalError>;
}

impl FieldCodec for bool {
    fn read(reader: &mut StructReader<'_>) -> Result<Self, MarshalError> {
        Ok(reader.take_array::<1>()?[0] != 0)
    }

    fn write(&self, writer: &mut StructWriter) -> Result<(), MarshalError> {
        writer.put(&[u8::from(*self)]);
        Ok(())
    }
}

macro_rules! le_field_codec {
    ($($ty:ty),*) => {
        $(
            impl FieldCodec for $ty {
                fn read(reader: &mut StructReader<'_>) -> Result<Self, MarshalError> {
                    Ok(<$ty>::from_le_bytes(reader.take_array::<{ std::mem::size_of::<$ty>() }>()?))
                }

                fn write(&self, writer: &mut StructWriter) -> Result<(), MarshalError> {
                    writer.put(&self.to_le_bytes());
                    Ok(())
                }
            }
        )*
    };
}

le_field_codec!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// Looks up a named field of a structured document.
///
/// A missing field takes its default; a present field that cannot be
/// converted is an error.
pub fn field_from_named<T: TagValue>(
    fields: &[(String, RawValue)],
    name: &str,
) -> Result<T, MarshalError> {
    match fields.iter().find(|(field, _)| field == name) {
        Some((_, raw)) => T::from_raw(raw),
        None => Ok(T::default()),
    }
}

// ============================================================================
// Fixed-Capacity Strings
// ============================================================================

/// Text with a fixed byte capacity `N`.
///
/// Encoded as a little-endian `u32` length followed by exactly `N` bytes of
/// zero-padded UTF-8. Encoding text longer than `N` bytes fails with
/// [`MarshalError::CapacityExceeded`]; nothing is silently truncated.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct FixedString<const N: usize> {
    text: String,
}

impl<const N: usize> FixedString<N> {
    pub const CAPACITY: usize = N;

    /// Creates a fixed string, checking the capacity up front.
    pub fn try_new(text: impl Into<String>) -> Result<Self, MarshalError> {
        let text = text.into();
        if text.len() > N {
            return Err(MarshalError::CapacityExceeded {
                capacity: N,
                actual: text.len(),
            });
        }
        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn encode(&self) -> Result<Vec<u8>, MarshalError> {
        let bytes = self.text.as_bytes();
        if bytes.len() > N {
            return Err(MarshalError::CapacityExceeded {
                capacity: N,
                actual: bytes.len(),
            });
        }
        let mut out = Vec::with_capacity(4 + N);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
        out.resize(4 + N, 0);
        Ok(out)
    }

    fn decode(reader: &mut StructReader<'_>) -> Result<Self, MarshalError> {
        let declared = u32::from_le_bytes(reader.take_array::<4>()?) as usize;
        let data = reader.take(N)?;
        let len = declared.min(N);
        let text = String::from_utf8_lossy(&data[..len]).into_owned();
        Ok(Self { text })
    }
}

/// Unchecked conversion; capacity is enforced when encoding.
impl<const N: usize> From<String> for FixedString<N> {
    fn from(text: String) -> Self {
        Self { text }
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(text: &str) -> Self {
        Self { text: text.to_string() }
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedString<{}>({:?})", N, self.text)
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl<const N: usize> TagValue for FixedString<N> {
    fn shape() -> ValueShape {
        ValueShape::Text
    }

    fn from_raw(raw: &RawValue) -> Result<Self, MarshalError> {
        match raw {
            RawValue::Text(s) => Ok(Self { text: s.clone() }),
            RawValue::Bytes(bytes) => Self::decode(&mut StructReader::new(bytes)),
            other => Err(MarshalError::Conversion {
                from: other.type_label(),
                to: std::any::type_name::<Self>(),
            }),
        }
    }

    fn to_raw(&self) -> Result<RawValue, MarshalError> {
        self.encode().map(RawValue::Bytes)
    }
}

impl<const N: usize> FieldCodec for FixedString<N> {
    fn read(reader: &mut StructReader<'_>) -> Result<Self, MarshalError> {
        Self::decode(reader)
    }

    fn write(&self, writer: &mut StructWriter) -> Result<(), MarshalError> {
        writer.put(&self.encode()?);
        Ok(())
    }
}

// ============================================================================
// Structured Value Macro
// ============================================================================

/// Implements [`TagValue`](crate::marshal::TagValue) for a plain struct whose
/// fields all implement [`FieldCodec`](crate::marshal::FieldCodec).
///
/// The struct must also derive `Clone`, `Default` and `Debug`. Fields are
/// listed in wire order.
///
/// ```rust
/// use edge_dispatch::{structured_value, FixedString, RawValue, TagValue};
///
/// #[derive(Clone, Default, Debug, PartialEq)]
/// struct Recipe {
///     id: u16,
///     setpoint: f32,
///     name: FixedString<8>,
/// }
///
/// structured_value!(Recipe { id: u16, setpoint: f32, name: FixedString<8> });
///
/// let recipe = Recipe { id: 3, setpoint: 72.5, name: "mix".into() };
/// let raw = recipe.to_raw().unwrap();
/// assert_eq!(Recipe::from_raw(&raw).unwrap(), recipe);
/// ```
#[macro_export]
macro_rules! structured_value {
    ($ty:ident { $($field:ident : $fty:ty),+ $(,)? }) => {
        impl $crate::marshal::TagValue for $ty {
            fn shape() -> $crate::marshal::ValueShape {
                $crate::marshal::ValueShape::Structured
            }

            fn from_raw(raw: &$crate::RawValue) -> ::std::result::Result<Self, $crate::MarshalError> {
                match raw {
                    $crate::RawValue::Bytes(bytes) => {
                        let mut reader = $crate::marshal::StructReader::new(bytes);
                        Ok(Self {
                            $($field: <$fty as $crate::marshal::FieldCodec>::read(&mut reader)?,)+
                        })
                    }
                    $crate::RawValue::Struct(fields) => Ok(Self {
                        $($field: $crate::marshal::field_from_named::<$fty>(fields, stringify!($field))?,)+
                    }),
                    other => Err($crate::MarshalError::Conversion {
                        from: other.type_label(),
                        to: stringify!($ty),
                    }),
                }
            }

            fn to_raw(&self) -> ::std::result::Result<$crate::RawValue, $crate::MarshalError> {
                let mut writer = $crate::marshal::StructWriter::new();
                $(<$fty as $crate::marshal::FieldCodec>::write(&self.$field, &mut writer)?;)+
                Ok($crate::RawValue::Bytes(writer.into_bytes()))
            }
        }
    };
}
