//! # Value Marshalling
//!
//! Conversion between the untyped [`RawValue`](crate::RawValue) seen by
//! transports and the typed payloads handlers are written against.
//!
//! - [`TagValue`] - Conversion contract implemented by every payload type
//! - [`ValueMarshaller`] - Runtime codec registry used by the dispatch engine
//! - [`FixedString`] - Fixed-capacity controller strings
//! - [`structured_value!`](crate::structured_value) - Packed structure support

pub mod codec;
pub mod registry;
pub mod structured;

pub use codec::{PayloadType, TagValue, ValueShape};
pub use registry::{Decoded, PayloadCodec, TypedPayload, ValueMarshaller};
pub use structured::{field_from_named, FieldCodec, FixedString, StructReader, StructWriter};
