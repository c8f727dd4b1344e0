//! PSRP protocol layer
//!
//! Message framing, typed message bodies, fragmentation, and the runspace
//! pool / pipeline state machines for both sides of the conversation.

pub mod bodies;
pub mod client;
pub mod command;
pub mod enums;
pub mod events;
pub mod fragment;
pub mod host;
pub mod message;
pub mod pool;
pub mod records;
pub mod server;

use crate::errors::{ProtocolError, PsrpError, Result};
use crate::value::{PsObject, PsValue};

// ----------------------------------------------------------------------------
// Body construction helpers
// ----------------------------------------------------------------------------

/// Build an anonymous object carrying the given extended (note)
/// properties, the shape most PSRP message bodies take.
pub(crate) fn note_object<I>(props: I) -> PsValue
where
    I: IntoIterator<Item = (&'static str, PsValue)>,
{
    let mut obj = PsObject::new();
    for (name, value) in props {
        obj.extended.insert(name, value);
    }
    PsValue::object(obj)
}

/// A malformed-body error naming the message and the field.
pub(crate) fn missing_field(message: &str, field: &str) -> PsrpError {
    ProtocolError::violation(format!("{message} body is missing '{field}'")).into()
}

/// Fetch a required property from a message body.
pub(crate) fn req<'v>(value: &'v PsValue, message: &str, field: &str) -> Result<&'v PsValue> {
    value
        .property(field)
        .ok_or_else(|| missing_field(message, field))
}

/// Fetch an optional property, mapping an explicit `Nil` to `None`.
pub(crate) fn opt<'v>(value: &'v PsValue, field: &str) -> Option<&'v PsValue> {
    value.property(field).filter(|v| !v.is_null())
}

pub(crate) fn req_i32(value: &PsValue, message: &str, field: &str) -> Result<i32> {
    req(value, message, field)?
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| missing_field(message, field))
}

pub(crate) fn req_i64(value: &PsValue, message: &str, field: &str) -> Result<i64> {
    req(value, message, field)?
        .as_i64()
        .ok_or_else(|| missing_field(message, field))
}

pub(crate) fn req_bool(value: &PsValue, message: &str, field: &str) -> Result<bool> {
    req(value, message, field)?
        .as_bool()
        .ok_or_else(|| missing_field(message, field))
}

pub(crate) fn req_str(value: &PsValue, message: &str, field: &str) -> Result<String> {
    req(value, message, field)?
        .as_str()
        .ok_or_else(|| missing_field(message, field))
}

pub(crate) fn opt_str(value: &PsValue, field: &str) -> Option<String> {
    opt(value, field).and_then(PsValue::as_str)
}

/// The items of a sequence-valued property, tolerating `Nil` and absence
/// as an empty sequence.
pub(crate) fn opt_items(value: &PsValue, field: &str) -> Vec<PsValue> {
    opt(value, field)
        .and_then(PsValue::items)
        .map(<[PsValue]>::to_vec)
        .unwrap_or_default()
}
