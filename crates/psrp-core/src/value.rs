//! Tagged value model for PSRP serialization
//!
//! Every datum that crosses the wire is a [`PsValue`]: a primitive, a
//! complex object with Extended Type System metadata, or an enum. The model
//! deliberately keeps ETS data (type names, adapted/extended properties,
//! ToString) in side tables on [`PsObject`] rather than trying to graft it
//! onto host-language values.
//!
//! Property lookups are case-sensitive; [`PropertyBag::get_insensitive`]
//! is provided for callers that want PowerShell's case-folding behaviour.

use std::fmt;
use std::rc::Rc;

use chrono::{FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::PsVersion;

// ----------------------------------------------------------------------------
// UTF-16 string primitive
// ----------------------------------------------------------------------------

/// A .NET string: a sequence of UTF-16 code units.
///
/// Unlike a Rust `String` this can carry lone surrogate halves, which the
/// CLIXML escape rules are required to round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PsString(Vec<u16>);

impl PsString {
    /// Create a string from raw UTF-16 code units.
    pub fn from_code_units(units: Vec<u16>) -> Self {
        Self(units)
    }

    /// The raw UTF-16 code units.
    pub fn code_units(&self) -> &[u16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Convert to a Rust string, substituting U+FFFD for lone surrogates.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }

    /// Convert to a Rust string if every code unit is well formed.
    pub fn to_utf8(&self) -> Option<String> {
        String::from_utf16(&self.0).ok()
    }
}

impl From<&str> for PsString {
    fn from(value: &str) -> Self {
        Self(value.encode_utf16().collect())
    }
}

impl From<String> for PsString {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for PsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

// ----------------------------------------------------------------------------
// Datetime and duration primitives
// ----------------------------------------------------------------------------

/// The timezone interpretation of a [`PsDateTime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    /// No timezone information; serialized without a suffix.
    Unspecified,
    /// UTC; serialized with a `Z` suffix.
    Utc,
    /// A fixed UTC offset; serialized as `+HH:MM`/`-HH:MM`.
    Local(FixedOffset),
}

/// A .NET `DateTime` with nanosecond precision and an explicit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsDateTime {
    /// The wall-clock fields, interpreted according to `kind`.
    pub datetime: NaiveDateTime,
    pub kind: DateTimeKind,
}

impl PsDateTime {
    pub fn unspecified(datetime: NaiveDateTime) -> Self {
        Self {
            datetime,
            kind: DateTimeKind::Unspecified,
        }
    }

    pub fn utc(datetime: NaiveDateTime) -> Self {
        Self {
            datetime,
            kind: DateTimeKind::Utc,
        }
    }

    pub fn local(datetime: NaiveDateTime, offset: FixedOffset) -> Self {
        Self {
            datetime,
            kind: DateTimeKind::Local(offset),
        }
    }
}

/// A .NET `TimeSpan`: a signed span of nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PsDuration {
    nanos: i128,
}

impl PsDuration {
    pub const fn from_nanos(nanos: i128) -> Self {
        Self { nanos }
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self {
            nanos: secs as i128 * 1_000_000_000,
        }
    }

    pub const fn as_nanos(self) -> i128 {
        self.nanos
    }

    pub const fn is_negative(self) -> bool {
        self.nanos < 0
    }
}

// ----------------------------------------------------------------------------
// Secure strings
// ----------------------------------------------------------------------------

/// A string whose plaintext only crosses the wire under the negotiated
/// session key.
///
/// A locally created value holds the plaintext until serialization
/// encrypts it; a decoded value holds the base64 ciphertext and is only
/// decrypted on explicit request.
#[derive(Clone, PartialEq, Eq)]
pub enum PsSecureString {
    /// Plaintext awaiting encryption by the session cipher.
    Plaintext(String),
    /// Base64 ciphertext as received from (or destined for) the wire.
    Encrypted(String),
}

impl fmt::Debug for PsSecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never echo the plaintext through Debug formatting.
        match self {
            PsSecureString::Plaintext(_) => write!(f, "PsSecureString(<plaintext redacted>)"),
            PsSecureString::Encrypted(_) => write!(f, "PsSecureString(<encrypted>)"),
        }
    }
}

// ----------------------------------------------------------------------------
// Property bags
// ----------------------------------------------------------------------------

/// A single named property on a [`PsObject`].
#[derive(Debug, Clone, PartialEq)]
pub struct PsProperty {
    pub name: String,
    pub value: PsValue,
}

/// An ordered, case-sensitive collection of properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag(Vec<PsProperty>);

impl PropertyBag {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Look up a property by exact name.
    pub fn get(&self, name: &str) -> Option<&PsValue> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Look up a property ignoring ASCII case. PowerShell itself folds
    /// case; this model does not, so the helper is opt-in.
    pub fn get_insensitive(&self, name: &str) -> Option<&PsValue> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| &p.value)
    }

    /// Insert a property, replacing any existing property with the same
    /// name while keeping its position.
    pub fn insert<N: Into<String>, V: Into<PsValue>>(&mut self, name: N, value: V) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|p| p.name == name) {
            existing.value = value;
        } else {
            self.0.push(PsProperty { name, value });
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PsProperty> {
        self.0.iter()
    }
}

impl FromIterator<(String, PsValue)> for PropertyBag {
    fn from_iter<T: IntoIterator<Item = (String, PsValue)>>(iter: T) -> Self {
        let mut bag = PropertyBag::new();
        for (name, value) in iter {
            bag.insert(name, value);
        }
        bag
    }
}

// ----------------------------------------------------------------------------
// Containers
// ----------------------------------------------------------------------------

/// The collection payload a complex object may carry. The variants are
/// mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Container {
    /// Ordered key/value entries.
    Dict(Vec<(PsValue, PsValue)>),
    Stack(Vec<PsValue>),
    Queue(Vec<PsValue>),
    List(Vec<PsValue>),
    /// A bare `IEnumerable` sequence.
    Enumerable(Vec<PsValue>),
}

// ----------------------------------------------------------------------------
// Complex objects
// ----------------------------------------------------------------------------

/// A complex value: type names, ToString, adapted and extended property
/// bags, an optional wrapped primitive and an optional container payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsObject {
    /// .NET type names, most derived first. Empty for anonymous property
    /// bags (`<Obj>` without `<TN>`).
    pub type_names: Vec<String>,
    pub to_string: Option<String>,
    /// Properties backed by the native object.
    pub adapted: PropertyBag,
    /// Properties attached by the Extended Type System.
    pub extended: PropertyBag,
    /// The wrapped primitive when this object extends a primitive value.
    pub primitive: Option<PsValue>,
    pub container: Option<Container>,
}

impl PsObject {
    /// An anonymous property bag with no type names.
    pub fn new() -> Self {
        Self::default()
    }

    /// A `PSCustomObject` property bag.
    pub fn custom_object() -> Self {
        Self {
            type_names: vec![
                "System.Management.Automation.PSCustomObject".to_string(),
                "System.Object".to_string(),
            ],
            ..Self::default()
        }
    }

    pub fn with_type_names(type_names: Vec<String>) -> Self {
        Self {
            type_names,
            ..Self::default()
        }
    }

    /// Attribute-style lookup: extended properties shadow adapted ones.
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        self.extended.get(name).or_else(|| self.adapted.get(name))
    }
}

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// The numeric wire tag backing an enum or integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericTag {
    Byte,
    SByte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
}

impl NumericTag {
    /// The CLIXML element name for this numeric kind.
    pub fn element(self) -> &'static str {
        match self {
            NumericTag::Byte => "By",
            NumericTag::SByte => "SB",
            NumericTag::UInt16 => "U16",
            NumericTag::Int16 => "I16",
            NumericTag::UInt32 => "U32",
            NumericTag::Int32 => "I32",
            NumericTag::UInt64 => "U64",
            NumericTag::Int64 => "I64",
        }
    }
}

/// A .NET enum value: type names, the underlying number, and the symbolic
/// labels it decomposes into. Flag enums carry one label per set flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PsEnum {
    pub type_names: Vec<String>,
    pub value: i64,
    /// The wire tag of the underlying numeric type.
    pub tag: NumericTag,
    pub labels: Vec<String>,
}

impl PsEnum {
    pub fn new(type_names: Vec<String>, value: i64, labels: Vec<String>) -> Self {
        Self {
            type_names,
            value,
            tag: NumericTag::Int32,
            labels,
        }
    }

    /// The ToString form: labels joined with `", "`.
    pub fn label_string(&self) -> String {
        self.labels.join(", ")
    }
}

// ----------------------------------------------------------------------------
// The value model
// ----------------------------------------------------------------------------

/// Every serializable PSRP datum.
#[derive(Debug, Clone, PartialEq)]
pub enum PsValue {
    Null,
    Bool(bool),
    String(PsString),
    /// A single UTF-16 code unit.
    Char(u16),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Decimal(Decimal),
    DateTime(PsDateTime),
    Duration(PsDuration),
    ByteArray(Vec<u8>),
    Guid(Uuid),
    Uri(String),
    Version(PsVersion),
    /// An XML document carried as its text.
    XmlDocument(String),
    /// A scriptblock carried as its text.
    ScriptBlock(String),
    SecureString(PsSecureString),
    Object(Rc<PsObject>),
    Enum(Rc<PsEnum>),
}

impl PsValue {
    /// Wrap a complex object.
    pub fn object(obj: PsObject) -> Self {
        PsValue::Object(Rc::new(obj))
    }

    /// Wrap an enum value.
    pub fn enumeration(value: PsEnum) -> Self {
        PsValue::Enum(Rc::new(value))
    }

    /// Build a `List` container object.
    pub fn list(items: Vec<PsValue>) -> Self {
        let mut obj = PsObject::with_type_names(vec![
            "System.Collections.ArrayList".to_string(),
            "System.Object".to_string(),
        ]);
        obj.container = Some(Container::List(items));
        PsValue::object(obj)
    }

    /// Build a `Dict` container object keyed by arbitrary values.
    pub fn dict(entries: Vec<(PsValue, PsValue)>) -> Self {
        let mut obj = PsObject::with_type_names(vec![
            "System.Collections.Hashtable".to_string(),
            "System.Object".to_string(),
        ]);
        obj.container = Some(Container::Dict(entries));
        PsValue::object(obj)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PsValue::Null)
    }

    /// The value as a Rust string, when it is string-like.
    pub fn as_str(&self) -> Option<String> {
        match self {
            PsValue::String(s) => Some(s.to_string_lossy()),
            PsValue::Uri(s) | PsValue::XmlDocument(s) | PsValue::ScriptBlock(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as a signed 64-bit integer, widening any integral
    /// primitive, enum, or integral extended primitive.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PsValue::SByte(v) => Some(i64::from(*v)),
            PsValue::Byte(v) => Some(i64::from(*v)),
            PsValue::Int16(v) => Some(i64::from(*v)),
            PsValue::UInt16(v) => Some(i64::from(*v)),
            PsValue::Int32(v) => Some(i64::from(*v)),
            PsValue::UInt32(v) => Some(i64::from(*v)),
            PsValue::Int64(v) => Some(*v),
            PsValue::UInt64(v) => i64::try_from(*v).ok(),
            PsValue::Char(v) => Some(i64::from(*v)),
            PsValue::Enum(e) => Some(e.value),
            PsValue::Object(o) => o.primitive.as_ref().and_then(PsValue::as_i64),
            _ => None,
        }
    }

    /// The complex object payload, when present.
    pub fn as_object(&self) -> Option<&PsObject> {
        match self {
            PsValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Attribute-style property access on complex objects.
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        self.as_object().and_then(|o| o.property(name))
    }

    /// The items of a sequence container, when present.
    pub fn items(&self) -> Option<&[PsValue]> {
        match self.as_object().and_then(|o| o.container.as_ref()) {
            Some(Container::List(v))
            | Some(Container::Stack(v))
            | Some(Container::Queue(v))
            | Some(Container::Enumerable(v)) => Some(v),
            _ => None,
        }
    }

    /// The entries of a dict container, when present.
    pub fn entries(&self) -> Option<&[(PsValue, PsValue)]> {
        match self.as_object().and_then(|o| o.container.as_ref()) {
            Some(Container::Dict(entries)) => Some(entries),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Native conversions
// ----------------------------------------------------------------------------

impl From<&str> for PsValue {
    fn from(value: &str) -> Self {
        PsValue::String(PsString::from(value))
    }
}

impl From<String> for PsValue {
    fn from(value: String) -> Self {
        PsValue::String(PsString::from(value))
    }
}

impl From<bool> for PsValue {
    fn from(value: bool) -> Self {
        PsValue::Bool(value)
    }
}

macro_rules! impl_from_numeric {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for PsValue {
            fn from(value: $ty) -> Self {
                PsValue::$variant(value)
            }
        })*
    };
}

impl_from_numeric!(
    i8 => SByte,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Single,
    f64 => Double,
);

impl From<Vec<u8>> for PsValue {
    fn from(value: Vec<u8>) -> Self {
        PsValue::ByteArray(value)
    }
}

impl From<Uuid> for PsValue {
    fn from(value: Uuid) -> Self {
        PsValue::Guid(value)
    }
}

impl From<PsDateTime> for PsValue {
    fn from(value: PsDateTime) -> Self {
        PsValue::DateTime(value)
    }
}

impl From<PsDuration> for PsValue {
    fn from(value: PsDuration) -> Self {
        PsValue::Duration(value)
    }
}

impl From<PsVersion> for PsValue {
    fn from(value: PsVersion) -> Self {
        PsValue::Version(value)
    }
}

impl From<Vec<PsValue>> for PsValue {
    fn from(value: Vec<PsValue>) -> Self {
        PsValue::list(value)
    }
}

impl From<Vec<(PsValue, PsValue)>> for PsValue {
    fn from(value: Vec<(PsValue, PsValue)>) -> Self {
        PsValue::dict(value)
    }
}

impl<T: Into<PsValue>> From<Option<T>> for PsValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => PsValue::Null,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_string_round_trips_lone_surrogates() {
        let s = PsString::from_code_units(vec![0xD800]);
        assert_eq!(s.to_utf8(), None);
        assert_eq!(s.to_string_lossy(), "\u{FFFD}");
        assert_eq!(s.code_units(), &[0xD800]);

        let s = PsString::from("caf\u{00E9} \u{1F600}");
        assert_eq!(s.to_utf8().as_deref(), Some("caf\u{00E9} \u{1F600}"));
    }

    #[test]
    fn test_property_shadowing() {
        let mut obj = PsObject::custom_object();
        obj.adapted.insert("Name", "adapted");
        obj.extended.insert("Name", "extended");
        assert_eq!(
            obj.property("Name").and_then(PsValue::as_str).as_deref(),
            Some("extended")
        );
    }

    #[test]
    fn test_property_case_sensitivity() {
        let mut bag = PropertyBag::new();
        bag.insert("Name", 1i32);
        assert!(bag.get("name").is_none());
        assert!(bag.get("Name").is_some());
        assert!(bag.get_insensitive("NAME").is_some());
    }

    #[test]
    fn test_property_replacement_keeps_order() {
        let mut bag = PropertyBag::new();
        bag.insert("a", 1i32);
        bag.insert("b", 2i32);
        bag.insert("a", 3i32);
        let names: Vec<&str> = bag.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(bag.get("a"), Some(&PsValue::Int32(3)));
    }

    #[test]
    fn test_structural_equality_ignores_sharing() {
        let shared = Rc::new(PsObject::custom_object());
        let a = PsValue::Object(Rc::clone(&shared));
        let b = PsValue::object(PsObject::custom_object());
        assert_eq!(a, b);
    }

    #[test]
    fn test_as_i64_widening() {
        assert_eq!(PsValue::Byte(7).as_i64(), Some(7));
        assert_eq!(PsValue::UInt64(u64::MAX).as_i64(), None);
        let e = PsValue::enumeration(PsEnum::new(vec![], 3, vec!["X".into()]));
        assert_eq!(e.as_i64(), Some(3));
    }

    #[test]
    fn test_secure_string_debug_redacts() {
        let s = PsSecureString::Plaintext("hunter2".to_string());
        assert!(!format!("{s:?}").contains("hunter2"));
    }
}
