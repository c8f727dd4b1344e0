//! Property tests for the CLIXML codec and the fragmenter
//!
//! The codec must round-trip every value structurally, serialize
//! deterministically, and stay stable under a second encode/decode pass.
//! The fragmenter must reassemble any in-order fragmentation and reject
//! any out-of-order delivery.

use chrono::{FixedOffset, NaiveDate};
use proptest::prelude::*;
use uuid::Uuid;

use psrp_core::protocol::fragment::{fragment_object, Defragmenter};
use psrp_core::value::{PsDateTime, PsDuration, PsObject, PsString, PsValue};
use psrp_core::{
    deserialize_clixml, serialize_clixml, ApartmentState, FragmentError, PsVersion, PsrpError,
};
use rust_decimal::Decimal;

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

fn datetime_strategy() -> impl Strategy<Value = PsValue> {
    (
        1i32..=9999,
        1u32..=12,
        1u32..=28,
        0u32..24,
        0u32..60,
        0u32..60,
        0u32..1_000_000_000,
        -14 * 60..=14 * 60i32,
        0u8..3,
    )
        .prop_map(|(year, month, day, hour, min, sec, nanos, offset, kind)| {
            let naive = NaiveDate::from_ymd_opt(year, month, day)
                .unwrap()
                .and_hms_nano_opt(hour, min, sec, nanos)
                .unwrap();
            let value = match kind {
                0 => PsDateTime::unspecified(naive),
                1 => PsDateTime::utc(naive),
                _ => PsDateTime::local(naive, FixedOffset::east_opt(offset * 60).unwrap()),
            };
            PsValue::DateTime(value)
        })
}

fn version_strategy() -> impl Strategy<Value = PsValue> {
    (0i32..100, 0i32..100, proptest::option::of((0i32..100, 0i32..100))).prop_map(
        |(major, minor, tail)| {
            let version = match tail {
                Some((build, revision)) => PsVersion::full(major, minor, build, revision),
                None => PsVersion::new(major, minor),
            };
            PsValue::Version(version)
        },
    )
}

fn property_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9]{0,6}"
}

fn numeric_leaf() -> impl Strategy<Value = PsValue> {
    prop_oneof![
        any::<i8>().prop_map(PsValue::SByte),
        any::<u8>().prop_map(PsValue::Byte),
        any::<i16>().prop_map(PsValue::Int16),
        any::<u16>().prop_map(PsValue::UInt16),
        any::<i32>().prop_map(PsValue::Int32),
        any::<u32>().prop_map(PsValue::UInt32),
        any::<i64>().prop_map(PsValue::Int64),
        any::<u64>().prop_map(PsValue::UInt64),
        (-1.0e6f32..1.0e6).prop_map(PsValue::Single),
        (-1.0e15f64..1.0e15).prop_map(PsValue::Double),
    ]
}

fn text_leaf() -> impl Strategy<Value = PsValue> {
    prop_oneof![
        Just(PsValue::Null),
        any::<bool>().prop_map(PsValue::Bool),
        any::<String>().prop_map(PsValue::from),
        // Raw UTF-16 code units, including lone surrogate halves.
        proptest::collection::vec(any::<u16>(), 0..24)
            .prop_map(|units| PsValue::String(PsString::from_code_units(units))),
        any::<u16>().prop_map(PsValue::Char),
        "[ -~]{0,16}".prop_map(PsValue::ScriptBlock),
    ]
}

fn typed_leaf() -> impl Strategy<Value = PsValue> {
    prop_oneof![
        any::<i64>().prop_map(|n| PsValue::Decimal(Decimal::new(n, 4))),
        any::<[u8; 16]>().prop_map(|b| PsValue::Guid(Uuid::from_bytes(b))),
        proptest::collection::vec(any::<u8>(), 0..48).prop_map(PsValue::ByteArray),
        datetime_strategy(),
        any::<i64>().prop_map(|n| PsValue::Duration(PsDuration::from_nanos(i128::from(n)))),
        version_strategy(),
        (0i64..3).prop_map(|v| ApartmentState::from_i64(v).unwrap().to_value()),
    ]
}

fn leaf_strategy() -> impl Strategy<Value = PsValue> {
    prop_oneof![numeric_leaf(), text_leaf(), typed_leaf()]
}

fn value_strategy() -> impl Strategy<Value = PsValue> {
    leaf_strategy().prop_recursive(3, 32, 6, |inner| {
        let object = (
            proptest::collection::btree_map(property_name(), inner.clone(), 0..4),
            proptest::option::of("[ -~]{0,12}"),
        )
            .prop_map(|(props, to_string)| {
                let mut obj = PsObject::custom_object();
                obj.to_string = to_string;
                for (name, value) in props {
                    obj.extended.insert(name, value);
                }
                PsValue::object(obj)
            });

        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..5).prop_map(PsValue::list),
            proptest::collection::vec((any::<String>().prop_map(PsValue::from), inner.clone()), 0..4)
                .prop_map(PsValue::dict),
            object,
        ]
    })
}

// ----------------------------------------------------------------------------
// Codec properties
// ----------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Structural round trip for every value without identity sharing.
    #[test]
    fn round_trip_preserves_value(value in value_strategy()) {
        let xml = serialize_clixml(&value).unwrap();
        let decoded = deserialize_clixml(&xml).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &value, "xml was: {}", xml);
    }

    /// Serialization is deterministic byte for byte.
    #[test]
    fn serialization_is_deterministic(value in value_strategy()) {
        let first = serialize_clixml(&value).unwrap();
        let second = serialize_clixml(&value).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Re-encoding a decoded document is stable at the model level.
    #[test]
    fn reserialization_is_idempotent(value in value_strategy()) {
        let xml = serialize_clixml(&value).unwrap();
        let decoded = deserialize_clixml(&xml).unwrap().remove(0);

        let second_xml = serialize_clixml(&decoded).unwrap();
        let second_decoded = deserialize_clixml(&second_xml).unwrap().remove(0);
        prop_assert_eq!(second_decoded, decoded);
    }

    /// Escaped strings never contain raw control characters.
    #[test]
    fn serialized_strings_are_clean(units in proptest::collection::vec(any::<u16>(), 0..64)) {
        let value = PsValue::String(PsString::from_code_units(units));
        let xml = serialize_clixml(&value).unwrap();
        let has_raw_control = xml
            .chars()
            .any(|c| (c < ' ' && c != '\n') || ('\u{7F}'..='\u{9F}').contains(&c));
        prop_assert!(!has_raw_control);
    }
}

// ----------------------------------------------------------------------------
// Fragmenter properties
// ----------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Reassembling an in-order fragmentation at any size yields the
    /// original bytes.
    #[test]
    fn fragmentation_round_trip(
        data in proptest::collection::vec(any::<u8>(), 1..4096),
        size_index in 0usize..3,
    ) {
        let max_size = [22usize, 100, 65_535][size_index];
        let fragments = fragment_object(1, &data, max_size);

        for fragment in &fragments {
            prop_assert!(fragment.data.len() <= max_size);
        }
        prop_assert!(fragments[0].start);
        prop_assert!(fragments.last().unwrap().end);

        let mut defragmenter = Defragmenter::new();
        let mut result = None;
        for fragment in &fragments {
            result = defragmenter.receive(fragment.clone()).unwrap();
        }
        prop_assert_eq!(result, Some(data));
    }

    /// Any delivery order that is not strictly increasing fails.
    #[test]
    fn non_sequential_delivery_fails(
        data in proptest::collection::vec(any::<u8>(), 64..512),
        swap in 0usize..8,
    ) {
        let fragments = fragment_object(1, &data, 22);
        prop_assume!(fragments.len() >= 2);
        let a = swap % fragments.len();
        let b = (a + 1) % fragments.len();

        let mut order: Vec<usize> = (0..fragments.len()).collect();
        order.swap(a, b);

        let mut defragmenter = Defragmenter::new();
        let mut failed = false;
        for index in order {
            match defragmenter.receive(fragments[index].clone()) {
                Err(PsrpError::Fragment(
                    FragmentError::OutOfOrder { .. } | FragmentError::MissingStart { .. },
                )) => {
                    failed = true;
                    break;
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
                Ok(_) => {}
            }
        }
        prop_assert!(failed);
    }
}
