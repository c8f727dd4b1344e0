//! Type registry for rehydrating deserialized objects
//!
//! Maps .NET type-name lists to a registration describing how incoming
//! objects with that leading type name materialize. Registered types with
//! `rehydrate` set keep their identity; everything else deserializes down
//! the generic path with `Deserialized.`-prefixed type names.

use std::collections::HashMap;

use crate::value::NumericTag;

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

/// How a registered type materializes on deserialization.
#[derive(Debug, Clone)]
pub enum TypeShape {
    /// A plain complex object.
    Object,
    /// An enum backed by a numeric primitive.
    Enum {
        tag: NumericTag,
        /// Whether the labels compose bitwise.
        flags: bool,
        /// Symbolic labels and their numeric values.
        labels: Vec<(&'static str, i64)>,
    },
}

/// A single registry entry, keyed by its leading type name.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The canonical type-name list, most derived first. Must be
    /// non-empty; the first entry is the registry key.
    pub type_names: Vec<String>,
    /// Construct the registered type on deserialization. When unset the
    /// object goes down the generic `Deserialized.` path.
    pub rehydrate: bool,
    pub shape: TypeShape,
}

impl Registration {
    /// A rehydratable enum registration.
    pub fn enumeration(
        type_names: &[&str],
        tag: NumericTag,
        flags: bool,
        labels: Vec<(&'static str, i64)>,
    ) -> Self {
        Self {
            type_names: type_names.iter().map(|n| n.to_string()).collect(),
            rehydrate: true,
            shape: TypeShape::Enum { tag, flags, labels },
        }
    }

    /// A rehydratable object registration.
    pub fn object(type_names: &[&str]) -> Self {
        Self {
            type_names: type_names.iter().map(|n| n.to_string()).collect(),
            rehydrate: true,
            shape: TypeShape::Object,
        }
    }

    /// Decompose a numeric value into symbolic labels according to this
    /// registration's label table.
    pub fn labels_for(&self, value: i64) -> Vec<String> {
        let (flags, labels) = match &self.shape {
            TypeShape::Enum { flags, labels, .. } => (*flags, labels),
            TypeShape::Object => return Vec::new(),
        };

        if let Some((name, _)) = labels.iter().find(|(_, v)| *v == value) {
            return vec![name.to_string()];
        }

        if flags && value != 0 {
            let mut out = Vec::new();
            let mut remainder = value;
            for (name, bit) in labels {
                if *bit != 0 && value & bit == *bit {
                    out.push(name.to_string());
                    remainder &= !bit;
                }
            }
            if remainder == 0 && !out.is_empty() {
                return out;
            }
        }

        vec![value.to_string()]
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Registry of known .NET types, injectable per pool.
///
/// Registration is additive and idempotent; re-registering under the same
/// leading type name replaces the prior entry. Lookup never fails: unknown
/// types always take the generic path.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entries: HashMap<String, Registration>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the protocol enums PSRP messages carry
    /// (thread options, apartment state, stream merge flags, host method
    /// identifiers, ...).
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for registration in crate::protocol::enums::standard_registrations() {
            registry.register(registration);
        }
        registry
    }

    /// Register a type, replacing any existing entry with the same
    /// leading type name.
    pub fn register(&mut self, registration: Registration) {
        if let Some(leading) = registration.type_names.first() {
            self.entries.insert(leading.clone(), registration);
        }
    }

    /// Find the registration whose leading type name matches the first
    /// incoming type name.
    pub fn lookup(&self, type_names: &[String]) -> Option<&Registration> {
        type_names.first().and_then(|n| self.entries.get(n))
    }

    /// The type names a deserialized object should carry: the original
    /// list for rehydratable registrations, otherwise each name prefixed
    /// with `Deserialized.`.
    pub fn resolve_type_names(&self, type_names: &[String]) -> Vec<String> {
        match self.lookup(type_names) {
            Some(reg) if reg.rehydrate => type_names.to_vec(),
            _ => type_names
                .iter()
                .map(|n| format!("Deserialized.{n}"))
                .collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_enum() -> Registration {
        Registration::enumeration(
            &["Test.Enum", "System.Enum", "System.ValueType", "System.Object"],
            NumericTag::Int32,
            false,
            vec![("Zero", 0), ("One", 1), ("Two", 2)],
        )
    }

    fn test_flags() -> Registration {
        Registration::enumeration(
            &["Test.Flags", "System.Enum", "System.ValueType", "System.Object"],
            NumericTag::Int32,
            true,
            vec![("none", 0), ("A", 1), ("B", 2), ("C", 4)],
        )
    }

    #[test]
    fn test_lookup_by_leading_name() {
        let mut registry = TypeRegistry::new();
        registry.register(test_enum());

        let names = vec!["Test.Enum".to_string(), "System.Enum".to_string()];
        assert!(registry.lookup(&names).is_some());

        let names = vec!["System.Enum".to_string()];
        assert!(registry.lookup(&names).is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = TypeRegistry::new();
        registry.register(test_enum());
        let mut replacement = test_enum();
        replacement.rehydrate = false;
        registry.register(replacement);

        let names = vec!["Test.Enum".to_string()];
        assert!(!registry.lookup(&names).unwrap().rehydrate);
    }

    #[test]
    fn test_generic_path_prefixes_names() {
        let registry = TypeRegistry::new();
        let names = vec!["Some.Unknown".to_string(), "System.Object".to_string()];
        assert_eq!(
            registry.resolve_type_names(&names),
            vec!["Deserialized.Some.Unknown", "Deserialized.System.Object"]
        );
    }

    #[test]
    fn test_label_decomposition() {
        let reg = test_enum();
        assert_eq!(reg.labels_for(1), vec!["One"]);
        assert_eq!(reg.labels_for(9), vec!["9"]);

        let flags = test_flags();
        assert_eq!(flags.labels_for(0), vec!["none"]);
        assert_eq!(flags.labels_for(3), vec!["A", "B"]);
        assert_eq!(flags.labels_for(6), vec!["B", "C"]);
        assert_eq!(flags.labels_for(8), vec!["8"]);
    }
}
