//! Variable type registry.
//!
//! An ordered list of mappings, each pairing a value predicate with an
//! optional [`Converter`] and the [`VariableKind`] that stores the result.
//! The first mapping accepting a value wins; a value no mapping accepts is
//! stored as [`VariableKind::Unpersistable`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::instance::StoredValue;
use super::value::VariableValue;
use super::VariableError;

/// Built-in mappings in their default order.
pub const DEFAULT_TYPES: &[&str] = &[
    "null", "string", "boolean", "char", "long", "double", "date", "bytes", "json", "entity",
];

/// Storage shape of a variable instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariableKind {
    Null,
    String,
    Long,
    Double,
    Date,
    ByteArray,
    Entity,
    Unpersistable,
}

impl VariableKind {
    /// Whether a value can be stored without conversion.
    pub fn accepts(&self, value: &VariableValue) -> bool {
        matches!(
            (self, value),
            (Self::Null, VariableValue::Null)
                | (Self::String, VariableValue::String(_))
                | (Self::Long, VariableValue::Long(_))
                | (Self::Double, VariableValue::Double(_))
                | (Self::Date, VariableValue::Date(_))
                | (Self::ByteArray, VariableValue::Bytes(_))
                | (Self::Entity, VariableValue::Entity(_))
        )
    }

    pub fn is_storable(&self, stored: &StoredValue) -> bool {
        matches!(
            (self, stored),
            (Self::Null, StoredValue::Null)
                | (Self::String, StoredValue::String(_))
                | (Self::Long, StoredValue::Long(_))
                | (Self::Double, StoredValue::Double(_))
                | (Self::Date, StoredValue::Date(_))
                | (Self::ByteArray, StoredValue::Bytes(_))
                | (Self::Entity, StoredValue::Entity(_))
                | (Self::Unpersistable, StoredValue::Unpersistable(_))
        )
    }
}

/// Reversible conversion between a runtime value and its stored form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Converter {
    /// `true`/`false` as `"T"`/`"F"`
    BooleanToString,
    CharToString,
    /// JSON documents as UTF-8 bytes
    JsonToBytes,
}

impl Converter {
    pub fn supports(&self, value: &VariableValue) -> bool {
        matches!(
            (self, value),
            (Self::BooleanToString, VariableValue::Boolean(_))
                | (Self::CharToString, VariableValue::Char(_))
                | (Self::JsonToBytes, VariableValue::Json(_))
        )
    }

    pub fn convert(&self, value: &VariableValue) -> Result<StoredValue, String> {
        match (self, value) {
            (Self::BooleanToString, VariableValue::Boolean(b)) => {
                Ok(StoredValue::String(if *b { "T" } else { "F" }.to_string()))
            }
            (Self::CharToString, VariableValue::Char(c)) => Ok(StoredValue::String(c.to_string())),
            (Self::JsonToBytes, VariableValue::Json(json)) => serde_json::to_vec(json)
                .map(StoredValue::Bytes)
                .map_err(|e| e.to_string()),
            _ => Err(format!("{:?} can't convert a {} value", self, value.type_name())),
        }
    }

    pub fn revert(&self, stored: &StoredValue) -> Result<VariableValue, String> {
        match (self, stored) {
            (Self::BooleanToString, StoredValue::String(s)) => match s.as_str() {
                "T" => Ok(VariableValue::Boolean(true)),
                "F" => Ok(VariableValue::Boolean(false)),
                other => Err(format!("'{}' is not a stored boolean", other)),
            },
            (Self::CharToString, StoredValue::String(s)) => s
                .chars()
                .next()
                .map(VariableValue::Char)
                .ok_or_else(|| "empty stored char".to_string()),
            (Self::JsonToBytes, StoredValue::Bytes(bytes)) => serde_json::from_slice(bytes)
                .map(VariableValue::Json)
                .map_err(|e| e.to_string()),
            _ => Err(format!("{:?} can't revert {:?}", self, stored)),
        }
    }
}

/// Predicate selecting the values a mapping handles.
pub type Matcher = Arc<dyn Fn(&VariableValue) -> bool + Send + Sync>;

/// One entry of the [`TypeRegistry`].
#[derive(Clone)]
pub struct TypeMapping {
    name: String,
    matcher: Matcher,
    converter: Option<Converter>,
    kind: VariableKind,
}

impl TypeMapping {
    pub fn new<F>(name: impl Into<String>, matcher: F, converter: Option<Converter>, kind: VariableKind) -> Self
    where
        F: Fn(&VariableValue) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Arc::new(matcher),
            converter,
            kind,
        }
    }

    /// Looks up a built-in mapping by name.
    pub fn builtin(name: &str) -> Option<Self> {
        let mapping = match name {
            "null" => Self::new(name, |v| matches!(v, VariableValue::Null), None, VariableKind::Null),
            "string" => Self::new(
                name,
                |v| matches!(v, VariableValue::String(_)),
                None,
                VariableKind::String,
            ),
            "boolean" => Self::new(
                name,
                |v| matches!(v, VariableValue::Boolean(_)),
                Some(Converter::BooleanToString),
                VariableKind::String,
            ),
            "char" => Self::new(
                name,
                |v| matches!(v, VariableValue::Char(_)),
                Some(Converter::CharToString),
                VariableKind::String,
            ),
            "long" => Self::new(name, |v| matches!(v, VariableValue::Long(_)), None, VariableKind::Long),
            "double" => Self::new(
                name,
                |v| matches!(v, VariableValue::Double(_)),
                None,
                VariableKind::Double,
            ),
            "date" => Self::new(name, |v| matches!(v, VariableValue::Date(_)), None, VariableKind::Date),
            "bytes" => Self::new(
                name,
                |v| matches!(v, VariableValue::Bytes(_)),
                None,
                VariableKind::ByteArray,
            ),
            "json" => Self::new(
                name,
                |v| matches!(v, VariableValue::Json(_)),
                Some(Converter::JsonToBytes),
                VariableKind::ByteArray,
            ),
            "entity" => Self::new(
                name,
                |v| matches!(v, VariableValue::Entity(_)),
                None,
                VariableKind::Entity,
            ),
            _ => return None,
        };
        Some(mapping)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn converter(&self) -> Option<Converter> {
        self.converter
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    /// True when the predicate accepts the value and any converter supports it.
    pub fn matches(&self, value: &VariableValue) -> bool {
        (self.matcher)(value) && self.converter.map_or(true, |c| c.supports(value))
    }
}

impl fmt::Debug for TypeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMapping")
            .field("name", &self.name)
            .field("converter", &self.converter)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Ordered registry of type mappings, validated when built.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    mappings: Vec<TypeMapping>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self {
            mappings: DEFAULT_TYPES
                .iter()
                .filter_map(|name| TypeMapping::builtin(name))
                .collect(),
        }
    }
}

impl TypeRegistry {
    /// An empty registry: every value becomes unpersistable.
    pub fn empty() -> Self {
        Self {
            mappings: Vec::new(),
        }
    }

    /// Builds a registry from built-in mapping names, in order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, VariableError> {
        let mappings = names
            .iter()
            .map(|name| {
                TypeMapping::builtin(name.as_ref())
                    .ok_or_else(|| VariableError::UnknownType(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { mappings })
    }

    /// Appends a custom mapping after the existing ones.
    pub fn push(&mut self, mapping: TypeMapping) {
        self.mappings.push(mapping);
    }

    /// First mapping that handles `value`.
    pub fn resolve(&self, value: &VariableValue) -> Option<&TypeMapping> {
        self.mappings.iter().find(|mapping| mapping.matches(value))
    }

    pub fn names(&self) -> Vec<&str> {
        self.mappings.iter().map(TypeMapping::name).collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::value::OpaqueValue;

    #[test]
    fn test_default_registry_order() {
        let registry = TypeRegistry::default();
        assert_eq!(registry.names(), DEFAULT_TYPES.to_vec());
    }

    #[test]
    fn test_resolve_picks_first_match() {
        let registry = TypeRegistry::default();
        let mapping = registry.resolve(&VariableValue::Boolean(true)).unwrap();
        assert_eq!(mapping.name(), "boolean");
        assert_eq!(mapping.kind(), VariableKind::String);
        assert_eq!(mapping.converter(), Some(Converter::BooleanToString));
    }

    #[test]
    fn test_opaque_values_have_no_mapping() {
        let registry = TypeRegistry::default();
        assert!(registry
            .resolve(&VariableValue::Opaque(OpaqueValue::new(3u8)))
            .is_none());
    }

    #[test]
    fn test_unknown_type_name_rejected() {
        let err = TypeRegistry::from_names(&["long", "decimal"]).unwrap_err();
        assert_eq!(err, VariableError::UnknownType("decimal".to_string()));
    }

    #[test]
    fn test_custom_mapping() {
        let mut registry = TypeRegistry::empty();
        registry.push(TypeMapping::new(
            "small-long",
            |v| matches!(v, VariableValue::Long(n) if *n < 100),
            None,
            VariableKind::Long,
        ));
        assert!(registry.resolve(&VariableValue::Long(5)).is_some());
        assert!(registry.resolve(&VariableValue::Long(500)).is_none());
    }

    #[test]
    fn test_converters_round_trip() {
        let stored = Converter::BooleanToString
            .convert(&VariableValue::Boolean(false))
            .unwrap();
        assert_eq!(stored, StoredValue::String("F".to_string()));
        assert_eq!(
            Converter::BooleanToString.revert(&stored).unwrap(),
            VariableValue::Boolean(false)
        );

        let json = VariableValue::Json(serde_json::json!({"a": [1, 2]}));
        let stored = Converter::JsonToBytes.convert(&json).unwrap();
        assert_eq!(Converter::JsonToBytes.revert(&stored).unwrap(), json);
    }
}
