//! Stored variable instances.

use chrono::NaiveDateTime;
use serde::ser::Error as _;
use serde::{Serialize, Serializer};

use super::types::{Converter, TypeRegistry, VariableKind};
use super::value::{EntityRef, VariableValue};
use super::VariableError;
use crate::execution::TokenId;

/// Persistable representation of a variable value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum StoredValue {
    Null,
    String(String),
    Long(i64),
    Double(f64),
    Date(NaiveDateTime),
    Bytes(Vec<u8>),
    Entity(EntityRef),
    /// Holds the runtime value until the persistence checkpoint rejects it
    #[serde(serialize_with = "reject_unpersistable")]
    Unpersistable(Box<VariableValue>),
}

#[allow(clippy::borrowed_box)]
fn reject_unpersistable<S: Serializer>(value: &Box<VariableValue>, _: S) -> Result<S::Ok, S::Error> {
    Err(S::Error::custom(format!(
        "a {} value has no persistable form",
        value.type_name()
    )))
}

impl StoredValue {
    fn from_plain(value: VariableValue) -> Result<Self, VariableValue> {
        match value {
            VariableValue::Null => Ok(Self::Null),
            VariableValue::String(s) => Ok(Self::String(s)),
            VariableValue::Long(n) => Ok(Self::Long(n)),
            VariableValue::Double(n) => Ok(Self::Double(n)),
            VariableValue::Date(d) => Ok(Self::Date(d)),
            VariableValue::Bytes(b) => Ok(Self::Bytes(b)),
            VariableValue::Entity(e) => Ok(Self::Entity(e)),
            other => Err(other),
        }
    }

    fn to_plain(&self) -> VariableValue {
        match self {
            Self::Null => VariableValue::Null,
            Self::String(s) => VariableValue::String(s.clone()),
            Self::Long(n) => VariableValue::Long(*n),
            Self::Double(n) => VariableValue::Double(*n),
            Self::Date(d) => VariableValue::Date(*d),
            Self::Bytes(b) => VariableValue::Bytes(b.clone()),
            Self::Entity(e) => VariableValue::Entity(e.clone()),
            Self::Unpersistable(value) => value.as_ref().clone(),
        }
    }
}

/// A named value owned by one token's variable container.
///
/// The storage shape is fixed when the instance is created; setting a value
/// the instance can't hold is an error, and callers replace the instance
/// instead (see [`VariableInstance::supports`]).
#[derive(Debug, Clone, Serialize)]
pub struct VariableInstance {
    name: String,
    token: TokenId,
    kind: VariableKind,
    converter: Option<Converter>,
    value: StoredValue,
}

impl VariableInstance {
    /// Creates an instance using the first registry mapping that accepts
    /// `value`. Values no mapping accepts become unpersistable instances;
    /// that only fails later, at the persistence checkpoint.
    pub fn create(
        token: TokenId,
        name: &str,
        value: VariableValue,
        registry: &TypeRegistry,
    ) -> Result<Self, VariableError> {
        let (kind, converter) = match registry.resolve(&value) {
            Some(mapping) => (mapping.kind(), mapping.converter()),
            None => (VariableKind::Unpersistable, None),
        };

        let mut instance = Self {
            name: name.to_string(),
            token,
            kind,
            converter,
            value: StoredValue::Null,
        };
        instance.set_value(value)?;
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> TokenId {
        self.token
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn converter(&self) -> Option<Converter> {
        self.converter
    }

    pub fn stored(&self) -> &StoredValue {
        &self.value
    }

    pub fn is_persistable(&self) -> bool {
        self.kind != VariableKind::Unpersistable
    }

    /// Whether `value` can be stored in this instance as is.
    pub fn supports(&self, value: &VariableValue) -> bool {
        match self.converter {
            Some(converter) => converter.supports(value),
            None => self.kind.accepts(value),
        }
    }

    pub fn set_value(&mut self, value: VariableValue) -> Result<(), VariableError> {
        let stored = if self.kind == VariableKind::Unpersistable {
            StoredValue::Unpersistable(Box::new(value))
        } else if let Some(converter) = self.converter {
            if !converter.supports(&value) {
                return Err(self.unsupported(&value));
            }
            converter
                .convert(&value)
                .map_err(|reason| VariableError::Conversion {
                    name: self.name.clone(),
                    reason,
                })?
        } else {
            StoredValue::from_plain(value).map_err(|value| self.unsupported(&value))?
        };

        if !self.kind.is_storable(&stored) {
            return Err(VariableError::Unsupported {
                name: self.name.clone(),
                kind: self.kind,
                value_type: format!("{:?}", stored),
            });
        }

        self.value = stored;
        Ok(())
    }

    /// Current value, reverting any conversion.
    pub fn value(&self) -> Result<VariableValue, VariableError> {
        match self.converter {
            Some(converter) => {
                converter
                    .revert(&self.value)
                    .map_err(|reason| VariableError::Conversion {
                        name: self.name.clone(),
                        reason,
                    })
            }
            None => Ok(self.value.to_plain()),
        }
    }

    fn unsupported(&self, value: &VariableValue) -> VariableError {
        VariableError::Unsupported {
            name: self.name.clone(),
            kind: self.kind,
            value_type: value.type_name().to_string(),
        }
    }
}
