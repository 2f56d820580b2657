/*
    value.rs - Wrapped property values

    Raw arrays and objects are wrapped into versioned containers when they
    enter a property slot; everything else is kept as plain JSON. Equality
    is by content, never by identity or version.
*/

use serde_json::Value as JsonValue;

use crate::access::AccessLevel;
use crate::container::{IncomingOutcome, VersionedArray, VersionedContainer, VersionedMap};
use crate::error::{SyncError, SyncResult};
use crate::types::PropertyType;
use crate::wire::ContainerUpdate;

#[derive(Debug, Clone)]
pub enum Value {
    /// Scalar or null
    Plain(JsonValue),
    Array(VersionedArray),
    Map(VersionedMap),
}

/// Conversion used by `wrap`; already wrapped values pass through unchanged
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for JsonValue {
    fn into_value(self) -> Value {
        Value::from_json(self)
    }
}

impl IntoValue for VersionedArray {
    fn into_value(self) -> Value {
        Value::Array(self)
    }
}

impl IntoValue for VersionedMap {
    fn into_value(self) -> Value {
        Value::Map(self)
    }
}

macro_rules! into_value_via_json {
    ($($ty:ty),*) => {
        $(impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::Plain(JsonValue::from(self))
            }
        })*
    };
}

into_value_via_json!(bool, i32, i64, u32, u64, f64, String, &str);

/// Wrap a raw value for storage
pub fn wrap(raw: impl IntoValue) -> Value {
    raw.into_value()
}

impl From<JsonValue> for Value {
    fn from(raw: JsonValue) -> Self {
        Value::from_json(raw)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Plain(a), Value::Plain(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.content_eq(b),
            (Value::Map(a), Value::Map(b)) => a.content_eq(b),
            _ => false,
        }
    }
}

impl Value {
    /// Wrap raw JSON, turning every array/object level into a container
    pub fn from_json(raw: JsonValue) -> Self {
        match raw {
            JsonValue::Array(items) => Value::Array(VersionedArray::from_values(items)),
            JsonValue::Object(entries) => Value::Map(VersionedMap::from_entries(entries)),
            other => Value::Plain(other),
        }
    }

    /// Wrap a value that arrived from the peer; only version
    /// acknowledgements are pending afterwards
    pub fn adopt_incoming(raw: JsonValue) -> Self {
        let mut value = Value::from_json(raw);
        value.adopt();
        value
    }

    pub(crate) fn adopt(&mut self) {
        match self {
            Value::Plain(_) => {}
            Value::Array(array) => array.adopt(),
            Value::Map(map) => map.adopt(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Plain(raw) => raw.clone(),
            Value::Array(array) => array.to_json(),
            Value::Map(map) => map.to_json(),
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, Value::Plain(_))
    }

    pub fn as_plain(&self) -> Option<&JsonValue> {
        match self {
            Value::Plain(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&VersionedArray> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut VersionedArray> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&VersionedMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut VersionedMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Pending container changes; plain values never have any
    pub fn has_changes(&self) -> bool {
        match self {
            Value::Plain(_) => false,
            Value::Array(array) => array.has_changes(),
            Value::Map(map) => map.has_changes(),
        }
    }

    /// Full wire value; nested containers are emitted at a new version
    pub fn full_wire(&mut self) -> JsonValue {
        match self {
            Value::Plain(raw) => raw.clone(),
            Value::Array(array) => array.emit_full().to_json(),
            Value::Map(map) => map.emit_full().to_json(),
        }
    }

    /// Container changes since the last emission, `None` if there are none
    pub fn changes_wire(&mut self) -> Option<JsonValue> {
        match self {
            Value::Plain(_) => None,
            Value::Array(array) => array.to_wire().to_json_unless_noop(),
            Value::Map(map) => map.to_wire().to_json_unless_noop(),
        }
    }

    /// Apply a versioned update (full or granular) from the peer
    pub fn apply_incoming_wire(
        &mut self,
        raw: &JsonValue,
        ty: &PropertyType,
        level: AccessLevel,
    ) -> SyncResult<IncomingOutcome> {
        match self {
            Value::Array(array) => Ok(array.apply_incoming(ContainerUpdate::from_json(raw.clone())?, ty, level)),
            Value::Map(map) => Ok(map.apply_incoming(ContainerUpdate::from_json(raw.clone())?, ty, level)),
            Value::Plain(_) => Err(SyncError::MalformedUpdate(
                "versioned update for a plain value".to_string(),
            )),
        }
    }

    pub fn attach(&mut self) {
        match self {
            Value::Plain(_) => {}
            Value::Array(array) => array.attach(),
            Value::Map(map) => map.attach(),
        }
    }

    pub fn detach(&mut self) {
        match self {
            Value::Plain(_) => {}
            Value::Array(array) => array.detach(),
            Value::Map(map) => map.detach(),
        }
    }

    pub fn is_attached(&self) -> bool {
        match self {
            Value::Plain(_) => false,
            Value::Array(array) => array.is_attached(),
            Value::Map(map) => map.is_attached(),
        }
    }
}

/// How an element changed when mutated in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementChange {
    Ref,
    Content,
}

/// Classify an in-place mutation; `before` holds the old value when it was
/// plain. Containers swapped for a fresh one count as ref changes, and
/// changes under an unattached parent are always sent by reference.
pub(crate) fn classify_in_place(
    before: Option<Value>,
    after: &mut Value,
    parent_attached: bool,
) -> Option<ElementChange> {
    match before {
        Some(old) if *after == old => None,
        Some(_) => {
            if parent_attached {
                after.attach();
            }
            Some(ElementChange::Ref)
        }
        None if !after.is_container() => Some(ElementChange::Ref),
        None if parent_attached && !after.is_attached() => {
            after.attach();
            Some(ElementChange::Ref)
        }
        None if !after.has_changes() => None,
        None if parent_attached => Some(ElementChange::Content),
        None => Some(ElementChange::Ref),
    }
}
