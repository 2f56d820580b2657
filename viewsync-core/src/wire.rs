/*
    wire.rs - JSON shapes exchanged with the peer

    Full value:        { "version": n, "value": <array|object> }
    Granular update:   { "version": n, "updates": [ ... ] }
    No-op marker:      { "noop": true }

    Inside a full value every nested array/object is itself written as a
    full value, so each nesting level carries its own version.
*/

use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{SyncError, SyncResult};

/// Full value of a container together with its content version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    /// Raw array/object whose nested containers are themselves full values
    pub value: JsonValue,
}

impl Snapshot {
    /// Plain JSON with every nested version wrapper removed
    pub fn unwrap(&self) -> JsonValue {
        unwrap_contents(&self.value)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "version": self.version, "value": self.value })
    }
}

/// One element-level operation inside a granular update
pub trait WireOp: Serialize + DeserializeOwned {
    fn to_json(&self) -> JsonValue;
}

/// What a container emits (or receives) for one round of changes
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerUpdate<Op> {
    Full(Snapshot),
    Granular { version: u64, updates: Vec<Op> },
    /// Nothing changed; distinct from a granular update with no ops
    NoOp,
}

impl<Op> ContainerUpdate<Op> {
    pub fn is_noop(&self) -> bool {
        matches!(self, ContainerUpdate::NoOp)
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            ContainerUpdate::Full(snapshot) => Some(snapshot.version),
            ContainerUpdate::Granular { version, .. } => Some(*version),
            ContainerUpdate::NoOp => None,
        }
    }

    pub fn updates(&self) -> &[Op] {
        match self {
            ContainerUpdate::Granular { updates, .. } => updates,
            _ => &[],
        }
    }
}

impl<Op: WireOp> ContainerUpdate<Op> {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ContainerUpdate::Full(snapshot) => snapshot.to_json(),
            ContainerUpdate::Granular { version, updates } => json!({
                "version": version,
                "updates": updates.iter().map(WireOp::to_json).collect::<Vec<_>>(),
            }),
            ContainerUpdate::NoOp => json!({ "noop": true }),
        }
    }

    pub fn to_json_unless_noop(&self) -> Option<JsonValue> {
        (!self.is_noop()).then(|| self.to_json())
    }

    pub fn from_json(raw: JsonValue) -> SyncResult<Self> {
        serde_json::from_value(raw).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
    }
}

impl<Op: Serialize> Serialize for ContainerUpdate<Op> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ContainerUpdate::Full(snapshot) => snapshot.serialize(serializer),
            ContainerUpdate::Granular { version, updates } => {
                let mut state = serializer.serialize_struct("Granular", 2)?;
                state.serialize_field("version", version)?;
                state.serialize_field("updates", updates)?;
                state.end()
            }
            ContainerUpdate::NoOp => {
                let mut state = serializer.serialize_struct("NoOp", 1)?;
                state.serialize_field("noop", &true)?;
                state.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UpdateRepr<Op> {
    Full { version: u64, value: JsonValue },
    Granular { version: u64, updates: Vec<Op> },
    NoOp { noop: bool },
}

impl<'de, Op: Deserialize<'de>> Deserialize<'de> for ContainerUpdate<Op> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match UpdateRepr::<Op>::deserialize(deserializer)? {
            UpdateRepr::Full { version, value } => ContainerUpdate::Full(Snapshot { version, value }),
            UpdateRepr::Granular { version, updates } => ContainerUpdate::Granular { version, updates },
            UpdateRepr::NoOp { .. } => ContainerUpdate::NoOp,
        })
    }
}

fn is_full_wrapper(map: &Map<String, JsonValue>) -> bool {
    map.len() == 2
        && map.get("version").is_some_and(JsonValue::is_u64)
        && map
            .get("value")
            .is_some_and(|v| v.is_array() || v.is_object())
}

/// True when `raw` is a granular update or no-op rather than a full value
pub fn is_granular(raw: &JsonValue) -> bool {
    raw.as_object()
        .is_some_and(|map| map.contains_key("updates") || map.contains_key("noop"))
}

/// True for anything a container can apply: a full value with its version,
/// a granular update or a no-op marker
pub fn is_versioned(raw: &JsonValue) -> bool {
    is_granular(raw) || raw.as_object().is_some_and(is_full_wrapper)
}

/// Strip version wrappers from a value sitting in element position
///
/// Objects that do not have the exact wrapper shape are taken as raw objects,
/// which keeps peer input lenient.
pub fn unwrap_full(raw: &JsonValue) -> JsonValue {
    match raw {
        JsonValue::Object(map) if is_full_wrapper(map) => unwrap_contents(&map["value"]),
        _ => unwrap_contents(raw),
    }
}

/// Strip version wrappers from the elements of a raw array/object
pub fn unwrap_contents(raw: &JsonValue) -> JsonValue {
    match raw {
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(unwrap_full).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), unwrap_full(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Encode a session message for the transport
pub fn encode<T: Serialize>(message: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a session message received from the transport
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Touch {
        key: String,
    }

    impl WireOp for Touch {
        fn to_json(&self) -> JsonValue {
            json!({ "key": self.key })
        }
    }

    #[test]
    fn test_noop_is_distinct_from_empty_update_list() {
        let noop: ContainerUpdate<Touch> = ContainerUpdate::NoOp;
        let empty: ContainerUpdate<Touch> = ContainerUpdate::Granular {
            version: 4,
            updates: vec![],
        };
        assert_eq!(noop.to_json(), json!({"noop": true}));
        assert_eq!(empty.to_json(), json!({"version": 4, "updates": []}));

        assert_eq!(
            ContainerUpdate::<Touch>::from_json(json!({"noop": true})).unwrap(),
            ContainerUpdate::NoOp
        );
        assert_eq!(
            ContainerUpdate::<Touch>::from_json(json!({"version": 4, "updates": []})).unwrap(),
            empty
        );
    }

    #[test]
    fn test_serialize_matches_to_json() {
        let update = ContainerUpdate::Granular {
            version: 2,
            updates: vec![Touch { key: "a".into() }],
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), update.to_json());

        let full: ContainerUpdate<Touch> = ContainerUpdate::Full(Snapshot {
            version: 7,
            value: json!([1]),
        });
        assert_eq!(serde_json::to_value(&full).unwrap(), json!({"version": 7, "value": [1]}));
    }

    #[test]
    fn test_unwrap_full_strips_nested_wrappers() {
        let wire = json!({
            "version": 3,
            "value": [1, {"version": 2, "value": {"a": {"version": 1, "value": [true]}}}]
        });
        assert_eq!(unwrap_full(&wire), json!([1, {"a": [true]}]));
    }

    #[test]
    fn test_user_data_shaped_like_a_wrapper_survives() {
        // the inner object is content, not a wrapper, because it sits directly
        // under an already-unwrapped level
        let wire = json!({
            "version": 5,
            "value": {"version": 1, "value": {"version": 1, "value": [2]}}
        });
        assert_eq!(unwrap_full(&wire), json!({"version": 1, "value": [2]}));
    }

    #[test]
    fn test_is_granular() {
        assert!(is_granular(&json!({"version": 1, "updates": []})));
        assert!(is_granular(&json!({"noop": true})));
        assert!(!is_granular(&json!({"version": 1, "value": []})));
        assert!(!is_granular(&json!(3)));
        assert!(is_versioned(&json!({"version": 1, "value": []})));
        assert!(!is_versioned(&json!({"a": 1})));
    }

    #[test]
    fn test_malformed_update_is_reported() {
        let err = ContainerUpdate::<Touch>::from_json(json!({"updates": 3})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedUpdate(_)));
    }
}
