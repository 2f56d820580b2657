//! The tagged capability interface: wrap / unwrap / to_wire / from_wire
//! resolved from a declared [`PropertyType`] instead of per-type classes.

use serde_json::Value as JsonValue;

use super::{PropertyType, TypeKind};
use crate::error::{SyncError, SyncResult};
use crate::value::Value;
use crate::wire;

/// Name of the JSON kind, for mismatch messages
pub fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

impl PropertyType {
    fn find_mismatch(&self, raw: &JsonValue, path: &str) -> Option<(String, &'static str, &'static str)> {
        // null always means "unset" and is accepted everywhere
        if raw.is_null() {
            return None;
        }
        let mismatch = || Some((path.to_string(), self.tag(), json_kind(raw)));
        match (&self.kind, raw) {
            (TypeKind::Any, _) => None,
            (TypeKind::Boolean, JsonValue::Bool(_)) => None,
            (TypeKind::Number, JsonValue::Number(_)) => None,
            (TypeKind::String, JsonValue::String(_)) => None,
            (TypeKind::Array { element }, JsonValue::Array(items)) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| element.find_mismatch(item, &format!("{}[{}]", path, i))),
            (TypeKind::Object { .. }, JsonValue::Object(entries)) => {
                entries.iter().find_map(|(key, entry)| {
                    self.field_type(key)
                        .and_then(|ty| ty.find_mismatch(entry, &format!("{}.{}", path, key)))
                })
            }
            _ => mismatch(),
        }
    }

    /// Fails with `TypeMismatch` naming the first offending location
    pub fn check(&self, property: &str, raw: &JsonValue) -> SyncResult<()> {
        match self.find_mismatch(raw, property) {
            None => Ok(()),
            Some((location, expected, found)) => Err(SyncError::TypeMismatch {
                property: location,
                expected: expected.to_string(),
                found: found.to_string(),
            }),
        }
    }

    /// Validate a raw value and wrap it for storage
    pub fn wrap(&self, property: &str, raw: JsonValue) -> SyncResult<Value> {
        self.check(property, &raw)?;
        Ok(Value::from_json(raw))
    }

    pub fn unwrap(&self, value: &Value) -> JsonValue {
        value.to_json()
    }

    /// Wire form of a stored value: the full value when `full`, otherwise
    /// only what changed since the last emission (`None` if nothing did)
    pub fn to_wire(&self, value: &mut Value, full: bool) -> Option<JsonValue> {
        if full {
            Some(value.full_wire())
        } else {
            value.changes_wire()
        }
    }

    /// Decode a full value received from the peer into plain JSON that
    /// matches this type
    pub fn from_wire(&self, property: &str, wire: &JsonValue) -> SyncResult<JsonValue> {
        let raw = wire::unwrap_full(wire);
        self.check(property, &raw)?;
        Ok(raw)
    }

    /// Own declared access level, if any
    pub fn access_level(&self) -> Option<crate::access::AccessLevel> {
        self.access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_reports_nested_location() {
        let ty = PropertyType::array_of(PropertyType::object([("n", PropertyType::number())]));

        assert!(ty.check("rows", &json!([{"n": 1}, {"n": 2, "extra": "x"}])).is_ok());

        let err = ty.check("rows", &json!([{"n": 1}, {"n": "two"}])).unwrap_err();
        assert_eq!(
            err,
            SyncError::TypeMismatch {
                property: "rows[1].n".to_string(),
                expected: "number".to_string(),
                found: "string".to_string(),
            }
        );
    }

    #[test]
    fn test_null_is_accepted() {
        assert!(PropertyType::string().check("text", &JsonValue::Null).is_ok());
        assert!(PropertyType::string().check("text", &json!(3)).is_err());
    }

    #[test]
    fn test_wrap_then_unwrap() {
        let ty = PropertyType::array_of(PropertyType::string());
        let value = ty.wrap("tags", json!(["a", "b"])).unwrap();
        assert!(value.as_array().is_some());
        assert_eq!(ty.unwrap(&value), json!(["a", "b"]));
    }

    #[test]
    fn test_from_wire_strips_nested_versions() {
        let ty = PropertyType::array_of(PropertyType::any());
        let raw = ty
            .from_wire("grid", &json!({"version": 3, "value": [{"version": 1, "value": [1, 2]}]}))
            .unwrap();
        assert_eq!(raw, json!([[1, 2]]));
    }

    #[test]
    fn test_from_wire_checks_the_decoded_value() {
        let ty = PropertyType::array_of(PropertyType::number());
        let err = ty.from_wire("sizes", &json!({"version": 2, "value": ["wide"]})).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. }));
    }
}
