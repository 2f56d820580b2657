/*
    screen.rs - Filter a peer value through the declared access levels

    The peer value is walked alongside its declared type, combining levels
    at each nesting step the same way a path is resolved. Wherever the
    computed level is reject and the peer's subtree differs from the
    server's, the server's subtree is kept and the location is reported.
    Keys the peer dropped are restored when their level is reject.
*/

use serde_json::{Map, Value as JsonValue};

use super::{combine, AccessLevel};
use crate::types::{PropertyType, TypeKind};

/// A peer value with every refused subtree put back to the server's
#[derive(Debug, Clone, PartialEq)]
pub struct Screened {
    /// `None` only when the value was refused as a whole and the server
    /// holds nothing at that location
    pub value: Option<JsonValue>,
    /// Locations of refused subtrees, relative to the screened value
    pub denied: Vec<String>,
}

impl Screened {
    pub fn is_clean(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Screen `incoming` at computed level `level` against the server's
/// `current` value; `at` prefixes every reported location
pub fn screen_incoming(
    ty: &PropertyType,
    level: AccessLevel,
    current: Option<&JsonValue>,
    incoming: JsonValue,
    at: &str,
) -> Screened {
    let mut denied = Vec::new();
    let value = screen(ty, level, current, incoming, at, &mut denied);
    Screened { value, denied }
}

fn screen(
    ty: &PropertyType,
    level: AccessLevel,
    current: Option<&JsonValue>,
    incoming: JsonValue,
    at: &str,
    denied: &mut Vec<String>,
) -> Option<JsonValue> {
    if !level.permits_peer_mutation() {
        if current == Some(&incoming) {
            return Some(incoming);
        }
        denied.push(at.to_string());
        return current.cloned();
    }

    match (&ty.kind, incoming) {
        (TypeKind::Array { element }, JsonValue::Array(items)) => {
            let element_level = combine(level, element.access);
            let current_items = current.and_then(JsonValue::as_array);
            let current_len = current_items.map_or(0, Vec::len);
            // elements the peer may not touch cannot be added or removed either
            if !element_level.permits_peer_mutation() && current_len != items.len() {
                denied.push(at.to_string());
                return current.cloned();
            }

            let mut screened = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let before = current_items.and_then(|c| c.get(index));
                let location = format!("{}[{}]", at, index);
                if let Some(kept) = screen(element, element_level, before, item, &location, denied) {
                    screened.push(kept);
                }
            }
            Some(JsonValue::Array(screened))
        }
        (TypeKind::Object { .. }, JsonValue::Object(entries)) => {
            let fallback = PropertyType::any();
            let current_entries = current.and_then(JsonValue::as_object);
            let mut screened = Map::new();

            for (key, entry) in entries {
                let entry_ty = ty.field_type(&key).unwrap_or(&fallback);
                let entry_level = combine(level, entry_ty.access);
                let before = current_entries.and_then(|c| c.get(&key));
                let location = format!("{}.{}", at, key);
                if let Some(kept) = screen(entry_ty, entry_level, before, entry, &location, denied) {
                    screened.insert(key, kept);
                }
            }

            for (key, old) in current_entries.into_iter().flatten() {
                if screened.contains_key(key) {
                    continue;
                }
                let entry_level = combine(level, ty.field_type(key).and_then(|t| t.access));
                if !entry_level.permits_peer_mutation() {
                    denied.push(format!("{}.{}", at, key));
                    screened.insert(key.clone(), old.clone());
                }
            }
            Some(JsonValue::Object(screened))
        }
        (_, other) => Some(other),
    }
}
